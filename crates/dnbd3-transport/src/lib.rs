//! TCP connection establishment for DNBD3: race a set of candidate hosts
//! against a per-candidate timeout and an overall deadline, returning the
//! first one that connects.
//!
//! Generalizes a single connect-with-timeout into "N candidates, two
//! timeout tiers": a per-candidate deadline and an overall one.

pub mod error;

pub use error::TransportError;

use std::time::Duration;

use dnbd3_proto::Host;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Establishes TCP connections against a set of candidate [`Host`]s.
///
/// Stateless by design: every call races a fresh batch of attempts. Callers
/// that need sticky reconnect behavior (the client's alt-server switching,
/// the server's uplink fan-out) build that on top of repeated `connect_any`
/// calls rather than this type holding any retry state itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketPool;

impl SocketPool {
    pub fn new() -> Self {
        SocketPool
    }

    /// Connects to the first of `candidates` that accepts within
    /// `per_target`, itself bounded by an `overall` deadline across the
    /// whole race.
    ///
    /// Returns the connected stream together with the [`Host`] it reached,
    /// so callers don't have to re-derive which candidate won.
    pub async fn connect_any(
        &self,
        candidates: &[Host],
        per_target: Duration,
        overall: Duration,
    ) -> Result<(TcpStream, Host), TransportError> {
        if candidates.is_empty() {
            return Err(TransportError::AllRefused(0));
        }

        let mut attempts = FuturesUnordered::new();
        for host in candidates {
            let host = *host;
            attempts.push(async move {
                let addr = host
                    .to_socket_addr()
                    .ok_or_else(|| std::io::Error::other("host has no valid socket address"))?;
                match timeout(per_target, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => Ok((stream, host)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "per-target connect timeout",
                    )),
                }
            });
        }

        let race = async {
            let mut refused = 0usize;
            while let Some(result) = attempts.next().await {
                match result {
                    Ok((stream, host)) => {
                        log::debug!("connected to {host}");
                        return Ok((stream, host));
                    }
                    Err(e) => {
                        log::debug!("candidate connect failed: {e}");
                        refused += 1;
                    }
                }
            }
            Err(TransportError::AllRefused(refused))
        };

        match timeout(overall, race).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Exhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_first_reachable_candidate() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        // Unreachable candidate first: a closed loopback port refuses
        // immediately, so the pool should still find the real listener.
        let dead = Host::new_v4(Ipv4Addr::LOCALHOST, 1);
        let live = Host::new_v4(Ipv4Addr::LOCALHOST, addr.port());

        let pool = SocketPool::new();
        let (_, host) = pool
            .connect_any(&[dead, live], Duration::from_millis(200), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(host.port(), addr.port());
    }

    #[tokio::test]
    async fn all_refused_when_no_candidate_listens() {
        let pool = SocketPool::new();
        let dead1 = Host::new_v4(Ipv4Addr::LOCALHOST, 1);
        let dead2 = Host::new_v4(Ipv4Addr::LOCALHOST, 2);
        let result = pool
            .connect_any(&[dead1, dead2], Duration::from_millis(200), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::AllRefused(2))));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_refused_without_waiting() {
        let pool = SocketPool::new();
        let result = pool
            .connect_any(&[], Duration::from_millis(50), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::AllRefused(0))));
    }
}
