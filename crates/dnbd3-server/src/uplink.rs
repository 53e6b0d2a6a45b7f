//! Per-image uplink: forwards cache-miss ranges to an upstream peer,
//! coalesces overlapping client requests onto one upstream fetch where
//! possible, persists payloads into the local cache file, and fans each
//! reply back out to the clients waiting on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dnbd3_proto::{
    crc32_of_crc_list, Command, Crc32Reply, ReplyHeader, RequestHeader, SelectImageReply, SelectImageRequest,
};
use dnbd3_transport::SocketPool;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::alt_server::AltServerRegistry;
use crate::error::Error;
use crate::image::Image;
use crate::integrity::IntegrityChecker;

/// Upper bound on the queue's growth: it extends past its initial
/// allocation as needed, up to this limit, beyond which new requests are
/// refused.
pub const MAX_QUEUE_LEN: usize = 512;

/// A server replying with more than this to one `GET_BLOCK` is treated as
/// fatal for the upstream connection.
pub const MAX_REPLY_SIZE: u64 = 9 * 1024 * 1024;

/// How long a `Pending` entry may sit unanswered before a starvation
/// warning is logged.
pub const STARVATION_THRESHOLD: Duration = Duration::from_secs(10);

/// Cadence of the uplink loop's periodic timer tick.
const PERIODIC_TICK: Duration = Duration::from_secs(1);

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque back-reference to whichever per-client connection submitted a
/// request... hold
/// back-references by client-id, never by raw pointer". The connection
/// layer itself lives outside this crate; this is just an identifier it
/// chooses and later passes to [`Uplink::remove_client`].
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuedState {
    New,
    Pending,
}

struct UplinkQueued {
    state: QueuedState,
    from: u64,
    to: u64,
    client_id: ClientId,
    enqueued_at: Instant,
    completion: oneshot::Sender<Result<Bytes, Error>>,
}

/// Per-image uplink worker. Created lazily the first time an incomplete
/// image serves a request, torn down once the image completes or is
/// removed. Holds its image by a strong `Arc`; the image only ever holds
/// this back by `Weak`, so the task's own lifetime — not a reference
/// cycle — is what keeps an `Uplink` alive.
pub struct Uplink {
    image: Arc<Image>,
    queue: SyncMutex<VecDeque<UplinkQueued>>,
    new_work: mpsc::Sender<Event>,
    shutdown: AtomicBool,
    conn_generation: AtomicU64,
}

enum Event {
    NewWork,
    UpstreamReply(u64, ReplyHeader, Bytes),
    UpstreamClosed(u64, String),
}

impl Uplink {
    /// Spawns the uplink's event loop and returns the handle. The caller
    /// (the image/registry layer) is expected to install `Arc::downgrade`
    /// of the return value onto the image via [`Image::set_uplink`].
    pub fn spawn(image: Arc<Image>, alt_servers: Arc<AltServerRegistry>, integrity: Arc<IntegrityChecker>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let uplink = Arc::new(Uplink {
            image,
            queue: SyncMutex::new(VecDeque::new()),
            new_work: tx,
            shutdown: AtomicBool::new(false),
            conn_generation: AtomicU64::new(0),
        });

        let task_uplink = Arc::clone(&uplink);
        tokio::spawn(async move {
            task_uplink.run(rx, alt_servers, integrity).await;
        });

        uplink
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// Requests shutdown: the event loop exits once it next wakes, after
    /// draining any in-flight upstream reply.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.new_work.try_send(Event::NewWork);
    }

    /// Enqueues a cache-miss range for `client_id`. Coalesces into an
    /// existing `New`/`Pending` entry that already covers `[offset, offset
    /// + length)`, inserting the new entry immediately after its subsumer
    /// so fan-out observes it in the same pass.
    pub async fn request(
        self: &Arc<Self>,
        client_id: ClientId,
        offset: u64,
        length: u32,
    ) -> Result<oneshot::Receiver<Result<Bytes, Error>>, Error> {
        let to = offset + length as u64;
        let (tx, rx) = oneshot::channel();

        {
            let mut queue = self.queue.lock();
            let subsumer = queue
                .iter()
                .position(|e| matches!(e.state, QueuedState::New | QueuedState::Pending) && offset >= e.from && to <= e.to);

            let entry = UplinkQueued {
                state: QueuedState::Pending,
                from: offset,
                to,
                client_id,
                enqueued_at: Instant::now(),
                completion: tx,
            };
            match subsumer {
                Some(pos) => queue.insert(pos + 1, entry),
                None => {
                    if queue.len() >= MAX_QUEUE_LEN {
                        return Err(Error::RequestQueueFull);
                    }
                    let mut entry = entry;
                    entry.state = QueuedState::New;
                    queue.push_back(entry);
                }
            }
        }

        // Best-effort: the event loop treats this as level-sensitive (any
        // pending signal is enough to make it re-scan the queue), so a full
        // channel just means a wakeup is already in flight.
        let _ = self.new_work.try_send(Event::NewWork);
        Ok(rx)
    }

    /// Drops every queued entry belonging to `client_id` without a reply —
    /// called when the owning connection has gone away. A by-id scan,
    /// never a raw pointer.
    pub fn remove_client(&self, client_id: ClientId) {
        self.queue.lock().retain(|e| e.client_id != client_id);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>, alt_servers: Arc<AltServerRegistry>, integrity: Arc<IntegrityChecker>) {
        let mut write_half: Option<OwnedWriteHalf> = None;
        let mut ticker = tokio::time::interval(PERIODIC_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(Event::NewWork) | None => {}
                        Some(Event::UpstreamReply(gen, header, payload)) => {
                            if gen == self.conn_generation.load(Ordering::SeqCst) {
                                if let Err(e) = self.handle_upstream_reply(header, payload, &integrity).await {
                                    log::warn!("uplink for {} dropping upstream connection: {e}", self.image.id);
                                    write_half = None;
                                }
                            }
                        }
                        Some(Event::UpstreamClosed(gen, reason)) => {
                            if gen == self.conn_generation.load(Ordering::SeqCst) {
                                log::debug!("uplink for {} upstream connection closed: {reason}", self.image.id);
                                write_half = None;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.log_starvation();
                }
            }

            if self.image.is_fully_populated() {
                if let Err(e) = self.image.mark_complete() {
                    log::warn!("failed to finalize complete image {}: {e}", self.image.id);
                }
                self.image.set_working(false);
                log::info!("image {} fully cached, shutting uplink down", self.image.id);
                break;
            }

            if write_half.is_none() && !self.shutdown.load(Ordering::SeqCst) {
                match self.acquire_upstream(&alt_servers, self.new_work.clone()).await {
                    Some(wh) => {
                        write_half = Some(wh);
                        self.image.set_working(true);
                    }
                    None => {
                        self.image.set_working(false);
                    }
                }
            }

            if let Some(wh) = write_half.as_mut() {
                if let Err(e) = self.flush_new_entries(wh).await {
                    log::warn!("uplink for {} write failed, dropping upstream: {e}", self.image.id);
                    write_half = None;
                }
            }
        }

        self.image.set_working(false);
        self.image.set_uplink(None);
        log::info!("uplink for {} exited", self.image.id);
    }

    fn log_starvation(&self) {
        let queue = self.queue.lock();
        for entry in queue.iter() {
            if matches!(entry.state, QueuedState::Pending) && entry.enqueued_at.elapsed() > STARVATION_THRESHOLD {
                log::warn!(
                    "uplink for {}: client {} range [{}, {}) pending for {:?}",
                    self.image.id,
                    entry.client_id,
                    entry.from,
                    entry.to,
                    entry.enqueued_at.elapsed()
                );
            }
        }
    }

    /// Connects to an uplink candidate and performs the `SELECT_IMAGE`
    /// handshake, spawning the reader task that feeds replies back into
    /// the event loop.
    async fn acquire_upstream(&self, alt_servers: &Arc<AltServerRegistry>, tx: mpsc::Sender<Event>) -> Option<OwnedWriteHalf> {
        let candidates = alt_servers.list_for_uplink(4, false);
        if candidates.is_empty() {
            return None;
        }

        let pool = SocketPool::new();
        let (stream, host) = match pool.connect_any(&candidates, UPSTREAM_CONNECT_TIMEOUT, UPSTREAM_CONNECT_TIMEOUT * 2).await {
            Ok(ok) => ok,
            Err(e) => {
                log::debug!("uplink for {} could not reach any candidate: {e}", self.image.id);
                return None;
            }
        };

        let (mut read_half, mut write_half) = stream.into_split();
        if let Err(e) = self.handshake(&mut read_half, &mut write_half).await {
            log::warn!("uplink for {} handshake with {host} failed: {e}", self.image.id);
            alt_servers.server_failed(host);
            return None;
        }

        if !self.image.has_crc_list() {
            if let Err(e) = self.fetch_crc_list(&mut read_half, &mut write_half).await {
                log::warn!("uplink for {} could not fetch CRC list from {host}: {e}", self.image.id);
            }
        }

        let gen = self.conn_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(reader_task(read_half, tx, gen));
        log::info!("uplink for {} now upstream of {host}", self.image.id);
        Some(write_half)
    }

    async fn handshake(&self, read_half: &mut OwnedReadHalf, write_half: &mut OwnedWriteHalf) -> Result<(), Error> {
        let request = SelectImageRequest::new(&self.image.id.name, self.image.id.rid, 0)?;
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            use binrw::BinWrite;
            request.write(&mut buf)?;
        }
        write_half.write_all(&buf.into_inner()).await?;

        let mut header_buf = [0u8; ReplyHeader::STRUCT_SIZE];
        read_half.read_exact(&mut header_buf).await?;
        let header = {
            use binrw::BinRead;
            ReplyHeader::read(&mut std::io::Cursor::new(&header_buf))?
        };
        header.check_magic()?;
        if header.cmd == Command::Error {
            return Err(Error::ImageUnavailable(self.image.id.to_string()));
        }

        let mut payload = vec![0u8; header.size as usize];
        read_half.read_exact(&mut payload).await?;
        let reply = {
            use binrw::BinRead;
            SelectImageReply::read(&mut std::io::Cursor::new(&payload))?
        };
        if reply.rid != self.image.id.rid {
            return Err(Error::ImageUnavailable(format!(
                "upstream offered rid {} for {}",
                reply.rid, self.image.id
            )));
        }
        Ok(())
    }

    /// Issues `GET_CRC32` to the already-handshaken upstream and populates
    /// the image's CRC list from the reply, verifying the master CRC before
    /// handing the per-hash-block list to [`Image::set_crc_list`].
    async fn fetch_crc_list(&self, read_half: &mut OwnedReadHalf, write_half: &mut OwnedWriteHalf) -> Result<(), Error> {
        let request = RequestHeader::new(Command::GetCrc32, 0, 0, 0, 0);
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            use binrw::BinWrite;
            request.write(&mut buf)?;
        }
        write_half.write_all(&buf.into_inner()).await?;

        let mut header_buf = [0u8; ReplyHeader::STRUCT_SIZE];
        read_half.read_exact(&mut header_buf).await?;
        let header = {
            use binrw::BinRead;
            ReplyHeader::read(&mut std::io::Cursor::new(&header_buf))?
        };
        header.check_magic()?;
        if header.cmd != Command::GetCrc32 {
            return Err(Error::ImageCorrupt(format!(
                "upstream replied to GET_CRC32 with command {:?}",
                header.cmd
            )));
        }

        let mut payload = vec![0u8; header.size as usize];
        read_half.read_exact(&mut payload).await?;
        let reply = {
            use binrw::BinRead;
            Crc32Reply::read(&mut std::io::Cursor::new(&payload))?
        };
        if crc32_of_crc_list(&reply.block_crcs) != reply.master_crc {
            return Err(Error::ImageCorrupt(format!("master CRC mismatch in GET_CRC32 reply for {}", self.image.id)));
        }

        self.image.set_crc_list(reply.block_crcs)?;
        Ok(())
    }

    /// Marshals every `New` entry into a back-to-back `GET_BLOCK` request,
    /// transitioning it to `Pending`. The offset is smuggled into the
    /// request handle so the reply can be routed back to its cache range
    /// without extra bookkeeping.
    async fn flush_new_entries(&self, write_half: &mut OwnedWriteHalf) -> std::io::Result<()> {
        let marshaled: Vec<(u64, u32, u64)> = {
            let mut queue = self.queue.lock();
            let mut out = Vec::new();
            for entry in queue.iter_mut() {
                if entry.state == QueuedState::New {
                    entry.state = QueuedState::Pending;
                    out.push((entry.from, (entry.to - entry.from) as u32, entry.from));
                }
            }
            out
        };
        if marshaled.is_empty() {
            return Ok(());
        }

        let mut buf = std::io::Cursor::new(Vec::new());
        for (offset, length, handle) in marshaled {
            let header = RequestHeader::new(Command::GetBlock, offset, length, 0, handle);
            use binrw::BinWrite;
            header
                .write(&mut buf)
                .map_err(|e| std::io::Error::other(format!("encoding GET_BLOCK: {e}")))?;
        }
        write_half.write_all(&buf.into_inner()).await
    }

    /// Persists an upstream reply, fans it out to every covered `Pending`
    /// client, and signals the integrity checker for any hash-block the
    /// write just completed.
    async fn handle_upstream_reply(&self, header: ReplyHeader, payload: Bytes, integrity: &Arc<IntegrityChecker>) -> Result<(), Error> {
        if header.cmd != Command::GetBlock {
            return Ok(());
        }
        if header.size as u64 > MAX_REPLY_SIZE {
            return Err(Error::ImageCorrupt(format!("upstream reply of {} bytes exceeds sane bound", header.size)));
        }

        let offset = header.handle;
        let end = offset + payload.len() as u64;

        let newly_complete = self.image.write_cached_range(offset, payload.clone()).await?;
        for hash_block in newly_complete {
            integrity.enqueue(Arc::clone(&self.image), hash_block).await;
        }

        let satisfied: Vec<UplinkQueued> = {
            let mut queue = self.queue.lock();
            let mut satisfied = Vec::new();
            let mut remaining = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.state == QueuedState::Pending && entry.from >= offset && entry.to <= end {
                    satisfied.push(entry);
                } else {
                    remaining.push_back(entry);
                }
            }
            *queue = remaining;
            satisfied
        };

        for entry in satisfied {
            let start = (entry.from - offset) as usize;
            let len = (entry.to - entry.from) as usize;
            let slice = payload.slice(start..start + len);
            let _ = entry.completion.send(Ok(slice));
        }

        Ok(())
    }
}

/// Reads `ReplyHeader` + payload pairs off the upstream socket until it
/// closes or a decode error occurs, forwarding each to the event loop.
/// Runs as its own task so the main loop's `tokio::select!` never has to
/// juggle an `Option<OwnedReadHalf>` branch directly.
async fn reader_task(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Event>, generation: u64) {
    loop {
        let mut header_buf = [0u8; ReplyHeader::STRUCT_SIZE];
        if let Err(e) = read_half.read_exact(&mut header_buf).await {
            let _ = tx.send(Event::UpstreamClosed(generation, e.to_string())).await;
            return;
        }
        let header = {
            use binrw::BinRead;
            match ReplyHeader::read(&mut std::io::Cursor::new(&header_buf)) {
                Ok(h) => h,
                Err(e) => {
                    let _ = tx.send(Event::UpstreamClosed(generation, e.to_string())).await;
                    return;
                }
            }
        };
        if header.check_magic().is_err() {
            let _ = tx.send(Event::UpstreamClosed(generation, "bad magic".to_string())).await;
            return;
        }
        if header.cmd == Command::Error {
            let _ = tx.send(Event::UpstreamClosed(generation, "upstream replied ERROR".to_string())).await;
            return;
        }

        let mut payload = vec![0u8; header.size as usize];
        if let Err(e) = read_half.read_exact(&mut payload).await {
            let _ = tx.send(Event::UpstreamClosed(generation, e.to_string())).await;
            return;
        }

        if tx.send(Event::UpstreamReply(generation, header, Bytes::from(payload))).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnbd3_proto::BLOCK_SIZE;

    fn make_image() -> (tempfile::TempDir, Arc<Image>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.r1");
        let image = Image::create(&path, "img", 1, 4 * BLOCK_SIZE).unwrap();
        (dir, image)
    }

    #[tokio::test]
    async fn subsumed_request_is_queued_directly_after_its_subsumer() {
        let (_dir, image) = make_image();
        let uplink = Uplink::spawn(image, Arc::new(AltServerRegistry::new()), Arc::new(IntegrityChecker::spawn()));
        uplink.shutdown();

        let _rx1 = uplink.request(1, 0, 2 * BLOCK_SIZE as u32).await.unwrap();
        let _rx2 = uplink.request(2, 0, BLOCK_SIZE as u32).await.unwrap();

        let queue = uplink.queue.lock();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].client_id, 1);
        assert_eq!(queue[1].client_id, 2);
        assert_eq!(queue[1].state, QueuedState::Pending);
    }

    #[tokio::test]
    async fn remove_client_drops_only_that_clients_entries() {
        let (_dir, image) = make_image();
        let uplink = Uplink::spawn(image, Arc::new(AltServerRegistry::new()), Arc::new(IntegrityChecker::spawn()));
        uplink.shutdown();

        let _rx1 = uplink.request(1, 0, BLOCK_SIZE as u32).await.unwrap();
        let _rx2 = uplink.request(2, BLOCK_SIZE, BLOCK_SIZE as u32).await.unwrap();
        uplink.remove_client(1);

        assert_eq!(uplink.queue_len(), 1);
        assert_eq!(uplink.queue.lock()[0].client_id, 2);
    }

    #[tokio::test]
    async fn upstream_reply_satisfies_every_covered_pending_entry() {
        let (_dir, image) = make_image();
        let integrity = Arc::new(IntegrityChecker::spawn());
        let uplink = Uplink::spawn(image, Arc::new(AltServerRegistry::new()), Arc::clone(&integrity));
        uplink.shutdown();

        let rx1 = uplink.request(1, 0, BLOCK_SIZE as u32).await.unwrap();
        let rx2 = uplink.request(2, BLOCK_SIZE, BLOCK_SIZE as u32).await.unwrap();

        let header = ReplyHeader::new(Command::GetBlock, (2 * BLOCK_SIZE) as u32, 0);
        let payload = Bytes::from(vec![0x42u8; (2 * BLOCK_SIZE) as usize]);
        uplink.handle_upstream_reply(header, payload, &integrity).await.unwrap();

        let data1 = rx1.await.unwrap().unwrap();
        let data2 = rx2.await.unwrap().unwrap();
        assert_eq!(data1.len(), BLOCK_SIZE as usize);
        assert_eq!(data2.len(), BLOCK_SIZE as usize);
        assert!(uplink.queue_len() == 0);
    }
}
