use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Error;

/// How the caller wants the payload delivered. Both modes resolve to the
/// same `Bytes` delivery here since zero-copy is an allocation strategy, not
/// a different wire path — kept as an explicit tag anyway so callers can
/// still express the intent and a future allocator-aware path can branch on
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Buffered,
    ZeroCopy,
}

/// One outstanding `GET_BLOCK` request. Freed once its reply has been
/// delivered to the caller.
pub struct PendingRequest {
    pub offset: u64,
    pub length: u32,
    pub enqueued_at: Instant,
    pub handle: u64,
    pub mode: ReplyMode,
    completion: oneshot::Sender<Result<Bytes, Error>>,
}

impl PendingRequest {
    pub fn new(
        offset: u64,
        length: u32,
        handle: u64,
        mode: ReplyMode,
        completion: oneshot::Sender<Result<Bytes, Error>>,
    ) -> Self {
        PendingRequest {
            offset,
            length,
            enqueued_at: Instant::now(),
            handle,
            mode,
            completion,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// Delivers the final result to the caller, consuming `self`.
    pub fn complete(self, result: Result<Bytes, Error>) {
        // Caller may have dropped its receiver; that's not this layer's
        // problem to report.
        let _ = self.completion.send(result);
    }
}
