//! The pending-request table: every request id the actor has sent but not
//! yet completed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::wire::codec::{GenericResponseBody, ResponseBody, ResponseHeader};

/// Which body decoder a pending request expects its reply to go through.
/// Schema discovery and `call`/`eval` decode generically (arbitrary nested
/// MessagePack); every other operation decodes the fixed per-field tuple
/// encoding.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DecodeMode {
    Typed,
    Generic,
}

/// A reply, decoded according to the [`DecodeMode`] the issuer asked for.
#[derive(Debug)]
pub(crate) enum Reply {
    Typed(ResponseBody),
    Generic(GenericResponseBody),
}

pub(crate) type ReplySender = oneshot::Sender<Result<(ResponseHeader, Reply), TransportError>>;

pub(crate) struct PendingRequest {
    pub decode: DecodeMode,
    pub respond: ReplySender,
}

/// `HashMap<u32, PendingRequest>`, owned exclusively by the connection
/// actor task — never shared behind a lock. The entry count is additionally
/// mirrored into an `AtomicUsize` so that `Connection::request` can fail
/// fast against `max_pending_requests` without round-tripping to the actor.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u32, PendingRequest>,
    count: Arc<AtomicUsize>,
}

impl PendingTable {
    /// Build a table that mirrors its entry count into the given counter,
    /// so a `Connection` handle can fail fast against
    /// `max_pending_requests` without asking the actor.
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        PendingTable {
            entries: HashMap::new(),
            count,
        }
    }

    pub fn insert(&mut self, sync: u32, entry: PendingRequest) {
        self.entries.insert(sync, entry);
        self.count.store(self.entries.len(), Ordering::Relaxed);
    }

    pub fn remove(&mut self, sync: u32) -> Option<PendingRequest> {
        let removed = self.entries.remove(&sync);
        self.count.store(self.entries.len(), Ordering::Relaxed);
        removed
    }

    pub fn contains(&self, sync: u32) -> bool {
        self.entries.contains_key(&sync)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Complete every pending entry with a transport error and empty the
    /// table. Used on disconnect: "disconnect cancels every pending
    /// request."
    pub fn drain_with_error(&mut self, make_error: impl Fn() -> TransportError) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.respond.send(Err(make_error()));
        }
        self.count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_completes_every_entry_exactly_once() {
        let mut table = PendingTable::default();
        let mut receivers = Vec::new();
        for sync in 0..3 {
            let (tx, rx) = oneshot::channel();
            table.insert(
                sync,
                PendingRequest {
                    decode: DecodeMode::Typed,
                    respond: tx,
                },
            );
            receivers.push(rx);
        }

        table.drain_with_error(|| TransportError::ConnectionLost("closed".into()));

        assert_eq!(table.len(), 0);
        for rx in receivers {
            assert!(rx.await.unwrap().is_err());
        }
    }
}
