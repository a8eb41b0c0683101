//! Correlation table matching editor replies to outstanding requests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ipc::error::ChannelError;
use crate::protocol::RequestId;

/// What a waiting caller eventually receives.
pub type Settlement = Result<Value, ChannelError>;

/// Stand-in deadline for timeouts too large to represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, clamped so huge timeouts never overflow.
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct PendingEntry {
    command: String,
    created_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Settlement>,
}

/// How a reply was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// The reply's id matched a pending entry.
    Matched(RequestId),
    /// The reply had no id and went to the oldest pending entry.
    Oldest(RequestId),
    /// The reply's id matched nothing (typically a late reply to an
    /// expired request).
    Unmatched,
    /// Nothing was pending.
    Empty,
}

/// Map from request id to the caller waiting on it.
///
/// An entry is removed from the map before its sender is used, and only
/// one code path can remove a given entry, so each entry is settled at most
/// once no matter how replies, timeouts and disconnects interleave.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<BTreeMap<RequestId, PendingEntry>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RequestId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and get the receiver its settlement arrives on.
    pub fn register(
        &self,
        id: RequestId,
        command: &str,
        deadline: Instant,
    ) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            command: command.to_string(),
            created_at: Instant::now(),
            deadline,
            tx,
        };
        self.lock().insert(id, entry);
        rx
    }

    /// Route a settlement for a reply carrying `reply_id`.
    ///
    /// Replies without an id go to the oldest pending entry. This is a
    /// best-effort fallback for editor builds that omit ids and can
    /// misroute if several requests are in flight.
    pub fn resolve(&self, reply_id: Option<&str>, settlement: Settlement) -> Routing {
        let (routing, entry) = {
            let mut entries = self.lock();
            if entries.is_empty() {
                return Routing::Empty;
            }
            match reply_id {
                Some(raw) => match RequestId::parse(raw).and_then(|id| entries.remove_entry(&id)) {
                    Some((id, entry)) => (Routing::Matched(id), entry),
                    None => return Routing::Unmatched,
                },
                None => match entries.pop_first() {
                    Some((id, entry)) => (Routing::Oldest(id), entry),
                    None => return Routing::Empty,
                },
            }
        };

        debug!(
            "Settled {} ({:?}) after {:?}",
            entry.command,
            routing,
            entry.created_at.elapsed()
        );
        let _ = entry.tx.send(settlement);
        routing
    }

    /// Remove an entry without settling it. Returns `false` if it was
    /// already settled by someone else.
    pub fn take(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Settle every pending entry with an error, draining the table.
    pub fn reject_all(&self, error: &ChannelError) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    /// Reject every entry whose deadline has passed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(RequestId, PendingEntry)> = {
            let mut entries = self.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove_entry(&id))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            let after = entry.deadline.saturating_duration_since(entry.created_at);
            warn!("Command {} ({}) expired after {:?}", id, entry.command, after);
            let _ = entry.tx.send(Err(ChannelError::Timeout {
                command: entry.command,
                after_ms: after.as_millis() as u64,
            }));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_resolve_by_id() {
        let table = CorrelationTable::new();
        let rx1 = table.register(RequestId::new(1), "ping", later());
        let rx2 = table.register(RequestId::new(2), "ping", later());

        let routing = table.resolve(Some("2"), Ok(json!({"n": 2})));
        assert_eq!(routing, Routing::Matched(RequestId::new(2)));
        let routing = table.resolve(Some("1"), Ok(json!({"n": 1})));
        assert_eq!(routing, Routing::Matched(RequestId::new(1)));

        assert_eq!(rx1.await.unwrap().unwrap(), json!({"n": 1}));
        assert_eq!(rx2.await.unwrap().unwrap(), json!({"n": 2}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_missing_id_resolves_oldest() {
        let table = CorrelationTable::new();
        let rx5 = table.register(RequestId::new(5), "a", later());
        let _rx9 = table.register(RequestId::new(9), "b", later());

        let routing = table.resolve(None, Ok(json!("first")));

        assert_eq!(routing, Routing::Oldest(RequestId::new(5)));
        assert_eq!(rx5.await.unwrap().unwrap(), json!("first"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unmatched_and_empty_are_dropped() {
        let table = CorrelationTable::new();
        assert_eq!(table.resolve(None, Ok(json!({}))), Routing::Empty);
        assert_eq!(table.resolve(Some("3"), Ok(json!({}))), Routing::Empty);

        let _rx = table.register(RequestId::new(1), "ping", later());
        assert_eq!(table.resolve(Some("3"), Ok(json!({}))), Routing::Unmatched);
        assert_eq!(table.resolve(Some("cmd-abc"), Ok(json!({}))), Routing::Unmatched);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_settles_at_most_once() {
        let table = CorrelationTable::new();
        let rx = table.register(RequestId::new(1), "ping", later());

        assert_eq!(
            table.resolve(Some("1"), Ok(json!("reply"))),
            Routing::Matched(RequestId::new(1))
        );
        // A timeout racing the reply finds nothing left to take.
        assert!(!table.take(RequestId::new(1)));
        assert_eq!(table.reject_all(&ChannelError::ConnectionClosed), 0);
        assert_eq!(table.sweep_expired(Instant::now() + Duration::from_secs(60)), 0);

        assert_eq!(rx.await.unwrap().unwrap(), json!("reply"));
    }

    #[tokio::test]
    async fn test_reject_all_drains() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (1..=3)
            .map(|i| table.register(RequestId::new(i), "ping", later()))
            .collect();

        assert_eq!(table.reject_all(&ChannelError::ConnectionClosed), 3);
        assert!(table.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(ChannelError::ConnectionClosed));
        }
    }

    #[test]
    fn test_deadline_after_clamps_huge_timeouts() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(1)), now + Duration::from_secs(1));

        let clamped = deadline_after(now, Duration::MAX);
        assert!(clamped > now + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test]
    async fn test_sweep_expired_only_rejects_past_deadline() {
        let table = CorrelationTable::new();
        let now = Instant::now();
        let stale = table.register(RequestId::new(1), "slow", now + Duration::from_millis(10));
        let _fresh = table.register(RequestId::new(2), "fast", now + Duration::from_secs(60));

        let swept = table.sweep_expired(now + Duration::from_millis(20));

        assert_eq!(swept, 1);
        assert_eq!(table.len(), 1);
        match stale.await.unwrap() {
            Err(ChannelError::Timeout { command, .. }) => assert_eq!(command, "slow"),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
