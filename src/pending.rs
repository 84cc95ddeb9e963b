use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hitl_protocol::ReviewOutcome;
use tokio::sync::oneshot;

/// What happened to a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The waiter received the outcome.
    Resolved,
    /// No entry under that id: never registered, already resolved or cleaned up.
    Unknown,
    /// The entry existed but its waiter had already given up.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub request_id: String,
    pub checkpoint_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingSlot {
    checkpoint_name: String,
    created_at: DateTime<Utc>,
    tx: oneshot::Sender<ReviewOutcome>,
}

/// request_id → write-once completion slot.
///
/// Resolving removes the entry, so the first resolution wins and later ones
/// find nothing. Entries that are never resolved are removed when the
/// [`PendingGuard`] returned by [`PendingTable::register`] is dropped.
#[derive(Debug, Default)]
pub struct PendingTable {
    slots: DashMap<String, PendingSlot>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Insert a slot for `request_id` and hand back the guard that owns the
    /// entry together with the receiving half the caller waits on.
    pub fn register(
        &self,
        request_id: &str,
        checkpoint_name: &str,
    ) -> (PendingGuard<'_>, oneshot::Receiver<ReviewOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            request_id.to_string(),
            PendingSlot {
                checkpoint_name: checkpoint_name.to_string(),
                created_at: Utc::now(),
                tx,
            },
        );
        let guard = PendingGuard {
            table: self,
            request_id: request_id.to_string(),
        };
        (guard, rx)
    }

    /// Resolve `request_id`. `outcome` receives the checkpoint name stored at
    /// registration and is only called when an entry exists.
    pub fn resolve<F>(&self, request_id: &str, outcome: F) -> Resolution
    where
        F: FnOnce(&str) -> ReviewOutcome,
    {
        match self.slots.remove(request_id) {
            Some((_, slot)) => {
                let value = outcome(&slot.checkpoint_name);
                match slot.tx.send(value) {
                    Ok(()) => Resolution::Resolved,
                    Err(_) => Resolution::Abandoned,
                }
            }
            None => Resolution::Unknown,
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.slots.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let mut out: Vec<PendingInfo> = self
            .slots
            .iter()
            .map(|entry| PendingInfo {
                request_id: entry.key().clone(),
                checkpoint_name: entry.value().checkpoint_name.clone(),
                created_at: entry.value().created_at,
            })
            .collect();
        out.sort_by_key(|info| info.created_at);
        out
    }

    fn remove(&self, request_id: &str) {
        self.slots.remove(request_id);
    }
}

/// Owns one table entry for the duration of a review. Dropping it removes
/// the entry whichever way the review ended.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    table: &'a PendingTable,
    request_id: String,
}

impl PendingGuard<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}
