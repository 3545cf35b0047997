//! Resume progress for the update stream.
//!
//! Updates are handed out in id order but finish in any order. The offset
//! written to the ledger is the low watermark: the lowest update id that has
//! not finished yet, or one past the highest id handed out when nothing is
//! pending. An update whose [`Ack`] is dropped without completing holds the
//! watermark in place, so it is fetched again after a restart.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::pipeline::types::EventKey;
use crate::store::ResumeLedger;

#[derive(Debug, Default)]
struct Progress {
    /// Handed out, not yet finished.
    pending: BTreeSet<i64>,
    /// First update id not handed out yet.
    next_new: Option<i64>,
    /// Last offset written to the ledger.
    committed: Option<i64>,
}

impl Progress {
    fn watermark(&self) -> Option<i64> {
        self.pending.first().copied().or(self.next_new)
    }
}

pub struct ProgressTracker {
    ledger: Arc<dyn ResumeLedger>,
    state: Mutex<Progress>,
    /// How many processed messages the ledger keeps for the redelivery guard.
    recent_window: usize,
    changed: Notify,
}

impl ProgressTracker {
    /// Resume from the offset recorded in `ledger`.
    pub async fn open(ledger: Arc<dyn ResumeLedger>, recent_window: usize) -> Arc<Self> {
        let offset = match ledger.load_offset().await {
            Ok(offset) => offset,
            Err(e) => {
                warn!(error = %e, "Could not read resume offset, starting from server state");
                None
            }
        };
        Arc::new(Self {
            ledger,
            state: Mutex::new(Progress {
                next_new: offset,
                committed: offset,
                ..Progress::default()
            }),
            recent_window,
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offset for the next fetch.
    pub fn next_offset(&self) -> Option<i64> {
        self.lock().watermark()
    }

    /// Whether `update_id` has not been handed out yet.
    pub fn is_new(&self, update_id: i64) -> bool {
        self.lock().next_new.is_none_or(|next| update_id >= next)
    }

    /// Number of updates handed out and not finished.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Register `update_id` as handed out.
    pub fn begin(self: &Arc<Self>, update_id: i64) -> Ack {
        let mut state = self.lock();
        state.pending.insert(update_id);
        state.next_new = Some(state.next_new.map_or(update_id + 1, |n| n.max(update_id + 1)));
        Ack {
            tracker: Some(Arc::clone(self)),
            update_id,
        }
    }

    /// Resolves after some update finishes.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    async fn finish(&self, update_id: i64, processed: Option<EventKey>) {
        let offset = {
            let mut state = self.lock();
            state.pending.remove(&update_id);
            let mark = state.watermark();
            if mark > state.committed {
                state.committed = mark;
                mark
            } else {
                None
            }
        };
        let processed = processed.filter(|_| self.recent_window > 0);

        if offset.is_some() || processed.is_some() {
            if let Err(e) = self.ledger.commit(offset, processed, self.recent_window).await {
                warn!(update_id, offset = ?offset, error = %e, "Failed to record progress");
            } else if let Some(offset) = offset {
                debug!(offset, "Resume offset advanced");
            }
        }
        self.changed.notify_one();
    }
}

/// Completion handle for one update.
///
/// Dropping it without calling [`Ack::complete`] leaves the update pending.
#[must_use = "an update is only committed once its Ack completes"]
pub struct Ack {
    tracker: Option<Arc<ProgressTracker>>,
    update_id: i64,
}

impl Ack {
    /// An ack tied to no tracker, for events that did not come from a poller.
    pub fn detached() -> Self {
        Self {
            tracker: None,
            update_id: 0,
        }
    }

    /// Mark the update finished. `processed` names a message that ran
    /// through the pipeline and should be remembered by the redelivery guard.
    pub async fn complete(self, processed: Option<EventKey>) {
        if let Some(tracker) = &self.tracker {
            tracker.finish(self.update_id, processed).await;
        }
    }
}
