//! Pipeline coordinator — turns stream events into notifications.
//!
//! Flow per event:
//! 1. Structural filter on the intake path (empty text, own messages)
//! 2. Optional redelivery guard
//! 3. Spawned task: cache lookup/insert → classify → resolve → deliver
//!
//! Intake only waits when the in-flight cap is reached. Every terminal state
//! is logged and counted; nothing is retried. An event's [`Ack`] completes
//! once it reaches a terminal state and is dropped if the event is abandoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::channels::{Ack, UpdateHandler};
use crate::error::ResolveError;
use crate::pipeline::cache::EntityCache;
use crate::pipeline::dedup::RecentSet;
use crate::pipeline::notify::Dispatcher;
use crate::pipeline::types::{
    CacheEntry, ClassificationVerdict, Classifier, EventKey, RecipientResolver, StreamEvent,
};

/// Collaborators shared by every event task.
#[derive(Clone)]
pub struct PipelineDeps {
    pub cache: Arc<EntityCache>,
    pub classifier: Arc<dyn Classifier>,
    pub resolver: Arc<dyn RecipientResolver>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Recipient handle, resolved on every match.
    pub admin_handle: String,
    pub max_in_flight: usize,
    /// 0 disables the redelivery guard.
    pub dedup_window: usize,
}

/// Terminal state of one event's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotRelevant,
    RecipientNotFound,
    ResolveFailed,
    Delivered,
    DeliveryFailed,
}

impl Outcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotRelevant => "not_relevant",
            Self::RecipientNotFound => "recipient_not_found",
            Self::ResolveFailed => "resolve_failed",
            Self::Delivered => "delivered",
            Self::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Running counters, one per terminal state.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    filtered: AtomicU64,
    duplicates: AtomicU64,
    not_relevant: AtomicU64,
    relevant: AtomicU64,
    not_found: AtomicU64,
    resolve_failed: AtomicU64,
    delivered: AtomicU64,
    delivery_failed: AtomicU64,
    abandoned: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub filtered: u64,
    pub duplicates: u64,
    pub not_relevant: u64,
    pub relevant: u64,
    pub not_found: u64,
    pub resolve_failed: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub abandoned: u64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: Outcome) {
        match outcome {
            Outcome::NotRelevant => Self::bump(&self.not_relevant),
            Outcome::RecipientNotFound => Self::bump(&self.not_found),
            Outcome::ResolveFailed => Self::bump(&self.resolve_failed),
            Outcome::Delivered => Self::bump(&self.delivered),
            Outcome::DeliveryFailed => Self::bump(&self.delivery_failed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            filtered: load(&self.filtered),
            duplicates: load(&self.duplicates),
            not_relevant: load(&self.not_relevant),
            relevant: load(&self.relevant),
            not_found: load(&self.not_found),
            resolve_failed: load(&self.resolve_failed),
            delivered: load(&self.delivered),
            delivery_failed: load(&self.delivery_failed),
            abandoned: load(&self.abandoned),
        }
    }
}

/// State shared with spawned tasks.
struct Shared {
    deps: PipelineDeps,
    admin_handle: String,
    stats: PipelineStats,
}

impl Shared {
    /// Cached author metadata, or a placeholder stored as the first observation.
    async fn author_entry(&self, event: &StreamEvent) -> CacheEntry {
        let key = event.author_key();
        if let Some(entry) = self.deps.cache.lookup(key).await {
            return entry;
        }
        let placeholder = CacheEntry::placeholder(event);
        if self.deps.cache.store(&placeholder).await {
            debug!(key = %key, "Recorded new identity");
        }
        placeholder
    }

    async fn process(&self, event: StreamEvent) -> Outcome {
        let author = self.author_entry(&event).await;

        let verdict = ClassificationVerdict {
            relevant: self.deps.classifier.classify(&event.text).await,
            text: event.text.clone(),
        };
        if !verdict.relevant {
            return Outcome::NotRelevant;
        }
        PipelineStats::bump(&self.stats.relevant);
        info!(
            key = %author.key,
            text_hash = %event.text_hash(),
            chars = verdict.text.chars().count(),
            "Relevant message, notifying"
        );

        let address = match self.deps.resolver.resolve(&self.admin_handle).await {
            Ok(address) => address,
            Err(ResolveError::NotFound { handle }) => {
                warn!(
                    key = %author.key,
                    text_hash = %event.text_hash(),
                    handle = %handle,
                    "Recipient not found, dropping notification"
                );
                return Outcome::RecipientNotFound;
            }
            Err(e) => {
                warn!(
                    key = %author.key,
                    text_hash = %event.text_hash(),
                    error = %e,
                    "Recipient resolution failed, dropping notification"
                );
                return Outcome::ResolveFailed;
            }
        };

        let record = self.deps.dispatcher.compose(address, &event, &author);
        match self.deps.dispatcher.deliver(&record).await {
            Ok(()) => Outcome::Delivered,
            Err(_) => Outcome::DeliveryFailed,
        }
    }
}

/// Central event loop handler.
pub struct Coordinator {
    shared: Arc<Shared>,
    recent: RecentSet,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Stops intake waiting for a permit.
    cancel: CancellationToken,
    /// Abandons in-flight tasks once the shutdown grace period is over.
    abort: CancellationToken,
}

impl Coordinator {
    pub fn new(deps: PipelineDeps, config: CoordinatorConfig, cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                deps,
                admin_handle: config.admin_handle,
                stats: PipelineStats::default(),
            }),
            recent: RecentSet::new(config.dedup_window),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            tracker: TaskTracker::new(),
            cancel,
            abort: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Seed the redelivery guard with messages processed before a restart.
    pub fn remember(&self, keys: impl IntoIterator<Item = EventKey>) -> usize {
        keys.into_iter().filter(|key| self.recent.insert(*key)).count()
    }

    /// Number of event tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Accept one event from the stream.
    pub async fn handle(&self, event: StreamEvent, ack: Ack) {
        let stats = &self.shared.stats;
        PipelineStats::bump(&stats.received);

        if event.is_structurally_irrelevant() {
            PipelineStats::bump(&stats.filtered);
            debug!(
                peer = %event.peer,
                message_id = event.message_id,
                outbound = event.outbound,
                "Filtered out"
            );
            ack.complete(None).await;
            return;
        }

        if !self.recent.insert(event.key()) {
            PipelineStats::bump(&stats.duplicates);
            info!(
                peer = %event.peer,
                message_id = event.message_id,
                "Dropping redelivered message"
            );
            ack.complete(None).await;
            return;
        }

        let permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(peer = %event.peer, "Shutdown in progress, event not started");
                return;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        let shared = Arc::clone(&self.shared);
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            let key = event.author_key();
            let event_key = event.key();
            let text_hash = event.text_hash();

            tokio::select! {
                _ = abort.cancelled() => {
                    // The ack is dropped, so the update is fetched again after a restart.
                    PipelineStats::bump(&shared.stats.abandoned);
                    warn!(key = %key, text_hash = %text_hash, "Event abandoned at shutdown");
                }
                outcome = shared.process(event) => {
                    shared.stats.record(outcome);
                    info!(
                        key = %key,
                        text_hash = %text_hash,
                        outcome = outcome.label(),
                        "Event done"
                    );
                    ack.complete(Some(event_key)).await;
                }
            }
        });
    }

    /// Stop accepting work and wait for in-flight events.
    ///
    /// Tasks still running after `grace` are abandoned. Stores are only
    /// written with single statements, so abandoning leaves no partial rows.
    pub async fn shutdown(&self, grace: Duration) -> StatsSnapshot {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(in_flight = self.tracker.len(), "Grace period over, abandoning in-flight events");
            self.abort.cancel();
            self.tracker.wait().await;
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            filtered = stats.filtered,
            duplicates = stats.duplicates,
            not_relevant = stats.not_relevant,
            relevant = stats.relevant,
            not_found = stats.not_found,
            resolve_failed = stats.resolve_failed,
            delivered = stats.delivered,
            delivery_failed = stats.delivery_failed,
            abandoned = stats.abandoned,
            "Pipeline stopped"
        );
        stats
    }
}

#[async_trait]
impl UpdateHandler for Coordinator {
    async fn on_new_message(&self, event: StreamEvent, ack: Ack) {
        self.handle(event, ack).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::ChannelError;
    use crate::pipeline::types::{DeliverableAddress, MessageSender, PeerKey, PeerKind};
    use crate::channels::ProgressTracker;
    use crate::store::{EntityStore, LibSqlLedger, LibSqlPeerStore, ResumeLedger};

    const ADMIN_CHAT: i64 = 5550001;

    struct StubClassifier {
        verdict: bool,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Classifier for StubClassifier {
        async fn classify(&self, _text: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.verdict
        }
    }

    struct StubResolver {
        found: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecipientResolver for StubResolver {
        async fn resolve(&self, handle: &str) -> Result<DeliverableAddress, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.found {
                Ok(DeliverableAddress { chat_id: ADMIN_CHAT })
            } else {
                Err(ResolveError::NotFound {
                    handle: handle.to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        fail: bool,
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_text(
            &self,
            address: &DeliverableAddress,
            text: &str,
        ) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((address.chat_id, text.to_string()));
            if self.fail {
                Err(ChannelError::SendFailed {
                    name: "stub".into(),
                    reason: "blocked".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        coordinator: Coordinator,
        store: Arc<LibSqlPeerStore>,
        classifier: Arc<StubClassifier>,
        resolver: Arc<StubResolver>,
        sender: Arc<RecordingSender>,
    }

    impl Harness {
        async fn new(verdict: bool, found: bool, fail_send: bool) -> Self {
            Self::with(verdict, found, fail_send, 0, Duration::ZERO).await
        }

        async fn with(
            verdict: bool,
            found: bool,
            fail_send: bool,
            dedup_window: usize,
            delay: Duration,
        ) -> Self {
            let store = Arc::new(LibSqlPeerStore::in_memory().await.unwrap());
            let classifier = Arc::new(StubClassifier {
                verdict,
                calls: AtomicUsize::new(0),
                delay,
            });
            let resolver = Arc::new(StubResolver {
                found,
                calls: AtomicUsize::new(0),
            });
            let sender = Arc::new(RecordingSender {
                fail: fail_send,
                ..Default::default()
            });
            let deps = PipelineDeps {
                cache: Arc::new(EntityCache::new(store.clone())),
                classifier: classifier.clone(),
                resolver: resolver.clone(),
                dispatcher: Arc::new(Dispatcher::new(sender.clone())),
            };
            let config = CoordinatorConfig {
                admin_handle: "@boss".into(),
                max_in_flight: 4,
                dedup_window,
            };
            Self {
                coordinator: Coordinator::new(deps, config, CancellationToken::new()),
                store,
                classifier,
                resolver,
                sender,
            }
        }

        async fn drain(&self) -> StatsSnapshot {
            self.coordinator.shutdown(Duration::from_secs(5)).await
        }

        fn classify_calls(&self) -> usize {
            self.classifier.calls.load(Ordering::SeqCst)
        }

        fn resolve_calls(&self) -> usize {
            self.resolver.calls.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<(i64, String)> {
            self.sender.sent.lock().unwrap().clone()
        }
    }

    fn event(text: &str) -> StreamEvent {
        StreamEvent {
            peer: PeerKey::new(PeerKind::Group, -1001),
            message_id: 1,
            text: text.into(),
            outbound: false,
            sender: Some(PeerKey::user(4242)),
            sender_handle: None,
        }
    }

    #[tokio::test]
    async fn empty_text_makes_no_downstream_calls() {
        let h = Harness::new(true, true, false).await;
        h.coordinator.handle(event(""), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(stats.filtered, 1);
        assert_eq!(h.classify_calls(), 0);
        assert_eq!(h.resolve_calls(), 0);
        assert!(h.sent().is_empty());
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outbound_message_makes_no_downstream_calls() {
        let h = Harness::new(true, true, false).await;
        let mut e = event("Ищу разработчика для бота");
        e.outbound = true;
        h.coordinator.handle(e, Ack::detached()).await;
        h.drain().await;

        assert_eq!(h.classify_calls(), 0);
        assert!(h.sent().is_empty());
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn negative_verdict_skips_resolver_and_dispatcher() {
        let h = Harness::new(false, true, false).await;
        h.coordinator.handle(event("Привет, как дела?"), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(h.classify_calls(), 1);
        assert_eq!(h.resolve_calls(), 0);
        assert!(h.sent().is_empty());
        assert_eq!(stats.not_relevant, 1);
    }

    #[tokio::test]
    async fn relevant_message_with_unknown_sender_uses_placeholder() {
        let h = Harness::new(true, true, false).await;
        h.coordinator.handle(event("Ищу разработчика для бота"), Ack::detached()).await;
        let stats = h.drain().await;

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ADMIN_CHAT);
        assert!(sent[0].1.contains("👤 unknown (ID: 4242)"));
        assert!(sent[0].1.contains("Ищу разработчика для бота"));
        assert_eq!(stats.delivered, 1);

        // First observation of the sender is remembered.
        let cached = h.store.lookup(PeerKey::user(4242)).await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn cached_handle_is_used_in_summary() {
        let h = Harness::new(true, true, false).await;
        h.store
            .store(&CacheEntry::new(PeerKey::user(4242), Some("client".into())))
            .await
            .unwrap();

        h.coordinator.handle(event("Нужен сайт для бизнеса"), Ack::detached()).await;
        h.drain().await;

        assert!(h.sent()[0].1.contains("👤 @client (ID: 4242)"));
    }

    #[tokio::test]
    async fn recipient_not_found_drops_notification() {
        let h = Harness::new(true, false, false).await;
        h.coordinator.handle(event("Кто может сделать бота?"), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(h.resolve_calls(), 1);
        assert!(h.sent().is_empty());
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn delivery_failure_is_counted_not_retried() {
        let h = Harness::new(true, true, true).await;
        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(h.sent().len(), 1);
        assert_eq!(stats.delivery_failed, 1);
    }

    #[tokio::test]
    async fn redelivery_runs_twice_without_guard() {
        let h = Harness::new(true, true, false).await;
        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;
        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(h.classify_calls(), 2);
        assert_eq!(h.resolve_calls(), 2);
        assert_eq!(h.sent().len(), 2);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn redelivery_guard_drops_duplicates() {
        let h = Harness::with(true, true, false, 16, Duration::ZERO).await;
        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;
        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(stats.duplicates, 1);
        assert_eq!(h.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_classification_does_not_block_intake() {
        let h = Harness::with(false, true, false, 0, Duration::from_secs(30)).await;
        let start = tokio::time::Instant::now();
        for id in 0..3 {
            let mut e = event("Нужен бот");
            e.message_id = id;
            h.coordinator.handle(e, Ack::detached()).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(h.coordinator.in_flight(), 3);

        let stats = h.drain().await;
        assert_eq!(stats.not_relevant, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_after_grace() {
        let h = Harness::with(true, true, false, 0, Duration::from_secs(3600)).await;
        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;

        let stats = h.coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stats.abandoned, 1);
        assert!(h.sent().is_empty());
    }

    // ── Resume progress ─────────────────────────────────────────────

    async fn progress(window: usize) -> (Arc<ProgressTracker>, Arc<LibSqlLedger>) {
        let ledger = Arc::new(LibSqlLedger::in_memory().await.unwrap());
        (ProgressTracker::open(ledger.clone(), window).await, ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_event_is_not_committed() {
        let h = Harness::with(true, true, false, 16, Duration::from_secs(3600)).await;
        let (progress, ledger) = progress(16).await;

        h.coordinator
            .handle(event("Ищу разработчика для бота"), progress.begin(1))
            .await;
        assert_eq!(h.coordinator.in_flight(), 1);
        assert_eq!(ledger.load_offset().await.unwrap(), None);

        let stats = h.coordinator.shutdown(Duration::from_secs(10)).await;
        assert_eq!(stats.abandoned, 1);
        assert!(h.sent().is_empty());
        assert_eq!(ledger.load_offset().await.unwrap(), None);
        assert!(ledger.recent_events(16).await.unwrap().is_empty());
        assert_eq!(progress.next_offset(), Some(1));
    }

    #[tokio::test]
    async fn finished_event_commits_offset_and_key() {
        let h = Harness::with(true, true, false, 16, Duration::ZERO).await;
        let (progress, ledger) = progress(16).await;

        h.coordinator.handle(event("Нужен бот"), progress.begin(7)).await;
        h.drain().await;

        assert_eq!(h.sent().len(), 1);
        assert_eq!(ledger.load_offset().await.unwrap(), Some(8));
        assert_eq!(
            ledger.recent_events(16).await.unwrap(),
            vec![event("Нужен бот").key()]
        );
    }

    #[tokio::test]
    async fn filtered_and_duplicate_events_still_advance_offset() {
        let h = Harness::with(true, true, false, 16, Duration::ZERO).await;
        let (progress, ledger) = progress(16).await;

        h.coordinator.handle(event(""), progress.begin(1)).await;
        assert_eq!(ledger.load_offset().await.unwrap(), Some(2));

        h.coordinator.handle(event("Нужен бот"), progress.begin(2)).await;
        h.coordinator.handle(event("Нужен бот"), progress.begin(3)).await;
        let stats = h.drain().await;

        assert_eq!(stats.duplicates, 1);
        assert_eq!(ledger.load_offset().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn remembered_keys_drop_redelivery_after_restart() {
        let h = Harness::with(true, true, false, 16, Duration::ZERO).await;
        assert_eq!(h.coordinator.remember([event("Нужен бот").key()]), 1);

        h.coordinator.handle(event("Нужен бот"), Ack::detached()).await;
        let stats = h.drain().await;

        assert_eq!(stats.duplicates, 1);
        assert_eq!(h.classify_calls(), 0);
        assert!(h.sent().is_empty());
    }
}
