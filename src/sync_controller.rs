//! Reactive orchestrator for the reordering engine.
//!
//! The controller is the only mutator of engine state. Host events and UI
//! commands arrive on an mpsc inbox; settle delays live in an owned timer
//! queue stamped with the activation epoch, so anything scheduled before a
//! deactivation becomes a no-op when it fires.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::{
    sync::{broadcast, mpsc},
    time::{sleep_until, Instant},
};

use crate::{
    config::{Config, TimingConfig},
    discovery::ItemDiscovery,
    error::{EngineError, Result},
    location::{Location, ViewKind},
    notify::{Notifier, Severity},
    order::{self, OrderController, Snapshot, TransformKind},
    persistence::{RecordSummary, Settings, SettingsStore},
    protocol::{EngineCommand, EngineEvent, HostEvent, Message},
    tree::{lock_tree, HostTree, SharedTree},
};

const EVENT_BUS_CAPACITY: usize = 64;
const NO_ITEMS_MESSAGE: &str = "No playlist items found!";
const NO_SNAPSHOT_MESSAGE: &str = "No original order saved!";

/// What triggered an apply; decides persistence and user feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyMode {
    /// Explicit request: persisted and confirmed.
    User,
    /// Remembered transform on activation: persisted, silent.
    Replay,
    /// Continuity after the host re-rendered its items: silent.
    Maintain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    CheckEligibility,
    Discover,
    Replay(TransformKind),
    Maintain,
}

#[derive(Debug)]
struct ScheduledTask {
    due: Instant,
    task: Task,
    epoch: u64,
}

/// State that lives exactly as long as one activation.
struct Activation<N> {
    playlist_id: Option<String>,
    snapshot: Snapshot<N>,
    transform: TransformKind,
    /// Items as last committed (or as found), to tell a host re-render
    /// apart from our own order still being in place.
    arranged: Vec<N>,
}

/// Identities with a discovery+commit in flight. Overlapping requests for
/// the same identity are rejected, not queued.
#[derive(Debug, Clone, Default)]
pub struct ActivityLock {
    busy: Arc<Mutex<HashSet<String>>>,
}

/// Releases its identity on drop.
#[derive(Debug)]
pub struct ActivityGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    identity: String,
}

impl ActivityLock {
    pub fn try_acquire(&self, identity: &str) -> Result<ActivityGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(identity.to_string()) {
            return Err(EngineError::Busy(identity.to_string()));
        }
        Ok(ActivityGuard {
            busy: Arc::clone(&self.busy),
            identity: identity.to_string(),
        })
    }

    pub fn is_busy(&self, identity: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identity)
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identity);
    }
}

/// Drives activation, replay, and continuity for one host tree.
pub struct SyncController<T: HostTree> {
    tree: SharedTree<T>,
    discovery: ItemDiscovery,
    order: OrderController,
    store: SettingsStore,
    notifier: Box<dyn Notifier>,
    timing: TimingConfig,
    max_retries: u32,
    location: Location,
    activation: Option<Activation<T::Node>>,
    timers: Vec<ScheduledTask>,
    epoch: u64,
    retries: u32,
    activity: ActivityLock,
    event_producer: broadcast::Sender<EngineEvent>,
}

impl<T: HostTree> SyncController<T> {
    pub fn new(
        tree: SharedTree<T>,
        config: &Config,
        store: SettingsStore,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let (event_producer, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            tree,
            discovery: config.item_discovery(),
            order: OrderController::new(),
            store,
            notifier,
            timing: config.timing.clone(),
            max_retries: config.discovery.max_retries,
            location: Location::default(),
            activation: None,
            timers: Vec::new(),
            epoch: 0,
            retries: 0,
            activity: ActivityLock::default(),
            event_producer,
        }
    }

    /// Swaps the order controller, e.g. for reproducible shuffles.
    pub fn with_order_controller(mut self, order: OrderController) -> Self {
        self.order = order;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_producer.subscribe()
    }

    pub fn activity_lock(&self) -> ActivityLock {
        self.activity.clone()
    }

    /// Consumes the inbox until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message<T::Node>>) {
        info!("SyncController: started");
        loop {
            let next_due = self.next_due();
            tokio::select! {
                biased;
                message = inbox.recv() => match message {
                    Some(Message::Shutdown) | None => break,
                    Some(message) => self.handle_message(message),
                },
                _ = wait_until(next_due) => self.run_due_tasks(),
            }
        }
        self.deactivate();
        info!("SyncController: stopped");
    }

    pub fn handle_message(&mut self, message: Message<T::Node>) {
        match message {
            Message::Host(HostEvent::LocationChanged(href)) => self.on_location_changed(&href),
            Message::Host(HostEvent::TreeChanged { added }) => self.on_tree_changed(&added),
            Message::Host(HostEvent::PlaybackEnded) => self.on_playback_ended(),
            Message::Command(EngineCommand::Invoke(kind)) => {
                if let Err(err) = self.invoke(kind) {
                    debug!("SyncController: {:?} not applied: {}", kind, err);
                }
            }
            Message::Command(EngineCommand::Reset) => {
                if let Err(err) = self.reset() {
                    debug!("SyncController: reset not applied: {}", err);
                }
            }
            Message::Command(EngineCommand::CurrentTransform(reply)) => {
                let _ = reply.send(self.current_transform());
            }
            Message::Command(EngineCommand::SavedRecords(reply)) => {
                let _ = reply.send(self.saved_records_summary());
            }
            Message::Shutdown => self.deactivate(),
        }
    }

    /// Runs every timer that is due, earliest first. Timers from an earlier
    /// activation epoch are dropped unexecuted.
    pub fn run_due_tasks(&mut self) {
        let now = Instant::now();
        while let Some(index) = self.next_ready(now) {
            let scheduled = self.timers.remove(index);
            if scheduled.epoch != self.epoch {
                trace!(
                    "SyncController: dropping stale {:?} from epoch {}",
                    scheduled.task,
                    scheduled.epoch
                );
                continue;
            }
            trace!("SyncController: running {:?}", scheduled.task);
            match scheduled.task {
                Task::CheckEligibility => self.check_eligibility(),
                Task::Discover => self.discover(),
                Task::Replay(kind) => self.replay(kind),
                Task::Maintain => self.maintain(),
            }
        }
    }

    pub fn list_transform_kinds() -> &'static [TransformKind] {
        &TransformKind::INVOKABLE
    }

    /// Applies `kind` to the live items, remembers it, and confirms it.
    pub fn invoke(&mut self, kind: TransformKind) -> Result<()> {
        if kind == TransformKind::None {
            return Err(EngineError::NotInvokable(kind));
        }
        let result = self.apply_transform(kind, ApplyMode::User);
        if matches!(result, Err(EngineError::Inactive | EngineError::DiscoveryEmpty)) {
            self.notify(NO_ITEMS_MESSAGE, Severity::Error);
        }
        result
    }

    /// Reinserts the pristine order and forgets the remembered transform.
    pub fn reset(&mut self) -> Result<()> {
        let Some(identity) = self
            .activation
            .as_ref()
            .filter(|activation| !activation.snapshot.is_empty())
            .map(|activation| activation.playlist_id.clone())
        else {
            self.notify(NO_SNAPSHOT_MESSAGE, Severity::Error);
            return Err(EngineError::SnapshotMissing);
        };
        let _guard = self
            .activity
            .try_acquire(identity.as_deref().unwrap_or_default())?;

        let shared = Arc::clone(&self.tree);
        let restored = {
            let mut tree = lock_tree(&shared);
            let located = self.discovery.locate_with_container(&*tree);
            match (located, self.activation.as_ref()) {
                (Some(located), Some(activation)) => Some(activation.snapshot.restore(
                    &mut *tree,
                    located.container,
                    &located.items,
                )),
                _ => None,
            }
        };
        let Some(restored) = restored else {
            self.notify(NO_ITEMS_MESSAGE, Severity::Error);
            return Err(EngineError::DiscoveryEmpty);
        };

        if let Some(activation) = self.activation.as_mut() {
            activation.transform = TransformKind::None;
            activation.arranged = restored;
        }
        if let Some(playlist_id) = identity.as_deref() {
            if self.store.settings().auto_save {
                if let Err(err) = self.store.remove(playlist_id) {
                    debug!(
                        "SyncController: record for {} dropped in memory only: {}",
                        playlist_id, err
                    );
                }
            }
        }
        info!("SyncController: restored original order for {:?}", identity);
        self.notify(TransformKind::None.success_message(), Severity::Success);
        let _ = self.event_producer.send(EngineEvent::ResetApplied);
        Ok(())
    }

    /// `None` while inactive or showing the host's own order.
    pub fn current_transform(&self) -> TransformKind {
        self.activation
            .as_ref()
            .map(|activation| activation.transform)
            .unwrap_or(TransformKind::None)
    }

    pub fn saved_records_summary(&self) -> Vec<RecordSummary> {
        self.store.summary(Utc::now())
    }

    pub fn is_active(&self) -> bool {
        self.activation.is_some()
    }

    pub fn playlist_id(&self) -> Option<&str> {
        self.activation
            .as_ref()
            .and_then(|activation| activation.playlist_id.as_deref())
    }

    pub fn settings(&self) -> &Settings {
        self.store.settings()
    }

    /// Applies `update` for the session even when it cannot be stored.
    pub fn update_settings(&mut self, update: impl FnOnce(&mut Settings)) -> Result<()> {
        self.store.update_settings(update)
    }

    fn on_location_changed(&mut self, href: &str) {
        if self.location.href() == href {
            trace!("SyncController: location unchanged");
            return;
        }
        let first_location = self.location.href().is_empty();
        let previous = std::mem::replace(&mut self.location, Location::parse(href));
        debug!("SyncController: location changed to {}", href);

        if let Some(activation) = &self.activation {
            let same_playlist = activation.playlist_id.as_deref() == self.location.playlist_id()
                && previous.kind() == self.location.kind();
            if !same_playlist {
                info!(
                    "SyncController: left playlist {:?}; dropping activation",
                    activation.playlist_id
                );
                self.deactivate();
            } else if self.location.kind() == ViewKind::WatchWithPlaylist {
                self.schedule(Task::Maintain, self.timing.item_advance_ms);
            }
        }

        let delay = if first_location {
            0
        } else if self.location.is_watch_view() {
            self.timing.watch_navigation_check_ms
        } else {
            self.timing.navigation_check_ms
        };
        self.schedule(Task::CheckEligibility, delay);
    }

    fn on_tree_changed(&mut self, added: &[T::Node]) {
        if added.is_empty() {
            return;
        }
        let panel_added = {
            let tree = lock_tree(&self.tree);
            added
                .iter()
                .any(|node| self.discovery.contains_playlist_panel(&*tree, *node))
        };
        if !panel_added {
            return;
        }
        debug!("SyncController: playlist panel inserted");
        if self.playlist_id().is_some() {
            self.schedule(Task::Maintain, self.timing.panel_appeared_ms);
        }
        self.schedule(Task::CheckEligibility, self.timing.panel_appeared_ms);
    }

    fn on_playback_ended(&mut self) {
        if self.playlist_id().is_some() && self.current_transform() != TransformKind::None {
            self.schedule(Task::Maintain, self.timing.playback_ended_ms);
        }
    }

    fn check_eligibility(&mut self) {
        let eligible = {
            let tree = lock_tree(&self.tree);
            self.discovery.is_eligible(&*tree, &self.location)
        };
        match (eligible, self.is_active()) {
            (true, false) => {
                if self.timers.iter().any(|timer| timer.task == Task::Discover) {
                    trace!("SyncController: discovery already pending");
                    return;
                }
                self.retries = 0;
                let settle = if self.location.kind() == ViewKind::WatchWithPlaylist {
                    self.timing.watch_activation_settle_ms
                } else {
                    self.timing.activation_settle_ms
                };
                self.schedule(Task::Discover, settle);
            }
            (false, true) => {
                info!("SyncController: view is no longer eligible");
                self.deactivate();
            }
            _ => trace!("SyncController: eligibility={} unchanged", eligible),
        }
    }

    fn discover(&mut self) {
        if self.is_active() {
            return;
        }
        let shared = Arc::clone(&self.tree);
        let mut tree = lock_tree(&shared);
        if !self.discovery.is_eligible(&*tree, &self.location) {
            debug!("SyncController: view lost eligibility before discovery");
            return;
        }
        let Some(located) = self.discovery.locate_with_container(&*tree) else {
            drop(tree);
            self.retry_discovery();
            return;
        };
        let snapshot = Snapshot::capture(&mut *tree, &located.items);
        drop(tree);

        self.store.reload();
        let playlist_id = self.location.playlist_id().map(str::to_string);
        let item_count = located.items.len();
        info!(
            "SyncController: activated for {:?} with {} items",
            playlist_id, item_count
        );
        self.retries = 0;
        self.activation = Some(Activation {
            playlist_id: playlist_id.clone(),
            snapshot,
            transform: TransformKind::None,
            arranged: located.items,
        });
        let _ = self.event_producer.send(EngineEvent::Activated {
            playlist_id: playlist_id.clone(),
            item_count,
        });

        if let Some(kind) = playlist_id.as_deref().and_then(|id| self.replayable(id)) {
            debug!("SyncController: replaying remembered {:?}", kind);
            self.schedule(Task::Replay(kind), self.timing.replay_settle_ms);
        }
    }

    fn retry_discovery(&mut self) {
        if self.retries >= self.max_retries {
            warn!(
                "SyncController: no playlist items after {} retries; waiting for the next navigation",
                self.retries
            );
            let _ = self.event_producer.send(EngineEvent::DiscoveryGaveUp);
            return;
        }
        self.retries += 1;
        debug!(
            "SyncController: no playlist items yet, retry {}/{}",
            self.retries, self.max_retries
        );
        let _ = self.event_producer.send(EngineEvent::DiscoveryRetry {
            attempt: self.retries,
        });
        self.schedule(Task::Discover, self.timing.discovery_retry_ms);
    }

    fn replayable(&self, playlist_id: &str) -> Option<TransformKind> {
        let settings = self.store.settings();
        if !settings.auto_save || !settings.remember_sort {
            return None;
        }
        self.store
            .record(playlist_id, Utc::now())
            .map(|record| record.transform)
            .filter(|kind| *kind != TransformKind::None)
    }

    fn replay(&mut self, kind: TransformKind) {
        if self.current_transform() != TransformKind::None {
            debug!("SyncController: transform chosen before replay; skipping");
            return;
        }
        if let Err(err) = self.apply_transform(kind, ApplyMode::Replay) {
            debug!("SyncController: replay of {:?} failed: {}", kind, err);
        }
    }

    /// Continuity only exists for views with a playlist identity.
    fn maintain(&mut self) {
        if self.playlist_id().is_none() {
            trace!("SyncController: no playlist identity; leaving order to the host");
            return;
        }
        let kind = self.current_transform();
        if kind == TransformKind::None {
            return;
        }
        if let Err(err) = self.apply_transform(kind, ApplyMode::Maintain) {
            debug!("SyncController: could not re-apply {:?}: {}", kind, err);
        }
    }

    fn apply_transform(&mut self, kind: TransformKind, mode: ApplyMode) -> Result<()> {
        if kind == TransformKind::None {
            return Err(EngineError::NotInvokable(kind));
        }
        let identity = self
            .activation
            .as_ref()
            .ok_or(EngineError::Inactive)?
            .playlist_id
            .clone();
        if mode == ApplyMode::Maintain && kind == TransformKind::Shuffle {
            trace!("SyncController: keeping the last shuffled order");
            return Ok(());
        }
        let _guard = self
            .activity
            .try_acquire(identity.as_deref().unwrap_or_default())?;

        let shared = Arc::clone(&self.tree);
        let arranged = {
            let mut tree = lock_tree(&shared);
            let located = self
                .discovery
                .locate_with_container(&*tree)
                .ok_or(EngineError::DiscoveryEmpty)?;
            let previous = self
                .activation
                .as_ref()
                .map(|activation| activation.arranged.as_slice())
                .unwrap_or_default();
            let merged = match mode {
                ApplyMode::Maintain if previous == located.items.as_slice() => {
                    trace!("SyncController: {:?} order still in place", kind);
                    return Ok(());
                }
                ApplyMode::Maintain if kind == TransformKind::Reverse => {
                    merge_reversed(previous, &located.items)
                }
                _ => None,
            };
            let arranged = match merged {
                Some(merged) => merged,
                None => self
                    .order
                    .arrange(&*tree, &located.items, kind, Utc::now()),
            };
            order::commit(&mut *tree, located.container, &located.items, &arranged);
            arranged
        };

        if let Some(activation) = self.activation.as_mut() {
            activation.transform = kind;
            activation.arranged = arranged;
        }
        if mode != ApplyMode::Maintain {
            if let Some(playlist_id) = identity.as_deref() {
                if self.store.settings().auto_save {
                    if let Err(err) = self.store.upsert(playlist_id, kind, Utc::now()) {
                        debug!("SyncController: {:?} kept in memory only: {}", kind, err);
                    }
                }
            }
        }
        if mode == ApplyMode::User {
            self.notify(kind.success_message(), Severity::Success);
        }
        debug!("SyncController: applied {:?} ({:?})", kind, mode);
        let _ = self.event_producer.send(EngineEvent::TransformApplied {
            kind,
            silent: mode != ApplyMode::User,
        });
        Ok(())
    }

    fn deactivate(&mut self) {
        self.timers.clear();
        self.epoch += 1;
        self.retries = 0;
        if let Some(activation) = self.activation.take() {
            info!(
                "SyncController: deactivated for {:?}",
                activation.playlist_id
            );
            let _ = self.event_producer.send(EngineEvent::Deactivated);
        }
    }

    fn notify(&mut self, message: &str, severity: Severity) {
        if self.store.settings().notifications {
            self.notifier.notify(message, severity);
        }
    }

    fn schedule(&mut self, task: Task, delay_ms: u64) {
        trace!("SyncController: {:?} in {}ms", task, delay_ms);
        self.timers.push(ScheduledTask {
            due: Instant::now() + Duration::from_millis(delay_ms),
            task,
            epoch: self.epoch,
        });
    }

    fn next_due(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.due).min()
    }

    fn next_ready(&self, now: Instant) -> Option<usize> {
        self.timers
            .iter()
            .enumerate()
            .filter(|(_, timer)| timer.due <= now)
            .min_by_key(|(index, timer)| (timer.due, *index))
            .map(|(index, _)| index)
    }
}

/// Keeps a committed reversal when the host only added items around it.
/// Added items go in front, last first, as a fresh reversal would place
/// them. `None` when the host re-rendered or reordered what we committed.
fn merge_reversed<N: Copy + PartialEq>(arranged: &[N], current: &[N]) -> Option<Vec<N>> {
    let retained: Vec<N> = arranged
        .iter()
        .copied()
        .filter(|node| current.contains(node))
        .collect();
    let mut remaining = current.iter();
    let in_order = retained
        .iter()
        .all(|node| remaining.any(|candidate| candidate == node));
    if retained.is_empty() || !in_order {
        return None;
    }
    let mut merged: Vec<N> = current
        .iter()
        .rev()
        .copied()
        .filter(|node| !arranged.contains(node))
        .collect();
    merged.extend(retained);
    Some(merged)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use chrono::Utc;
    use tokio::sync::{broadcast, mpsc, oneshot};

    use super::{merge_reversed, ScheduledTask, SyncController, Task};
    use crate::{
        config::Config,
        discovery::ItemDiscovery,
        document::{DocumentTree, ElementSpec, NodeId},
        error::EngineError,
        extract,
        notify::{Notifier, Severity},
        order::{OrderController, TransformKind},
        persistence::SettingsStore,
        protocol::{EngineCommand, EngineEvent, HostEvent, Message},
        tree::{lock_tree, shared, SharedTree},
    };

    const PLAYLIST_URL: &str = "https://www.youtube.com/playlist?list=PL1";
    const WATCH_URL: &str = "https://www.youtube.com/watch?v=a&list=PL1";
    const NEXT_WATCH_URL: &str = "https://www.youtube.com/watch?v=b&list=PL1";
    const TITLES: [&str; 5] = ["E", "A", "D", "B", "C"];

    type Notes = Arc<Mutex<Vec<(String, Severity)>>>;

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        notes: Notes,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&mut self, message: &str, severity: Severity) {
            self.notes
                .lock()
                .expect("notes lock")
                .push((message.to_string(), severity));
        }
    }

    struct Harness {
        controller: SyncController<DocumentTree>,
        tree: SharedTree<DocumentTree>,
        notes: Notes,
        events: broadcast::Receiver<EngineEvent>,
    }

    fn item(title: &str) -> ElementSpec {
        ElementSpec::new("ytd-playlist-video-renderer")
            .child(ElementSpec::new("a").id("video-title").text(title))
    }

    fn items(titles: &[&str]) -> Vec<ElementSpec> {
        titles.iter().map(|title| item(title)).collect()
    }

    fn playlist_page(titles: &[&str]) -> DocumentTree {
        DocumentTree::new(
            &ElementSpec::new("body")
                .child(ElementSpec::new("div").id("contents").children(items(titles))),
        )
    }

    fn panel(titles: &[&str]) -> ElementSpec {
        ElementSpec::new("ytd-playlist-panel-renderer")
            .id("playlist")
            .child(ElementSpec::new("div").id("items").children(items(titles)))
    }

    fn watch_page(titles: &[&str]) -> DocumentTree {
        DocumentTree::new(
            &ElementSpec::new("body").child(ElementSpec::new("div").id("secondary").child(panel(titles))),
        )
    }

    fn harness_with(tree: DocumentTree, store: SettingsStore, config: Config) -> Harness {
        let tree = shared(tree);
        let notifier = RecordingNotifier::default();
        let notes = Arc::clone(&notifier.notes);
        let controller = SyncController::new(tree.clone(), &config, store, Box::new(notifier))
            .with_order_controller(OrderController::with_seed(7));
        let events = controller.subscribe();
        Harness {
            controller,
            tree,
            notes,
            events,
        }
    }

    fn harness(tree: DocumentTree) -> Harness {
        harness_with(tree, SettingsStore::in_memory(), Config::default())
    }

    fn titles(tree: &SharedTree<DocumentTree>) -> Vec<String> {
        let tree = lock_tree(tree);
        ItemDiscovery::new()
            .locate(&*tree)
            .into_iter()
            .map(|node| extract::title(&*tree, node))
            .collect()
    }

    fn notes(h: &Harness) -> Vec<(String, Severity)> {
        h.notes.lock().expect("notes lock").clone()
    }

    fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn navigate(h: &mut Harness, href: &str) {
        h.controller
            .handle_message(Message::Host(HostEvent::LocationChanged(href.to_string())));
    }

    async fn elapse(h: &mut Harness, ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        h.controller.run_due_tasks();
    }

    async fn activate(h: &mut Harness, href: &str, settle_ms: u64) {
        navigate(h, href);
        h.controller.run_due_tasks();
        elapse(h, settle_ms).await;
        assert!(h.controller.is_active(), "controller should be active");
    }

    fn items_node(h: &Harness) -> NodeId {
        lock_tree(&h.tree).element_by_id("items").expect("panel items")
    }

    #[tokio::test(start_paused = true)]
    async fn test_activates_after_settle_delay() {
        let mut h = harness(playlist_page(&TITLES));
        navigate(&mut h, PLAYLIST_URL);
        h.controller.run_due_tasks();
        assert!(!h.controller.is_active());

        elapse(&mut h, 100).await;

        assert!(h.controller.is_active());
        assert_eq!(h.controller.playlist_id(), Some("PL1"));
        assert_eq!(h.controller.current_transform(), TransformKind::None);
        assert_eq!(
            drain(&mut h.events),
            vec![EngineEvent::Activated {
                playlist_id: Some("PL1".to_string()),
                item_count: 5,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sort_then_reset_round_trip() {
        let mut h = harness(playlist_page(&TITLES));
        activate(&mut h, PLAYLIST_URL, 100).await;

        h.controller.invoke(TransformKind::SortTitle).expect("sort applies");
        assert_eq!(titles(&h.tree), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(h.controller.current_transform(), TransformKind::SortTitle);
        let saved = h.controller.saved_records_summary();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].transform, TransformKind::SortTitle);

        h.controller.reset().expect("reset applies");
        assert_eq!(titles(&h.tree), TITLES.to_vec());
        assert_eq!(h.controller.current_transform(), TransformKind::None);
        assert!(h.controller.saved_records_summary().is_empty());

        assert_eq!(
            notes(&h),
            vec![
                (
                    "Playlist sorted alphabetically! 🔤".to_string(),
                    Severity::Success
                ),
                (
                    "Playlist restored to original order! 🔄".to_string(),
                    Severity::Success
                ),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_reusable_after_several_transforms() {
        let mut h = harness(playlist_page(&TITLES));
        activate(&mut h, PLAYLIST_URL, 100).await;

        for kind in [
            TransformKind::Shuffle,
            TransformKind::Reverse,
            TransformKind::SortDuration,
        ] {
            h.controller.invoke(kind).expect("transform applies");
            h.controller.reset().expect("reset applies");
            assert_eq!(titles(&h.tree), TITLES.to_vec());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replays_fresh_record_silently() {
        let mut store = SettingsStore::in_memory();
        let captured = Utc::now() - chrono::Duration::days(1);
        store
            .upsert("PL1", TransformKind::SortTitle, captured)
            .expect("stored");
        let mut h = harness_with(playlist_page(&TITLES), store, Config::default());
        activate(&mut h, PLAYLIST_URL, 100).await;
        assert_eq!(titles(&h.tree), TITLES.to_vec());

        elapse(&mut h, 1_000).await;

        assert_eq!(titles(&h.tree), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(h.controller.current_transform(), TransformKind::SortTitle);
        assert!(notes(&h).is_empty());
        let saved = h.controller.saved_records_summary();
        assert!(saved[0].captured_at > captured);
        assert!(drain(&mut h.events).contains(&EngineEvent::TransformApplied {
            kind: TransformKind::SortTitle,
            silent: true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_not_replayed() {
        let mut store = SettingsStore::in_memory();
        store
            .upsert(
                "PL1",
                TransformKind::SortTitle,
                Utc::now() - chrono::Duration::days(8),
            )
            .expect("stored");
        let mut h = harness_with(playlist_page(&TITLES), store, Config::default());
        activate(&mut h, PLAYLIST_URL, 100).await;

        elapse(&mut h, 5_000).await;

        assert_eq!(titles(&h.tree), TITLES.to_vec());
        assert_eq!(h.controller.current_transform(), TransformKind::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remember_sort_off_disables_replay() {
        let mut store = SettingsStore::in_memory();
        store
            .upsert("PL1", TransformKind::Reverse, Utc::now())
            .expect("stored");
        store
            .update_settings(|settings| settings.remember_sort = false)
            .expect("stored");
        let mut h = harness_with(playlist_page(&TITLES), store, Config::default());
        activate(&mut h, PLAYLIST_URL, 100).await;

        elapse(&mut h, 5_000).await;

        assert_eq!(titles(&h.tree), TITLES.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shuffle_is_not_reapplied() {
        let mut h = harness(watch_page(&TITLES));
        activate(&mut h, WATCH_URL, 1_500).await;
        h.controller.invoke(TransformKind::Shuffle).expect("shuffle applies");
        let shuffled = titles(&h.tree);

        h.controller
            .handle_message(Message::Host(HostEvent::PlaybackEnded));
        elapse(&mut h, 1_000).await;

        assert_eq!(titles(&h.tree), shuffled);
        assert_eq!(h.controller.current_transform(), TransformKind::Shuffle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reapplies_sort_after_host_rerender() {
        let mut h = harness(watch_page(&TITLES));
        activate(&mut h, WATCH_URL, 1_500).await;
        h.controller.invoke(TransformKind::SortTitle).expect("sort applies");

        let container = items_node(&h);
        lock_tree(&h.tree).replace_children(container, &items(&TITLES));
        navigate(&mut h, NEXT_WATCH_URL);
        assert_eq!(titles(&h.tree), TITLES.to_vec());

        elapse(&mut h, 500).await;

        assert_eq!(titles(&h.tree), vec!["A", "B", "C", "D", "E"]);
        assert!(h.controller.is_active());
        assert_eq!(notes(&h).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_is_not_doubled_without_rerender() {
        let mut h = harness(watch_page(&TITLES));
        activate(&mut h, WATCH_URL, 1_500).await;
        h.controller.invoke(TransformKind::Reverse).expect("reverse applies");

        h.controller
            .handle_message(Message::Host(HostEvent::PlaybackEnded));
        elapse(&mut h, 1_000).await;

        assert_eq!(titles(&h.tree), vec!["C", "B", "D", "A", "E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_appended_item_keeps_reversed_order() {
        let mut h = harness(watch_page(&TITLES));
        activate(&mut h, WATCH_URL, 1_500).await;
        h.controller.invoke(TransformKind::Reverse).expect("reverse applies");

        let container = items_node(&h);
        lock_tree(&h.tree).append_spec(container, &item("F"));
        navigate(&mut h, NEXT_WATCH_URL);
        elapse(&mut h, 500).await;

        assert_eq!(titles(&h.tree), vec!["F", "C", "B", "D", "A", "E"]);
        assert_eq!(h.controller.current_transform(), TransformKind::Reverse);

        h.controller
            .handle_message(Message::Host(HostEvent::PlaybackEnded));
        elapse(&mut h, 1_000).await;
        assert_eq!(titles(&h.tree), vec!["F", "C", "B", "D", "A", "E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_without_identity_has_no_continuity() {
        let mut store = SettingsStore::in_memory();
        store
            .upsert("PL1", TransformKind::Reverse, Utc::now())
            .expect("stored");
        let mut h = harness_with(
            DocumentTree::new(
                &ElementSpec::new("body").child(
                    ElementSpec::new("div")
                        .id("playlist-items")
                        .children(items(&TITLES)),
                ),
            ),
            store,
            Config::default(),
        );
        activate(&mut h, "https://www.youtube.com/feed/library", 100).await;
        assert_eq!(h.controller.playlist_id(), None);

        elapse(&mut h, 2_000).await;
        assert_eq!(titles(&h.tree), TITLES.to_vec());

        h.controller.invoke(TransformKind::SortTitle).expect("sort applies");
        assert_eq!(titles(&h.tree), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(h.controller.saved_records_summary().len(), 1);

        let region = lock_tree(&h.tree)
            .element_by_id("playlist-items")
            .expect("items region");
        lock_tree(&h.tree).replace_children(region, &items(&TITLES));
        h.controller
            .handle_message(Message::Host(HostEvent::PlaybackEnded));
        elapse(&mut h, 1_000).await;

        assert_eq!(titles(&h.tree), TITLES.to_vec());
        assert_eq!(h.controller.current_transform(), TransformKind::SortTitle);
    }

    #[test]
    fn test_merge_reversed_needs_committed_order_in_place() {
        assert_eq!(
            merge_reversed(&[3, 2, 1], &[3, 2, 1, 4, 5]),
            Some(vec![5, 4, 3, 2, 1])
        );
        assert_eq!(merge_reversed(&[3, 2, 1], &[1, 2, 3, 4]), None);
        assert_eq!(merge_reversed(&[3, 2, 1], &[7, 8, 9]), None);
        assert_eq!(merge_reversed(&[3, 2, 1], &[3, 1]), Some(vec![3, 1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_playlist_cancels_pending_replay() {
        let mut store = SettingsStore::in_memory();
        store
            .upsert("PL1", TransformKind::Reverse, Utc::now())
            .expect("stored");
        let mut h = harness_with(playlist_page(&TITLES), store, Config::default());
        activate(&mut h, PLAYLIST_URL, 100).await;

        navigate(&mut h, "https://www.youtube.com/feed/subscriptions");
        elapse(&mut h, 2_000).await;

        assert!(!h.controller.is_active());
        assert_eq!(titles(&h.tree), TITLES.to_vec());
        assert!(drain(&mut h.events).contains(&EngineEvent::Deactivated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_is_a_noop() {
        let mut h = harness(playlist_page(&TITLES));
        activate(&mut h, PLAYLIST_URL, 100).await;
        let stale_epoch = h.controller.epoch;

        h.controller.deactivate();
        h.controller.timers.push(ScheduledTask {
            due: tokio::time::Instant::now(),
            task: Task::Discover,
            epoch: stale_epoch,
        });
        h.controller.run_due_tasks();

        assert!(!h.controller.is_active());
        assert!(h.controller.timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_request_is_rejected() {
        let mut h = harness(playlist_page(&TITLES));
        activate(&mut h, PLAYLIST_URL, 100).await;
        let lock = h.controller.activity_lock();

        let held = lock.try_acquire("PL1").expect("lock is free");
        assert!(matches!(
            h.controller.invoke(TransformKind::Reverse),
            Err(EngineError::Busy(id)) if id == "PL1"
        ));
        assert_eq!(titles(&h.tree), TITLES.to_vec());

        drop(held);
        assert!(!lock.is_busy("PL1"));
        h.controller.invoke(TransformKind::Reverse).expect("lock released");
        assert_eq!(titles(&h.tree), vec!["C", "B", "D", "A", "E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_while_inactive_report_errors() {
        let mut h = harness(playlist_page(&TITLES));

        assert!(matches!(
            h.controller.invoke(TransformKind::Reverse),
            Err(EngineError::Inactive)
        ));
        assert!(matches!(
            h.controller.reset(),
            Err(EngineError::SnapshotMissing)
        ));
        assert!(matches!(
            h.controller.invoke(TransformKind::None),
            Err(EngineError::NotInvokable(TransformKind::None))
        ));
        assert_eq!(
            notes(&h),
            vec![
                ("No playlist items found!".to_string(), Severity::Error),
                ("No original order saved!".to_string(), Severity::Error),
            ]
        );

        h.controller
            .update_settings(|settings| settings.notifications = false)
            .expect("stored");
        let _ = h.controller.reset();
        assert_eq!(notes(&h).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries_until_items_render() {
        let mut h = harness(DocumentTree::new(
            &ElementSpec::new("body").child(ElementSpec::new("div").id("contents")),
        ));
        navigate(&mut h, PLAYLIST_URL);
        h.controller.run_due_tasks();
        elapse(&mut h, 100).await;
        assert!(!h.controller.is_active());
        assert_eq!(
            drain(&mut h.events),
            vec![EngineEvent::DiscoveryRetry { attempt: 1 }]
        );

        {
            let mut tree = lock_tree(&h.tree);
            let contents = tree.element_by_id("contents").expect("contents");
            tree.replace_children(contents, &items(&TITLES));
        }
        elapse(&mut h, 1_000).await;

        assert!(h.controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_gives_up_after_max_retries() {
        let mut config = Config::default();
        config.discovery.max_retries = 2;
        let mut h = harness_with(
            DocumentTree::new(&ElementSpec::new("body")),
            SettingsStore::in_memory(),
            config,
        );
        navigate(&mut h, PLAYLIST_URL);
        h.controller.run_due_tasks();
        for _ in 0..4 {
            elapse(&mut h, 1_000).await;
        }

        assert_eq!(
            drain(&mut h.events),
            vec![
                EngineEvent::DiscoveryRetry { attempt: 1 },
                EngineEvent::DiscoveryRetry { attempt: 2 },
                EngineEvent::DiscoveryGaveUp,
            ]
        );
        assert!(h.controller.timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_insertion_activates_watch_view() {
        let mut h = harness(DocumentTree::new(
            &ElementSpec::new("body").child(ElementSpec::new("div").id("secondary")),
        ));
        navigate(&mut h, WATCH_URL);
        h.controller.run_due_tasks();
        assert!(h.controller.timers.is_empty());

        let inserted = {
            let mut tree = lock_tree(&h.tree);
            let secondary = tree.element_by_id("secondary").expect("secondary");
            tree.append_spec(secondary, &panel(&TITLES))
        };
        h.controller.handle_message(Message::Host(HostEvent::TreeChanged {
            added: vec![inserted],
        }));
        elapse(&mut h, 500).await;
        assert!(!h.controller.is_active());
        elapse(&mut h, 1_500).await;

        assert!(h.controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_round_trip() {
        let h = harness(playlist_page(&TITLES));
        let Harness {
            controller,
            tree,
            mut events,
            ..
        } = h;
        let (inbox, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(controller.run(receiver));

        inbox
            .send(Message::Host(HostEvent::LocationChanged(
                PLAYLIST_URL.to_string(),
            )))
            .expect("send");
        assert!(matches!(
            events.recv().await.expect("event"),
            EngineEvent::Activated { item_count: 5, .. }
        ));

        inbox
            .send(Message::Command(EngineCommand::Invoke(
                TransformKind::SortTitle,
            )))
            .expect("send");
        assert_eq!(
            events.recv().await.expect("event"),
            EngineEvent::TransformApplied {
                kind: TransformKind::SortTitle,
                silent: false,
            }
        );
        assert_eq!(titles(&tree), vec!["A", "B", "C", "D", "E"]);

        let (reply, current) = oneshot::channel();
        inbox
            .send(Message::Command(EngineCommand::CurrentTransform(reply)))
            .expect("send");
        assert_eq!(current.await.expect("reply"), TransformKind::SortTitle);

        inbox.send(Message::Shutdown).expect("send");
        task.await.expect("loop ends");
        assert_eq!(
            events.recv().await.expect("event"),
            EngineEvent::Deactivated
        );
    }

    #[test]
    fn test_lists_invokable_kinds_in_menu_order() {
        assert_eq!(
            SyncController::<DocumentTree>::list_transform_kinds(),
            &[
                TransformKind::Reverse,
                TransformKind::Shuffle,
                TransformKind::SortTitle,
                TransformKind::SortDuration,
                TransformKind::SortRecency,
            ]
        );
    }
}
