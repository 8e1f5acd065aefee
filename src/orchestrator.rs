//! Starts and stops a long-running background activity (e.g., a session's sync loop)
//! based on environment signals such as app visibility and network reachability.
//!
//! Each [`OrchestratedTask`] is driven by a single spawned driver task that owns all state
//! changes, such that start and stop requests from callers, signal changes,
//! and the activity's own state reports are handled strictly one at a time.
//! The task's state is an explicit [`TaskState`] that only ever changes
//! through [`TaskState::transition()`].
//!
//! ```text
//!                       StartRequested          Started
//!   ┌─────────┐ ─────────────────────→ Starting ───────→ Running
//!   │ Stopped │                           │                │
//!   └─────────┘ ←── Stopping ←────────────┴────────────────┘
//!               StopFinished     StopRequested
//! ```

use std::{sync::Arc, time::Duration};

use eyeball::{SharedObservable, Subscriber};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{config::SyncConfig, triggers::sleep_until_deadline};


/// The state that a background activity reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    /// Not running.
    Idle,
    Running,
    /// Running, but unable to reach its remote end. It keeps retrying on its own.
    Offline,
    /// Stopped because of an error. It may be started again.
    Error,
    /// Stopped permanently, e.g., because its session's credentials were revoked.
    Terminated,
}

/// A long-running activity whose lifecycle is managed by an [`OrchestratedTask`].
///
/// Starting an already-running activity and stopping an already-stopped one
/// must both be harmless.
#[async_trait::async_trait]
pub trait BackgroundActivity: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    /// Subscribes to the activity's self-reported state.
    fn state(&self) -> Subscriber<ActivityState>;
}


/// The state of an [`OrchestratedTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The activity failed to start or failed while running.
    /// A failure while running is retried right away if the signals still want it running,
    /// a failed start on the next favourable signal change or explicit start.
    Failed { reason: String },
    /// The activity stopped permanently. Nothing restarts it automatically.
    Terminated { reason: String },
}

/// Everything that can change a [`TaskState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    StartRequested,
    Started,
    StartFailed(String),
    StopRequested,
    StopFinished,
    ActivityRunning,
    ActivityStopped,
    ActivityFailed(String),
    ActivityTerminated(String),
}

impl TaskState {
    /// Returns the state that `event` leads to, or `None` if `event` doesn't apply
    /// in this state (which is never an error, e.g., starting a running task).
    pub fn transition(&self, event: &TaskEvent) -> Option<TaskState> {
        use TaskEvent as E;
        use TaskState as S;
        match (self, event) {
            // A terminated activity can only be stopped, to release what it holds.
            (S::Terminated { .. }, E::StopRequested) => Some(S::Stopping),
            (S::Terminated { .. }, _) => None,
            (_, E::ActivityTerminated(reason)) => Some(S::Terminated { reason: reason.clone() }),

            (S::Stopped | S::Failed { .. }, E::StartRequested) => Some(S::Starting),
            (S::Starting | S::Running | S::Stopping, E::StartRequested) => None,
            (S::Starting, E::Started) => Some(S::Running),
            (S::Starting, E::StartFailed(reason)) => Some(S::Failed { reason: reason.clone() }),
            (_, E::Started | E::StartFailed(_)) => None,

            (S::Starting | S::Running | S::Failed { .. }, E::StopRequested) => Some(S::Stopping),
            (S::Stopped | S::Stopping, E::StopRequested) => None,
            (S::Stopping, E::StopFinished) => Some(S::Stopped),
            (_, E::StopFinished) => None,

            // The activity was already running, or recovered by itself.
            (S::Stopped | S::Failed { .. }, E::ActivityRunning) => Some(S::Running),
            (_, E::ActivityRunning) => None,
            (S::Running, E::ActivityStopped) => Some(S::Stopped),
            (_, E::ActivityStopped) => None,
            (S::Running, E::ActivityFailed(reason)) => Some(S::Failed { reason: reason.clone() }),
            (_, E::ActivityFailed(_)) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl TaskEvent {
    /// Maps an activity's self-reported state to the event it causes, if any.
    pub fn from_activity_state(state: ActivityState) -> Option<Self> {
        match state {
            ActivityState::Idle => Some(TaskEvent::ActivityStopped),
            ActivityState::Running => Some(TaskEvent::ActivityRunning),
            ActivityState::Offline => None,
            ActivityState::Error => Some(TaskEvent::ActivityFailed("activity reported an error".into())),
            ActivityState::Terminated => Some(TaskEvent::ActivityTerminated("activity terminated".into())),
        }
    }
}


/// One boolean environment signal, either observed or constant.
struct Signal {
    subscriber: Option<Subscriber<bool>>,
    value: bool,
}

impl Signal {
    fn constant(value: bool) -> Self {
        Self { subscriber: None, value }
    }

    fn observed(subscriber: Subscriber<bool>) -> Self {
        Self { value: subscriber.get(), subscriber: Some(subscriber) }
    }

    /// Waits until the signal's value actually changes.
    /// Once its observable is gone, the signal keeps its last value forever.
    async fn changed(&mut self) {
        loop {
            let Some(subscriber) = self.subscriber.as_mut() else {
                return std::future::pending().await;
            };
            match subscriber.next().await {
                Some(value) if value != self.value => {
                    self.value = value;
                    return;
                }
                Some(_) => {}
                None => self.subscriber = None,
            }
        }
    }
}

/// The environment signals that decide whether a background activity should be running.
///
/// The activity should run while the network is reachable and at least one of
/// these holds: the app is in the foreground, a notification event is being synced,
/// or a call is ongoing.
pub struct EnvironmentSignals {
    foreground: Signal,
    network: Signal,
    notification_sync: Signal,
    in_call: Signal,
}

impl EnvironmentSignals {
    pub fn new(foreground: Subscriber<bool>, network: Subscriber<bool>) -> Self {
        Self {
            foreground: Signal::observed(foreground),
            network: Signal::observed(network),
            notification_sync: Signal::constant(false),
            in_call: Signal::constant(false),
        }
    }

    pub fn with_notification_sync(mut self, notification_sync: Subscriber<bool>) -> Self {
        self.notification_sync = Signal::observed(notification_sync);
        self
    }

    pub fn with_in_call(mut self, in_call: Subscriber<bool>) -> Self {
        self.in_call = Signal::observed(in_call);
        self
    }

    pub fn wants_activity(&self) -> bool {
        self.network.value
            && (self.foreground.value || self.notification_sync.value || self.in_call.value)
    }

    /// Waits until any signal changes.
    async fn changed(&mut self) {
        tokio::select! {
            _ = self.foreground.changed() => {}
            _ = self.network.changed() => {}
            _ = self.notification_sync.changed() => {}
            _ = self.in_call.changed() => {}
        }
    }
}

/// Settable sources for every [`EnvironmentSignals`] input.
///
/// Platform integrations (or tests) set these; every task subscribes to them.
#[derive(Clone)]
pub struct SignalSources {
    foreground: SharedObservable<bool>,
    network: SharedObservable<bool>,
    notification_sync: SharedObservable<bool>,
    in_call: SharedObservable<bool>,
}

impl SignalSources {
    pub fn new(foreground: bool, network: bool) -> Self {
        Self {
            foreground: SharedObservable::new(foreground),
            network: SharedObservable::new(network),
            notification_sync: SharedObservable::new(false),
            in_call: SharedObservable::new(false),
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.set_if_not_eq(foreground);
    }

    pub fn set_network(&self, reachable: bool) {
        self.network.set_if_not_eq(reachable);
    }

    pub fn set_notification_sync(&self, syncing: bool) {
        self.notification_sync.set_if_not_eq(syncing);
    }

    pub fn set_in_call(&self, in_call: bool) {
        self.in_call.set_if_not_eq(in_call);
    }

    pub fn subscribe(&self) -> EnvironmentSignals {
        EnvironmentSignals::new(self.foreground.subscribe(), self.network.subscribe())
            .with_notification_sync(self.notification_sync.subscribe())
            .with_in_call(self.in_call.subscribe())
    }
}


enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Why the driver loop woke up.
enum Wake {
    Shutdown,
    Command(Command),
    SignalsChanged,
    Activity(ActivityState),
    ActivityGone,
    GracePeriodElapsed,
}

/// A background activity whose running state follows its environment signals.
///
/// See the module-level docs.
pub struct OrchestratedTask {
    name: String,
    state: SharedObservable<TaskState>,
    commands: mpsc::UnboundedSender<Command>,
    scope: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OrchestratedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratedTask")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl OrchestratedTask {
    /// Spawns the driver for `activity` within a child of `scope`.
    ///
    /// If `config.initial_start` is set, the activity is started once right away,
    /// regardless of the signals; if the signals don't want it running,
    /// it is then stopped after the usual grace period.
    pub fn launch(
        name: impl Into<String>,
        scope: &CancellationToken,
        activity: Arc<dyn BackgroundActivity>,
        signals: EnvironmentSignals,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let state = SharedObservable::new(TaskState::Stopped);
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let scope = scope.child_token();
        let driver = Driver {
            name: name.clone(),
            activity_state: activity.state(),
            activity,
            activity_gone: false,
            signals,
            state: state.clone(),
            grace_period: config.stop_grace_period(),
            stop_deadline: None,
            held: false,
        };
        let handle = tokio::spawn(driver.run(scope.clone(), command_receiver, config.initial_start));
        Arc::new(Self {
            name,
            state,
            commands,
            scope,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn subscribe(&self) -> Subscriber<TaskState> {
        self.state.subscribe()
    }

    /// Starts the activity now, and resumes following the environment signals
    /// if an earlier [`stop()`](Self::stop) suspended that.
    ///
    /// Returns once the start attempt has finished. Does nothing after shutdown.
    pub async fn start(&self) {
        self.send(Command::Start).await;
    }

    /// Stops the activity now and keeps it stopped, whatever the signals say,
    /// until the next [`start()`](Self::start).
    pub async fn stop(&self) {
        self.send(Command::Stop).await;
    }

    async fn send(&self, command: fn(oneshot::Sender<()>) -> Command) {
        let (ack_sender, ack) = oneshot::channel();
        if self.commands.send(command(ack_sender)).is_err() {
            debug!(task = %self.name, "Ignoring command, task has shut down");
            return;
        }
        let _ = ack.await;
    }

    /// Begins shutting down without waiting for the activity to stop.
    pub fn request_shutdown(&self) {
        self.scope.cancel();
    }

    /// Stops the activity and ends the driver. The final state is [`TaskState::Stopped`].
    ///
    /// Safe to call more than once, and from multiple callers.
    pub async fn shutdown(&self) {
        self.scope.cancel();
        // Later callers wait on the lock until the first one has joined the driver.
        let mut driver = self.driver.lock().await;
        let Some(handle) = driver.take() else { return };
        if let Err(e) = handle.await {
            error!(task = %self.name, "Orchestrated task driver panicked: {e}");
        }
    }
}


struct Driver {
    name: String,
    activity: Arc<dyn BackgroundActivity>,
    activity_state: Subscriber<ActivityState>,
    activity_gone: bool,
    signals: EnvironmentSignals,
    state: SharedObservable<TaskState>,
    grace_period: Duration,
    /// When a signal-driven stop takes effect, unless the signals recover first.
    stop_deadline: Option<Instant>,
    /// Set by an explicit stop: ignore the signals until an explicit start.
    held: bool,
}

impl Driver {
    async fn run(
        mut self,
        scope: CancellationToken,
        mut commands: mpsc::UnboundedReceiver<Command>,
        initial_start: bool,
    ) {
        let initial_activity_state = self.activity_state.get();
        self.on_activity_state(initial_activity_state);
        if initial_start {
            self.start_activity().await;
            self.schedule_stop_if_unwanted();
        } else {
            self.reconcile().await;
        }

        loop {
            let wake = tokio::select! {
                biased;
                _ = scope.cancelled() => Wake::Shutdown,
                command = commands.recv() => command.map_or(Wake::Shutdown, Wake::Command),
                _ = self.signals.changed() => Wake::SignalsChanged,
                activity_state = self.activity_state.next(), if !self.activity_gone => {
                    activity_state.map_or(Wake::ActivityGone, Wake::Activity)
                }
                _ = sleep_until_deadline(self.stop_deadline) => Wake::GracePeriodElapsed,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Command(Command::Start(ack)) => {
                    info!(task = %self.name, "Explicit start requested");
                    self.held = false;
                    self.stop_deadline = None;
                    self.start_activity().await;
                    let _ = ack.send(());
                }
                Wake::Command(Command::Stop(ack)) => {
                    info!(task = %self.name, "Explicit stop requested");
                    self.held = true;
                    self.stop_activity().await;
                    let _ = ack.send(());
                }
                Wake::SignalsChanged => self.reconcile().await,
                Wake::Activity(activity_state) => {
                    if self.on_activity_state(activity_state) && !self.held && self.signals.wants_activity() {
                        info!(task = %self.name, ?activity_state, "Activity stopped by itself while still wanted, restarting");
                        self.reconcile().await;
                    }
                }
                Wake::ActivityGone => {
                    warn!(task = %self.name, "Activity state observable was dropped");
                    self.activity_gone = true;
                }
                Wake::GracePeriodElapsed => {
                    self.stop_deadline = None;
                    if !self.held && !self.signals.wants_activity() {
                        info!(task = %self.name, "Grace period elapsed, stopping activity");
                        self.stop_activity().await;
                    }
                }
            }
        }

        info!(task = %self.name, "Shutting down orchestrated task");
        self.stop_activity().await;
    }

    /// Applies `event` to the current state, returning whether it changed anything.
    fn apply(&self, event: TaskEvent) -> bool {
        let current = self.state.get();
        match current.transition(&event) {
            Some(next) => {
                debug!(task = %self.name, ?event, from = ?current, to = ?next, "Task state transition");
                self.state.set(next);
                true
            }
            None => {
                trace!(task = %self.name, ?event, state = ?current, "Event does not apply to current state");
                false
            }
        }
    }

    /// Returns whether the activity stopped or failed by itself.
    fn on_activity_state(&self, activity_state: ActivityState) -> bool {
        let Some(event) = TaskEvent::from_activity_state(activity_state) else { return false };
        let stopped_by_itself = matches!(event, TaskEvent::ActivityStopped | TaskEvent::ActivityFailed(_));
        self.apply(event) && stopped_by_itself
    }

    async fn start_activity(&mut self) {
        if !self.apply(TaskEvent::StartRequested) {
            return;
        }
        match self.activity.start().await {
            Ok(()) => {
                self.apply(TaskEvent::Started);
            }
            Err(e) => {
                warn!(task = %self.name, "Failed to start activity: {e:#}");
                self.apply(TaskEvent::StartFailed(format!("{e:#}")));
            }
        }
    }

    /// Stopping always ends in [`TaskState::Stopped`]; a failure to stop is only logged.
    async fn stop_activity(&mut self) {
        self.stop_deadline = None;
        if !self.apply(TaskEvent::StopRequested) {
            return;
        }
        if let Err(e) = self.activity.stop().await {
            error!(task = %self.name, "Failed to stop activity: {e:#}");
        }
        self.apply(TaskEvent::StopFinished);
    }

    /// Starts the activity right away if the signals want it running,
    /// otherwise schedules a stop after the grace period.
    async fn reconcile(&mut self) {
        if self.held {
            return;
        }
        if !self.signals.wants_activity() {
            self.schedule_stop_if_unwanted();
            return;
        }
        if self.stop_deadline.take().is_some() {
            debug!(task = %self.name, "Signals recovered, cancelling pending stop");
        }
        if matches!(self.state.get(), TaskState::Stopped | TaskState::Failed { .. }) {
            self.start_activity().await;
        }
    }

    fn schedule_stop_if_unwanted(&mut self) {
        if self.held || self.stop_deadline.is_some() || self.signals.wants_activity() {
            return;
        }
        if matches!(self.state.get(), TaskState::Starting | TaskState::Running | TaskState::Failed { .. }) {
            debug!(task = %self.name, grace_period = ?self.grace_period, "Signals unfavourable, scheduling stop");
            self.stop_deadline = Some(Instant::now() + self.grace_period);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    const GRACE: Duration = Duration::from_secs(5);

    struct FakeActivity {
        state: SharedObservable<ActivityState>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: AtomicBool,
    }

    impl FakeActivity {
        fn new(state: ActivityState) -> Arc<Self> {
            Arc::new(Self {
                state: SharedObservable::new(state),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
            })
        }
        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl BackgroundActivity for FakeActivity {
        async fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                anyhow::bail!("homeserver unreachable");
            }
            self.state.set(ActivityState::Running);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.state.set(ActivityState::Idle);
            Ok(())
        }
        fn state(&self) -> Subscriber<ActivityState> {
            self.state.subscribe()
        }
    }

    fn config() -> SyncConfig {
        SyncConfig { stop_grace_period_ms: GRACE.as_millis() as u64, ..SyncConfig::default() }
    }

    fn launch(activity: &Arc<FakeActivity>, sources: &SignalSources) -> Arc<OrchestratedTask> {
        OrchestratedTask::launch("sync", &CancellationToken::new(), activity.clone(), sources.subscribe(), &config())
    }

    async fn wait_for(task: &OrchestratedTask, expected: TaskState) {
        let mut subscriber = task.subscribe();
        tokio::time::timeout(Duration::from_secs(60), async {
            while subscriber.get() != expected {
                subscriber.next().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task never reached {expected:?}, still {:?}", task.state()));
    }

    /// Lets the driver handle everything that's ready, without letting timers fire.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn transitions() {
        use TaskEvent as E;
        use TaskState as S;
        assert_eq!(S::Stopped.transition(&E::StartRequested), Some(S::Starting));
        assert_eq!(S::Running.transition(&E::StartRequested), None);
        assert_eq!(S::Stopped.transition(&E::StopRequested), None);
        assert_eq!(S::Running.transition(&E::StopRequested), Some(S::Stopping));
        assert_eq!(S::Stopping.transition(&E::StopFinished), Some(S::Stopped));
        assert_eq!(
            S::Starting.transition(&E::StartFailed("boom".into())),
            Some(S::Failed { reason: "boom".into() }),
        );
        assert_eq!(S::Failed { reason: "boom".into() }.transition(&E::StartRequested), Some(S::Starting));
        assert_eq!(
            S::Running.transition(&E::ActivityTerminated("revoked".into())),
            Some(S::Terminated { reason: "revoked".into() }),
        );
        let terminated = S::Terminated { reason: "revoked".into() };
        assert_eq!(terminated.transition(&E::StartRequested), None);
        assert_eq!(terminated.transition(&E::ActivityRunning), None);
        assert_eq!(terminated.transition(&E::StopRequested), Some(S::Stopping));
        assert_eq!(S::Stopped.transition(&E::ActivityRunning), Some(S::Running));
        assert_eq!(S::Running.transition(&E::ActivityStopped), Some(S::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_start_happens_even_when_offline_then_stops_after_grace_period() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, false);
        let started_at = Instant::now();
        let task = launch(&activity, &sources);

        wait_for(&task, TaskState::Running).await;
        assert_eq!(activity.starts(), 1);

        wait_for(&task, TaskState::Stopped).await;
        assert!(started_at.elapsed() >= GRACE);
        assert_eq!(activity.stops(), 1);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn going_to_background_stops_after_grace_period_and_foreground_restarts() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        sources.set_foreground(false);
        tokio::time::sleep(GRACE - Duration::from_secs(1)).await;
        assert_eq!(task.state(), TaskState::Running);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(activity.stops(), 1);

        sources.set_foreground(true);
        wait_for(&task, TaskState::Running).await;
        assert_eq!(activity.starts(), 2);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn quick_return_to_foreground_cancels_the_stop() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        sources.set_foreground(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        sources.set_foreground(true);
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(activity.stops(), 0);
        assert_eq!(activity.starts(), 1);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn notification_sync_or_call_keeps_activity_alive_in_background() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        sources.set_notification_sync(true);
        sources.set_foreground(false);
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(task.state(), TaskState::Running);

        sources.set_in_call(true);
        sources.set_notification_sync(false);
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(task.state(), TaskState::Running);

        sources.set_in_call(false);
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(task.state(), TaskState::Stopped);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn losing_network_stops_even_in_foreground() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        sources.set_network(false);
        wait_for(&task, TaskState::Stopped).await;
        sources.set_network(true);
        wait_for(&task, TaskState::Running).await;
        assert_eq!(activity.starts(), 2);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn already_running_activity_is_not_started_again() {
        let activity = FakeActivity::new(ActivityState::Running);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        settle().await;
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(activity.starts(), 0);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_holds_until_explicit_start() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        task.stop().await;
        assert_eq!(task.state(), TaskState::Stopped);
        task.stop().await;
        assert_eq!(activity.stops(), 1);

        sources.set_foreground(false);
        settle().await;
        sources.set_foreground(true);
        settle().await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(activity.starts(), 1);

        task.start().await;
        assert_eq!(task.state(), TaskState::Running);
        task.start().await;
        assert_eq!(activity.starts(), 2);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_is_a_state_and_a_later_signal_retries() {
        let activity = FakeActivity::new(ActivityState::Idle);
        activity.fail_start.store(true, Ordering::SeqCst);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        settle().await;
        assert!(matches!(task.state(), TaskState::Failed { reason } if reason.contains("unreachable")));

        activity.fail_start.store(false, Ordering::SeqCst);
        sources.set_network(false);
        settle().await;
        sources.set_network(true);
        wait_for(&task, TaskState::Running).await;
        assert_eq!(activity.starts(), 2);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_activity_is_never_restarted_automatically() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        activity.state.set(ActivityState::Terminated);
        wait_for(&task, TaskState::Terminated { reason: "activity terminated".into() }).await;
        sources.set_foreground(false);
        settle().await;
        sources.set_foreground(true);
        tokio::time::sleep(GRACE * 2).await;
        assert!(matches!(task.state(), TaskState::Terminated { .. }));
        assert_eq!(activity.starts(), 1);

        task.shutdown().await;
        assert_eq!(task.state(), TaskState::Stopped);
    }

    async fn wait_for_starts(activity: &FakeActivity, expected: usize) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while activity.starts() < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("activity was started {} times, expected {expected}", activity.starts()));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_going_idle_while_wanted_is_restarted() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        activity.state.set(ActivityState::Idle);
        wait_for_starts(&activity, 2).await;
        wait_for(&task, TaskState::Running).await;
        assert_eq!(activity.stops(), 0);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn activity_error_while_wanted_is_retried() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        activity.state.set(ActivityState::Error);
        wait_for_starts(&activity, 2).await;
        wait_for(&task, TaskState::Running).await;
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn activity_going_idle_without_network_stays_stopped() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        sources.set_network(false);
        settle().await;
        activity.state.set(ActivityState::Idle);
        wait_for(&task, TaskState::Stopped).await;
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(activity.starts(), 1);
        assert_eq!(activity.stops(), 0);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_shutdowns_all_wait_for_the_stop() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let task = launch(&activity, &sources);
        wait_for(&task, TaskState::Running).await;

        let other = task.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { other.shutdown().await }),
            async {
                task.shutdown().await;
                task.state()
            },
        );
        first.unwrap();
        assert_eq!(second, TaskState::Stopped);
        assert_eq!(activity.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_scope_runs_the_stop_path() {
        let activity = FakeActivity::new(ActivityState::Idle);
        let sources = SignalSources::new(true, true);
        let scope = CancellationToken::new();
        let task = OrchestratedTask::launch("sync", &scope, activity.clone(), sources.subscribe(), &config());
        wait_for(&task, TaskState::Running).await;

        scope.cancel();
        wait_for(&task, TaskState::Stopped).await;
        assert_eq!(activity.stops(), 1);

        // Commands after shutdown are ignored rather than hanging.
        task.start().await;
        task.shutdown().await;
        assert_eq!(task.state(), TaskState::Stopped);
    }
}
