//! The [`FiniteStateMachine`] façade and the state it shares with its event
//! loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MachineConfig;
use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::error::{ConfigError, LifecycleError, TaskError};
use crate::event::Event;
use crate::listener::{ListenerId, Listeners, TransitionListener};
use crate::model::{Model, State};
use crate::scheduler::{Command, EventLoop, ShutdownMode, Submission, Termination};

/// Lifecycle of a machine. Moves strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// State read and written by both the façade and the event loop.
pub(crate) struct Shared<S: State> {
    pub(crate) name: String,
    pub(crate) transitions: AtomicU64,
    pub(crate) listeners: Listeners<S>,
    /// Accepted events not yet processed, discarded or superseded.
    pending: AtomicU64,
    accepting: AtomicBool,
    allow_transitions: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    idle: Notify,
}

impl<S: State> Shared<S> {
    pub(crate) fn new(config: &MachineConfig) -> Self {
        Self {
            name: config.name.clone(),
            transitions: AtomicU64::new(0),
            listeners: Listeners::new(),
            pending: AtomicU64::new(0),
            accepting: AtomicBool::new(false),
            allow_transitions: AtomicBool::new(true),
            lifecycle: Mutex::new(Lifecycle::Created),
            idle: Notify::new(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Acquire)
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn transitions_allowed(&self) -> bool {
        self.allow_transitions.load(Ordering::Acquire)
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Counts one more pending event if the machine accepts events.
    pub(crate) fn try_admit(&self) -> bool {
        if !self.is_accepting() {
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Whether the event's acceptance hook refuses it.
    pub(crate) fn vetoes(&self, event: &dyn Event<S>) -> bool {
        let ctx = ExecutionContext::new(&self.name, self.transition_count());
        if event.on_accept(&ctx) {
            return false;
        }
        tracing::debug!(machine = %self.name, ?event, "event vetoed its own submission");
        true
    }

    /// Marks one pending event as done.
    pub(crate) fn settle(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    /// Drops every pending event and returns how many there were.
    pub(crate) fn discard_pending(&self) -> u64 {
        let discarded = self.pending.swap(0, Ordering::AcqRel);
        self.idle.notify_waiters();
        discarded
    }

    /// Stops accepting events and performing transitions. Returns `true` if
    /// this call moved a running machine to stopped.
    pub(crate) fn halt(&self) -> bool {
        self.accepting.store(false, Ordering::Release);
        self.allow_transitions.store(false, Ordering::Release);
        let stopped = {
            let mut lifecycle = self.lifecycle();
            let running = *lifecycle == Lifecycle::Running;
            if running {
                *lifecycle = Lifecycle::Stopped;
            }
            running
        };
        self.idle.notify_waiters();
        stopped
    }
}

/// A non-blocking finite state machine.
///
/// Events are submitted with [`process`](Self::process) and
/// [`process_later`](Self::process_later), which return immediately. A single
/// task on the machine's runtime evaluates them one at a time, so the
/// transitions of one machine never overlap while many machines share the
/// runtime's workers.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use nbfsm_core::{FiniteStateMachine, Model, TransitionTo};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum Light {
///     Off,
///     On,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let model = Model::builder()
///     .add("switch on", [Light::Off], Light::On)
///     .add("switch off", [Light::On], Light::Off)
///     .build()?;
///
/// let fsm = FiniteStateMachine::builder(Arc::new(model), Light::Off)
///     .name("light")
///     .build()?;
///
/// fsm.start()?;
/// fsm.process(TransitionTo(Light::On));
/// fsm.wait_for_state(Light::On).await?;
///
/// assert_eq!(fsm.transition_count(), 1);
/// assert!(fsm.quiesce_then_stop(None).await?);
/// # Ok(())
/// # }
/// ```
pub struct FiniteStateMachine<S: State> {
    shared: Arc<Shared<S>>,
    initial: S,
    runtime: Handle,
    quiesce_poll_interval: Duration,
    commands: mpsc::UnboundedSender<Command<S>>,
    shutdown_tx: watch::Sender<Option<ShutdownMode>>,
    state_rx: watch::Receiver<Option<S>>,
    /// Built eagerly, spawned by `start`.
    event_loop: Mutex<Option<EventLoop<S>>>,
    task: Mutex<Option<JoinHandle<Termination>>>,
}

/// Builder for [`FiniteStateMachine`].
pub struct FiniteStateMachineBuilder<S: State> {
    model: Arc<Model<S>>,
    initial: S,
    config: MachineConfig,
    runtime: Option<Handle>,
}

impl<S: State> FiniteStateMachineBuilder<S> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Replaces the whole configuration, including the name.
    pub fn config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the machine on `handle` instead of the ambient runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<FiniteStateMachine<S>, ConfigError> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };

        let shared = Arc::new(Shared::new(&self.config));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(None);

        let engine = Engine::new(
            self.model,
            Arc::clone(&shared),
            self.config.failure_policy,
            state_tx,
        );
        let event_loop = EventLoop::new(
            engine,
            Arc::clone(&shared),
            commands_rx,
            shutdown_rx,
            self.config.execution_timeout,
        );

        tracing::debug!(machine = %self.config.name, "machine created");

        Ok(FiniteStateMachine {
            shared,
            initial: self.initial,
            runtime,
            quiesce_poll_interval: self.config.quiesce_poll_interval,
            commands,
            shutdown_tx,
            state_rx,
            event_loop: Mutex::new(Some(event_loop)),
            task: Mutex::new(None),
        })
    }
}

impl<S: State> FiniteStateMachine<S> {
    /// Starts building a machine over `model` that enters `initial` when
    /// started.
    pub fn builder(model: Arc<Model<S>>, initial: S) -> FiniteStateMachineBuilder<S> {
        FiniteStateMachineBuilder {
            model,
            initial,
            config: MachineConfig::default(),
            runtime: None,
        }
    }

    /// Builds a machine with the default configuration on the ambient runtime.
    pub fn new(model: Arc<Model<S>>, initial: S) -> Result<Self, ConfigError> {
        Self::builder(model, initial).build()
    }

    /// Spawns the event loop and queues the entry into the initial state.
    ///
    /// Returns `Ok(false)` if the machine is already running. The initial
    /// state is entered asynchronously, so [`state`](Self::state) may still
    /// be `None` right after this returns.
    pub fn start(&self) -> Result<bool, LifecycleError> {
        let mut lifecycle = self.shared.lifecycle();
        match *lifecycle {
            Lifecycle::Running => return Ok(false),
            Lifecycle::Stopped => {
                return Err(LifecycleError::Stopped {
                    name: self.shared.name.clone(),
                });
            }
            Lifecycle::Created => {}
        }

        let Some(event_loop) = lock(&self.event_loop).take() else {
            return Ok(false);
        };

        // the entry must be queued ahead of any submission
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(Command::Enter(self.initial.clone())).is_err() {
            self.shared.settle();
        }
        self.shared.accepting.store(true, Ordering::Release);
        *lock(&self.task) = Some(self.runtime.spawn(event_loop.run()));
        *lifecycle = Lifecycle::Running;

        tracing::info!(machine = %self.shared.name, initial = ?self.initial, "machine started");
        Ok(true)
    }

    /// Stops the machine right away. Pending work is discarded; a transition
    /// already in progress completes.
    ///
    /// Returns `Ok(false)` if the machine was already stopped.
    pub fn stop(&self) -> Result<bool, LifecycleError> {
        if self.lifecycle() == Lifecycle::Created {
            return Err(LifecycleError::NotStarted {
                name: self.shared.name.clone(),
            });
        }
        let stopped = self.shared.halt();
        self.shutdown_tx.send_replace(Some(ShutdownMode::Immediate));
        self.shared.discard_pending();
        if stopped {
            tracing::info!(machine = %self.shared.name, "machine stopped");
        }
        Ok(stopped)
    }

    /// Stops accepting events, waits until every pending event has been
    /// processed (or `timeout` elapsed), then stops the machine.
    ///
    /// Returns `Ok(true)` if the pending work drained, `Ok(false)` if the
    /// machine was not running or the timeout elapsed first. Only the
    /// awaiting task is suspended.
    pub async fn quiesce_then_stop(&self, timeout: Option<Duration>) -> Result<bool, LifecycleError> {
        match self.lifecycle() {
            Lifecycle::Created => {
                return Err(LifecycleError::NotStarted {
                    name: self.shared.name.clone(),
                });
            }
            Lifecycle::Stopped => return Ok(false),
            Lifecycle::Running => {}
        }
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        tracing::debug!(
            machine = %self.shared.name,
            pending = self.shared.pending(),
            "quiescing machine"
        );
        self.shutdown_tx.send_replace(Some(ShutdownMode::Graceful));

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.shared.pending() == 0 || !self.shared.transitions_allowed() {
                break;
            }
            let mut wait = self.quiesce_poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                wait = wait.min(deadline - now);
            }
            let _ = tokio::time::timeout(wait, idle).await;
        }

        let drained = self.shared.pending() == 0;
        if !drained {
            tracing::warn!(
                machine = %self.shared.name,
                pending = self.shared.pending(),
                "stopping machine before pending work drained"
            );
        }
        self.shared.halt();
        if !drained {
            // a drained loop terminates on its own once it sees the graceful signal
            self.shutdown_tx.send_replace(Some(ShutdownMode::Immediate));
            self.shared.discard_pending();
        }
        tracing::info!(machine = %self.shared.name, drained, "machine quiesced and stopped");
        Ok(drained)
    }

    /// Submits an event for processing as soon as possible.
    ///
    /// Returns `false` if the machine does not accept events, i.e. it has not
    /// been started or is stopping, or if the event's
    /// [`on_accept`](Event::on_accept) hook vetoed it.
    pub fn process(&self, event: impl Event<S>) -> bool {
        self.submit(Box::new(event), None)
    }

    /// Submits an event to be processed once `delay` has elapsed.
    ///
    /// [`SubsequentEvent`](crate::SubsequentEvent) and
    /// [`CoalescedEvent`](crate::CoalescedEvent) wrappers are honoured; any
    /// other event is simply delayed.
    pub fn process_later(&self, event: impl Event<S>, delay: Duration) -> bool {
        self.submit(Box::new(event), Some(delay))
    }

    fn submit(&self, event: Box<dyn Event<S>>, delay: Option<Duration>) -> bool {
        if self.shared.vetoes(event.as_ref()) {
            return false;
        }
        if !self.shared.try_admit() {
            tracing::debug!(machine = %self.shared.name, ?event, "rejecting event, machine not accepting events");
            return false;
        }
        let submission = Submission::new(event, delay);
        if self.commands.send(Command::Submit(submission)).is_err() {
            self.shared.settle();
            return false;
        }
        true
    }

    /// The last committed state, `None` until the initial state is entered.
    pub fn state(&self) -> Option<S> {
        self.state_rx.borrow().clone()
    }

    /// Waits until the machine reaches `target`.
    pub async fn wait_for_state(&self, target: S) -> Result<(), watch::error::RecvError> {
        let mut rx = self.state_rx.clone();
        while rx.borrow_and_update().as_ref() != Some(&target) {
            rx.changed().await?;
        }
        Ok(())
    }

    /// Number of committed transitions, excluding the entry into the initial
    /// state.
    pub fn transition_count(&self) -> u64 {
        self.shared.transition_count()
    }

    pub fn add_listener(&self, listener: impl TransitionListener<S>) -> ListenerId {
        self.shared.listeners.add(Arc::new(listener))
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle()
    }

    /// Accepted events that have not been processed, skipped or discarded.
    pub fn pending_events(&self) -> u64 {
        self.shared.pending()
    }

    pub fn has_pending_events(&self) -> bool {
        self.shared.transitions_allowed() && self.shared.pending() > 0
    }

    pub fn is_accepting_events(&self) -> bool {
        self.shared.is_accepting()
    }

    /// Waits for the event loop to terminate and reports why it did.
    ///
    /// Returns `Ok(None)` if the machine was never started or the loop has
    /// already been awaited.
    pub async fn terminated(&self) -> Result<Option<Termination>, TaskError> {
        let handle = lock(&self.task).take();
        match handle {
            Some(handle) => Ok(Some(handle.await?)),
            None => Ok(None),
        }
    }
}

impl<S: State> fmt::Display for FiniteStateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FiniteStateMachine{{name={}, lifecycle={}, accepting={}, pending={}, transitions={}}}",
            self.shared.name,
            self.lifecycle(),
            self.is_accepting_events(),
            self.pending_events(),
            self.transition_count()
        )
    }
}

impl<S: State> fmt::Debug for FiniteStateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiniteStateMachine")
            .field("name", &self.shared.name)
            .field("lifecycle", &self.lifecycle())
            .field("state", &self.state())
            .field("transitions", &self.transition_count())
            .field("pending", &self.pending_events())
            .finish()
    }
}

impl<S: State> Drop for FiniteStateMachine<S> {
    fn drop(&mut self) {
        self.shared.halt();
        self.shutdown_tx.send_replace(Some(ShutdownMode::Immediate));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::event::TransitionTo;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
    }

    fn light() -> FiniteStateMachine<Light> {
        let model = Model::builder()
            .add("switch on", [Light::Off], Light::On)
            .add("switch off", [Light::On], Light::Off)
            .build()
            .unwrap();
        FiniteStateMachine::builder(Arc::new(model), Light::Off)
            .name("light")
            .build()
            .unwrap()
    }

    #[test]
    fn building_outside_a_runtime_needs_a_handle() {
        let model = Model::builder()
            .add("switch on", [Light::Off], Light::On)
            .build()
            .unwrap();
        let result = FiniteStateMachine::new(Arc::new(model), Light::Off);
        assert!(matches!(result, Err(ConfigError::NoRuntime(_))));
    }

    #[test]
    fn injected_runtime_drives_the_machine() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let model = Model::builder()
            .add("switch on", [Light::Off], Light::On)
            .build()
            .unwrap();
        let fsm = FiniteStateMachine::builder(Arc::new(model), Light::Off)
            .runtime(runtime.handle().clone())
            .build()
            .unwrap();

        assert!(fsm.start().unwrap());
        assert!(fsm.process(TransitionTo(Light::On)));
        runtime.block_on(async {
            assert!(fsm.quiesce_then_stop(None).await.unwrap());
        });
        assert_eq!(fsm.state(), Some(Light::On));
    }

    #[tokio::test]
    async fn lifecycle_moves_strictly_forward() {
        let fsm = light();
        assert_eq!(fsm.lifecycle(), Lifecycle::Created);
        assert!(!fsm.is_accepting_events());
        assert!(!fsm.process(TransitionTo(Light::On)));
        assert!(matches!(fsm.stop(), Err(LifecycleError::NotStarted { .. })));

        assert!(fsm.start().unwrap());
        assert!(!fsm.start().unwrap());
        assert_eq!(fsm.lifecycle(), Lifecycle::Running);

        assert!(fsm.stop().unwrap());
        assert!(!fsm.stop().unwrap());
        assert!(matches!(fsm.start(), Err(LifecycleError::Stopped { .. })));
        assert!(!fsm.process(TransitionTo(Light::On)));
        assert_eq!(fsm.terminated().await.unwrap(), Some(Termination::Stopped));
    }

    #[tokio::test]
    async fn initial_entry_is_not_counted() {
        let fsm = light();
        let entered = Arc::new(AtomicUsize::new(0));
        {
            let entered = entered.clone();
            fsm.add_listener(move |from: Option<&Light>, to: &Light| {
                assert_eq!((from, to), (None, &Light::Off));
                entered.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(fsm.state(), None);
        fsm.start().unwrap();
        assert!(fsm.quiesce_then_stop(None).await.unwrap());

        assert_eq!(fsm.state(), Some(Light::Off));
        assert_eq!(fsm.transition_count(), 0);
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quiesce_reports_whether_the_machine_was_running() {
        let fsm = light();
        assert!(matches!(
            fsm.quiesce_then_stop(None).await,
            Err(LifecycleError::NotStarted { .. })
        ));

        fsm.start().unwrap();
        fsm.process(TransitionTo(Light::On));
        fsm.process(TransitionTo(Light::Off));
        assert!(fsm.quiesce_then_stop(None).await.unwrap());
        assert_eq!(fsm.transition_count(), 2);
        assert!(!fsm.has_pending_events());

        assert!(!fsm.quiesce_then_stop(None).await.unwrap());
        assert!(!fsm.stop().unwrap());
        assert_eq!(fsm.terminated().await.unwrap(), Some(Termination::Quiesced));
    }

    #[tokio::test(start_paused = true)]
    async fn quiesce_gives_up_after_the_timeout() {
        let fsm = light();
        fsm.start().unwrap();
        fsm.process_later(TransitionTo(Light::On), Duration::from_secs(60));

        let drained = fsm
            .quiesce_then_stop(Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(!drained);
        assert_eq!(fsm.lifecycle(), Lifecycle::Stopped);
        assert_eq!(fsm.state(), Some(Light::Off));
        assert_eq!(fsm.pending_events(), 0);
    }

    #[tokio::test]
    async fn display_summarises_status() {
        let fsm = light();
        assert_eq!(
            fsm.to_string(),
            "FiniteStateMachine{name=light, lifecycle=created, accepting=false, pending=0, transitions=0}"
        );
        assert_eq!(fsm.name(), "light");
    }
}
