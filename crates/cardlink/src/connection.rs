//! Connection lifecycle and the smart-card command interface
//!
//! A [`Connection`] owns the transport handle, the selected-application
//! cache and the sequential work queue, and runs one worker thread that
//! executes units strictly in submission order. State transitions happen
//! under the same lock the submission path takes, so no command can slip
//! in between "transport lost" and the flush of queued work.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cardlink_apdu::{apdu::commands, Apdu, SW_SUCCESS};
use tracing::{debug, info, warn};

use crate::error::{CardError, CardResult};
use crate::exchange::execute_exchange;
use crate::queue::{CommandConfiguration, CommandOutput, Job, PendingQueue, PendingResponse};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Lifecycle of the link to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport. Initial and terminal. Commands are refused.
    #[default]
    Closed,
    /// Discovery in progress; commands are refused until a transport
    /// arrives.
    Connecting,
    /// Transport ready; commands may be submitted.
    Open,
}

/// An on-device application identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aid(Vec<u8>);

impl Aid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Aid {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Display for Aid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

struct Inner {
    state: ConnectionState,
    last_error: Option<CardError>,
    transport: Option<Box<dyn Transport>>,
    selected: Option<Aid>,
    pending: PendingQueue,
    /// False once close() was called; no new work is accepted.
    accepting: bool,
    /// True while the worker is executing a unit.
    in_flight: bool,
    /// Worker exits when set and the queue is empty.
    shutdown: bool,
    /// Bumped on every close and on every restart. A transport borrowed
    /// by the worker before the bump is never handed back afterwards, and
    /// a drain waiter registered under an older epoch resolves as soon as
    /// the in-flight unit finishes.
    epoch: u64,
    /// Waiters registered by `close()`, tagged with that close's epoch.
    drain_waiters: Vec<(u64, Sender<()>)>,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Keep going if a test thread panicked while holding the lock.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle that resolves once the connection has drained: the in-flight
/// unit finished and nothing else will run.
pub struct DrainHandle {
    rx: Receiver<()>,
}

impl DrainHandle {
    pub fn wait(self) {
        let _ = self.rx.recv();
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

/// One connection to one device: state machine plus sequential queue.
pub struct Connection {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                last_error: None,
                transport: None,
                selected: None,
                pending: PendingQueue::new(),
                accepting: true,
                in_flight: false,
                shutdown: false,
                epoch: 0,
                drain_waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("cardlink-queue".into())
            .spawn(move || worker_loop(worker_shared))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn connection worker thread");
        }
        Self { shared, worker }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// The error recorded by the last transition to Closed, if any.
    pub fn last_error(&self) -> Option<CardError> {
        self.shared.lock().last_error.clone()
    }

    /// Begin discovery: Closed -> Connecting.
    pub fn start(&self) {
        let mut g = self.shared.lock();
        if g.state == ConnectionState::Closed {
            info!("connection starting");
            g.state = ConnectionState::Connecting;
            g.last_error = None;
            g.accepting = true;
            // A restart supersedes any close still waiting on its drain;
            // those waiters now only wait for the in-flight unit.
            g.epoch += 1;
            maybe_notify_drained(&mut g);
        }
    }

    /// Discovery produced a live transport: Connecting -> Open.
    pub fn transport_opened(&self, transport: Box<dyn Transport>) {
        let mut g = self.shared.lock();
        match g.state {
            ConnectionState::Connecting => {
                info!("transport established, connection open");
                g.state = ConnectionState::Open;
                g.transport = Some(transport);
                self.shared.cond.notify_all();
            }
            state => {
                warn!(?state, "dropping transport handed over in wrong state");
            }
        }
    }

    /// Discovery failed: Connecting -> Closed.
    pub fn connect_failed(&self, err: TransportError) {
        let mut g = self.shared.lock();
        if g.state == ConnectionState::Connecting {
            warn!("discovery failed: {err}");
            close_locked(&mut g, Some(CardError::Transport(err)));
            self.shared.cond.notify_all();
        }
    }

    /// The transport disappeared: Open -> Closed, flushing queued work
    /// with `ConnectionLost`.
    pub fn transport_lost(&self, err: TransportError) {
        let mut g = self.shared.lock();
        match g.state {
            ConnectionState::Open => {
                warn!("transport lost: {err}");
                close_locked(&mut g, Some(CardError::ConnectionLost));
                self.shared.cond.notify_all();
            }
            ConnectionState::Connecting => {
                drop(g);
                self.connect_failed(err);
            }
            ConnectionState::Closed => {}
        }
    }

    /// Feed a discovery-layer event into the state machine.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(t) => self.transport_opened(t),
            TransportEvent::Lost(err) => self.transport_lost(err),
        }
    }

    /// Capability lookup for the command interface: available only while
    /// the connection is open.
    pub fn smart_card(&self) -> CardResult<SmartCardInterface> {
        let g = self.shared.lock();
        if g.state == ConnectionState::Open {
            Ok(SmartCardInterface {
                shared: self.shared.clone(),
            })
        } else {
            Err(CardError::NotOpen)
        }
    }

    /// Remove every not-yet-started unit, completing each with
    /// `Cancelled`. An in-flight unit finishes naturally.
    pub fn cancel_all_commands(&self) {
        let mut g = self.shared.lock();
        flush_pending(&mut g, CardError::Cancelled);
    }

    /// Stop accepting work, let the in-flight unit finish, cancel the
    /// rest and transition to Closed. The handle resolves once nothing
    /// can run anymore.
    pub fn close(&self) -> DrainHandle {
        let (tx, rx) = mpsc::channel();
        let mut g = self.shared.lock();
        info!("closing connection");
        close_locked(&mut g, None);
        let epoch = g.epoch;
        g.drain_waiters.push((epoch, tx));
        maybe_notify_drained(&mut g);
        self.shared.cond.notify_all();
        DrainHandle { rx }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        {
            let mut g = self.shared.lock();
            close_locked(&mut g, None);
            g.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Handle for submitting commands on an open connection. Cheap to clone;
/// all clones feed the same sequential queue.
#[derive(Clone)]
pub struct SmartCardInterface {
    shared: Arc<Shared>,
}

impl SmartCardInterface {
    /// Execute a command with the default configuration.
    pub fn execute(&self, apdu: Apdu) -> PendingResponse {
        self.execute_with(apdu, CommandConfiguration::default())
    }

    /// Execute a command with per-call configuration.
    pub fn execute_with(&self, apdu: Apdu, config: CommandConfiguration) -> PendingResponse {
        self.submit_command(apdu, None, config)
    }

    /// Execute a command that requires `aid` to be the selected
    /// application, selecting it first only when the cache says
    /// otherwise.
    pub fn execute_for(
        &self,
        aid: Aid,
        apdu: Apdu,
        config: CommandConfiguration,
    ) -> PendingResponse {
        self.submit_command(apdu, Some(aid), config)
    }

    /// Ensure `aid` is the selected application. No round-trip happens
    /// when the cache already matches.
    pub fn select_application(&self, aid: Aid) -> PendingResponse {
        let (completion, pending) = PendingResponse::channel();
        let mut g = self.shared.lock();
        if !submittable(&g) {
            drop(g);
            completion.complete(Err(CardError::NotOpen));
            return pending;
        }
        g.pending.push(Job::Select {
            aid,
            config: CommandConfiguration::default(),
            completion,
        });
        self.shared.cond.notify_all();
        pending
    }

    /// The application the engine believes is currently selected.
    pub fn selected_application(&self) -> Option<Aid> {
        self.shared.lock().selected.clone()
    }

    /// Run a closure on the sequential queue, optionally after a delay.
    /// Used for polling-style waits between commands.
    pub fn schedule(&self, delay: Option<Duration>, work: impl FnOnce() + Send + 'static) {
        let mut g = self.shared.lock();
        if !g.accepting || g.shutdown {
            debug!("dropping scheduled work on closed queue");
            return;
        }
        match delay {
            Some(d) if !d.is_zero() => g.pending.push_after(Job::Task(Box::new(work)), d),
            _ => g.pending.push(Job::Task(Box::new(work))),
        }
        self.shared.cond.notify_all();
    }

    /// Remove every not-yet-started unit, completing each with
    /// `Cancelled`.
    pub fn cancel_all_commands(&self) {
        let mut g = self.shared.lock();
        flush_pending(&mut g, CardError::Cancelled);
    }

    fn submit_command(
        &self,
        apdu: Apdu,
        target: Option<Aid>,
        config: CommandConfiguration,
    ) -> PendingResponse {
        let (completion, pending) = PendingResponse::channel();
        let mut g = self.shared.lock();
        if !submittable(&g) {
            drop(g);
            completion.complete(Err(CardError::NotOpen));
            return pending;
        }
        g.pending.push(Job::Command {
            apdu,
            target,
            config,
            completion,
        });
        self.shared.cond.notify_all();
        pending
    }
}

fn submittable(g: &Inner) -> bool {
    g.state == ConnectionState::Open && g.accepting && !g.shutdown
}

/// Transition to Closed under the lock: drop the transport, clear the
/// selection cache, record the error and flush queued work.
fn close_locked(g: &mut Inner, err: Option<CardError>) {
    g.accepting = false;
    g.state = ConnectionState::Closed;
    g.transport = None;
    g.selected = None;
    g.epoch += 1;
    let flush_err = err.clone().unwrap_or(CardError::Cancelled);
    if let Some(err) = err {
        g.last_error = Some(err);
    }
    flush_pending(g, flush_err);
    maybe_notify_drained(g);
}

fn flush_pending(g: &mut Inner, err: CardError) {
    let units = g.pending.drain();
    if !units.is_empty() {
        debug!(count = units.len(), "flushing queued units: {err}");
    }
    for unit in units {
        unit.cancel(err.clone());
    }
}

fn maybe_notify_drained(g: &mut Inner) {
    if g.in_flight {
        return;
    }
    // A waiter under an older epoch belongs to a close superseded by a
    // restart or a later close; its queue was flushed back then, so only
    // the in-flight unit was left to wait for.
    let drained = !g.accepting && g.pending.is_empty();
    let epoch = g.epoch;
    g.drain_waiters.retain(|(waiter_epoch, tx)| {
        if *waiter_epoch < epoch || drained {
            let _ = tx.send(());
            false
        } else {
            true
        }
    });
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("connection worker started");
    loop {
        let (unit, mut transport, epoch) = {
            let mut g = shared.lock();
            loop {
                if g.shutdown {
                    flush_pending(&mut g, CardError::Cancelled);
                    maybe_notify_drained(&mut g);
                    debug!("connection worker stopping");
                    return;
                }
                let now = Instant::now();
                if let Some(unit) = g.pending.pop_ready(now) {
                    g.in_flight = true;
                    break (unit, g.transport.take(), g.epoch);
                }
                maybe_notify_drained(&mut g);
                g = match g.pending.next_wakeup() {
                    Some(at) => {
                        let timeout = at.saturating_duration_since(now);
                        shared
                            .cond
                            .wait_timeout(g, timeout)
                            .unwrap_or_else(|e| e.into_inner())
                            .0
                    }
                    None => shared.cond.wait(g).unwrap_or_else(|e| e.into_inner()),
                };
            }
        };

        run_unit(&shared, unit.job, transport.as_deref_mut());

        let mut g = shared.lock();
        g.in_flight = false;
        // Hand the transport back only if the connection stayed open the
        // whole time; after a close/reopen the borrowed handle is stale.
        if g.state == ConnectionState::Open && g.epoch == epoch {
            if let Some(t) = transport {
                g.transport = Some(t);
            }
        }
        maybe_notify_drained(&mut g);
    }
}

fn run_unit(shared: &Arc<Shared>, job: Job, transport: Option<&mut (dyn Transport + 'static)>) {
    match job {
        Job::Task(work) => work(),
        Job::Select {
            aid,
            config,
            completion,
        } => {
            let started = Instant::now();
            let deadline = started + config.timeout;
            let result = match transport {
                Some(t) => ensure_selected(shared, t, &aid, &config, deadline),
                None => Err(CardError::ConnectionLost),
            };
            let result = inspect_for_close(shared, result);
            completion.complete(result.map(|data| CommandOutput {
                data,
                sw: SW_SUCCESS,
                elapsed: started.elapsed(),
            }));
        }
        Job::Command {
            apdu,
            target,
            config,
            completion,
        } => {
            let started = Instant::now();
            let deadline = started + config.timeout;
            let result = match transport {
                Some(t) => {
                    let selected = match &target {
                        Some(aid) => ensure_selected(shared, t, aid, &config, deadline).map(|_| ()),
                        None => Ok(()),
                    };
                    selected.and_then(|()| execute_exchange(t, &apdu, &config, deadline))
                }
                None => Err(CardError::ConnectionLost),
            };
            let result = inspect_for_close(shared, result);
            completion.complete(result.map(|data| CommandOutput {
                data,
                sw: SW_SUCCESS,
                elapsed: started.elapsed(),
            }));
        }
    }
}

/// Run the SELECT round-trip unless the cache already points at `aid`.
fn ensure_selected(
    shared: &Arc<Shared>,
    transport: &mut dyn Transport,
    aid: &Aid,
    config: &CommandConfiguration,
    deadline: Instant,
) -> CardResult<Vec<u8>> {
    if shared.lock().selected.as_ref() == Some(aid) {
        return Ok(Vec::new());
    }
    debug!(%aid, "selecting application");
    let select = commands::select_application(aid.as_bytes());
    match execute_exchange(transport, &select, config, deadline) {
        Ok(data) => {
            let mut g = shared.lock();
            // The cache only holds while the connection that selected the
            // application is still open.
            if g.state == ConnectionState::Open {
                g.selected = Some(aid.clone());
            }
            Ok(data)
        }
        Err(CardError::Device { sw }) => {
            shared.lock().selected = None;
            Err(CardError::Selection { sw })
        }
        Err(err) => {
            shared.lock().selected = None;
            Err(err)
        }
    }
}

/// Protocol violations and transport failures mean the device side can no
/// longer be trusted: force the connection Closed and flush the queue.
fn inspect_for_close<T>(shared: &Arc<Shared>, result: CardResult<T>) -> CardResult<T> {
    if let Err(err @ (CardError::Protocol(_) | CardError::Transport(_))) = &result {
        warn!("closing connection after {err}");
        let mut g = shared.lock();
        close_locked(&mut g, Some(err.clone()));
        shared.cond.notify_all();
    }
    result
}
