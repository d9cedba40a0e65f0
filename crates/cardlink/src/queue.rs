//! Sequential dispatch queue building blocks
//!
//! Commands against one transport must never interleave: the link is
//! half-duplex. Everything submitted to a connection lands in a
//! [`PendingQueue`] and is executed strictly in submission order by the
//! connection's single worker thread. Completion always travels back
//! through a channel, so callers are never blocked on hardware.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use cardlink_apdu::{Apdu, SendRemaining};
use tracing::debug;

use crate::connection::Aid;
use crate::error::{CardError, CardResult};

/// Per-command overrides. Immutable, supplied per call, never outliving
/// the command it was built for.
#[derive(Debug, Clone)]
pub struct CommandConfiguration {
    /// Deadline for the whole unit, measured from execution start.
    pub timeout: Duration,
    /// Re-run the exchange while the device answers 0x6985.
    pub retry_on_busy: bool,
    /// Pause between busy retries.
    pub retry_interval: Duration,
    /// Which GET RESPONSE instruction continuation reads use.
    pub send_remaining: SendRemaining,
}

impl Default for CommandConfiguration {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_on_busy: false,
            retry_interval: Duration::from_millis(250),
            send_remaining: SendRemaining::Normal,
        }
    }
}

/// The result of one executed command: reassembled payload, final status
/// word and how long the exchange took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub data: Vec<u8>,
    pub sw: u16,
    pub elapsed: Duration,
}

/// Caller-side handle for a submitted command.
///
/// The queue delivers exactly one result per submission; dropping the
/// handle discards it.
pub struct PendingResponse {
    rx: Receiver<CardResult<CommandOutput>>,
}

impl PendingResponse {
    pub(crate) fn channel() -> (Completion, PendingResponse) {
        let (tx, rx) = mpsc::channel();
        (Completion { tx }, PendingResponse { rx })
    }

    /// Block until the command completes.
    pub fn wait(self) -> CardResult<CommandOutput> {
        // A dropped sender means the engine shut down before the unit ran.
        self.rx.recv().unwrap_or(Err(CardError::Cancelled))
    }

    /// Block up to `timeout`; `None` when the command is still pending.
    pub fn wait_for(&self, timeout: Duration) -> Option<CardResult<CommandOutput>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Sending side of a command's completion channel.
pub(crate) struct Completion {
    tx: Sender<CardResult<CommandOutput>>,
}

impl Completion {
    pub(crate) fn complete(self, result: CardResult<CommandOutput>) {
        // The caller may have dropped its handle; that is not an error.
        let _ = self.tx.send(result);
    }
}

/// One unit of queued work.
pub(crate) enum Job {
    /// Execute a command, optionally ensuring an application is selected
    /// first.
    Command {
        apdu: Apdu,
        target: Option<Aid>,
        config: CommandConfiguration,
        completion: Completion,
    },
    /// Ensure an application is selected, running a SELECT round-trip only
    /// on cache mismatch.
    Select {
        aid: Aid,
        config: CommandConfiguration,
        completion: Completion,
    },
    /// An arbitrary closure on the worker thread (polling-style waits).
    Task(Box<dyn FnOnce() + Send>),
}

pub(crate) struct WorkUnit {
    pub(crate) seq: u64,
    pub(crate) ready_at: Instant,
    pub(crate) job: Job,
}

impl WorkUnit {
    /// Complete the unit without running it.
    pub(crate) fn cancel(self, err: CardError) {
        match self.job {
            Job::Command { completion, .. } | Job::Select { completion, .. } => {
                completion.complete(Err(err));
            }
            Job::Task(_) => debug!(seq = self.seq, "dropping scheduled task: {err}"),
        }
    }
}

/// FIFO of not-yet-started work, with support for delayed units.
///
/// Delayed units wait in a side list and join the ready queue once their
/// instant elapses; among elapsed units submission order is preserved.
pub(crate) struct PendingQueue {
    ready: VecDeque<WorkUnit>,
    delayed: Vec<WorkUnit>,
    seq: u64,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: Vec::new(),
            seq: 0,
        }
    }

    pub(crate) fn push(&mut self, job: Job) {
        self.push_after(job, Duration::ZERO)
    }

    pub(crate) fn push_after(&mut self, job: Job, delay: Duration) {
        let seq = self.seq;
        self.seq += 1;
        let unit = WorkUnit {
            seq,
            ready_at: Instant::now() + delay,
            job,
        };
        if delay.is_zero() {
            self.ready.push_back(unit);
        } else {
            self.delayed.push(unit);
        }
    }

    /// Pop the next unit whose delay has elapsed, in submission order.
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<WorkUnit> {
        self.promote(now);
        self.ready.pop_front()
    }

    /// When the next delayed unit becomes ready, if any.
    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        self.delayed.iter().map(|u| u.ready_at).min()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    /// Remove everything, ready and delayed alike.
    pub(crate) fn drain(&mut self) -> Vec<WorkUnit> {
        let mut all: Vec<WorkUnit> = self.ready.drain(..).collect();
        all.append(&mut self.delayed);
        all.sort_by_key(|u| u.seq);
        all
    }

    fn promote(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let mut elapsed: Vec<WorkUnit> = Vec::new();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].ready_at <= now {
                elapsed.push(self.delayed.remove(i));
            } else {
                i += 1;
            }
        }
        elapsed.sort_by_key(|u| (u.ready_at, u.seq));
        self.ready.extend(elapsed);
    }
}
