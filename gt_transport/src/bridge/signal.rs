//! Close signals and bounded hand-offs between engine callbacks and
//! blocked consumer calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;

/// Broadcast-once signal. Firing drops the only sender, which wakes every
/// current and future waiter on the receiver.
#[derive(Debug)]
pub struct CloseSignal {
    trigger: Mutex<Option<Sender<()>>>,
    observed: Receiver<()>,
    fired: AtomicBool,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (trigger, observed) = crossbeam_channel::bounded(0);
        CloseSignal {
            trigger: Mutex::new(Some(trigger)),
            observed,
            fired: AtomicBool::new(false),
        }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        let fired = self.trigger.lock().take().is_some();
        if fired {
            self.fired.store(true, Ordering::Release);
        }
        fired
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let _ = self.observed.recv();
    }

    fn receiver(&self) -> &Receiver<()> {
        &self.observed
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a blocking [`Handoff::take`].
#[derive(Debug, PartialEq, Eq)]
pub enum Waited<T> {
    Ready(T),
    Closed,
    TimedOut,
}

/// Bounded queue between an engine callback (producer) and a consumer call.
///
/// Both sides block while the other side is not ready and give up as soon
/// as one of the given close signals fires.
#[derive(Debug)]
pub struct Handoff<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Handoff<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Handoff { tx, rx }
    }

    /// Blocks until `value` is queued. Hands the value back if `closed`
    /// fires first.
    pub fn offer(&self, value: T, closed: &CloseSignal) -> Result<(), T> {
        if closed.is_fired() {
            return Err(value);
        }
        let mut select = Select::new();
        let send = select.send(&self.tx);
        let close = select.recv(closed.receiver());
        let oper = select.select();
        if oper.index() == send {
            oper.send(&self.tx, value).map_err(|err| err.into_inner())
        } else {
            debug_assert_eq!(oper.index(), close);
            let _ = oper.recv(closed.receiver());
            Err(value)
        }
    }

    /// Queues `value` without blocking.
    pub fn try_offer(&self, value: T) -> Result<(), T> {
        self.tx.try_send(value).map_err(|err| err.into_inner())
    }

    /// Blocks for the next value. Values already queued are returned even if
    /// a signal has fired.
    pub fn take(&self, signals: &[&CloseSignal], deadline: Option<Instant>) -> Waited<T> {
        if let Ok(value) = self.rx.try_recv() {
            return Waited::Ready(value);
        }

        let mut select = Select::new();
        let data = select.recv(&self.rx);
        for signal in signals {
            select.recv(signal.receiver());
        }
        let oper = match deadline {
            Some(deadline) => match select.select_deadline(deadline) {
                Ok(oper) => oper,
                Err(_) => return Waited::TimedOut,
            },
            None => select.select(),
        };

        let index = oper.index();
        if index == data {
            return match oper.recv(&self.rx) {
                Ok(value) => Waited::Ready(value),
                Err(_) => Waited::Closed,
            };
        }
        let _ = oper.recv(signals[index - 1].receiver());
        match self.rx.try_recv() {
            Ok(value) => Waited::Ready(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Waited::Closed,
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Removes every queued value.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
