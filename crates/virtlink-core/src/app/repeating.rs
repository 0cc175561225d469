//! Repeating Job - a cancellable periodic schedule over the job runner.
//!
//! `start` ticks once immediately, then arms a timer on the dispatch context.
//! Every tick dispatches `work` to a fresh worker and delivers its value to
//! `on_tick` on the dispatch context.
//!
//! Stopping is cooperative:
//! - `stop()` only records the request (Armed -> Stopping).
//! - The next timer tick sees the request, cancels the timer and moves to
//!   Stopped without dispatching anything.
//! - A tick already in flight is not interrupted and its `on_tick` still runs.
//!
//! With [`OverlapPolicy::Allow`] a tick that comes due while the previous
//! worker is still running dispatches another worker anyway, so slow
//! backends see overlapping calls. [`OverlapPolicy::Skip`] drops such ticks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::dispatch::{Dispatcher, Timer};
use crate::model::OverlapPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatingState {
    Armed,
    /// Stop requested; the next tick cancels the timer.
    Stopping,
    /// Terminal.
    Stopped,
}

struct Inner {
    dispatcher: Dispatcher,
    policy: OverlapPolicy,
    state: Cell<RepeatingState>,
    in_flight: Cell<usize>,
    dispatched: Cell<u64>,
    skipped: Cell<u64>,
    timer: RefCell<Option<Timer>>,
    launch: Box<dyn Fn(&Rc<Inner>)>,
}

impl Inner {
    fn tick(self: &Rc<Self>) {
        match self.state.get() {
            RepeatingState::Armed => {}
            RepeatingState::Stopping => {
                self.disarm();
                self.state.set(RepeatingState::Stopped);
                debug!(dispatched = self.dispatched.get(), "repeating job stopped");
                return;
            }
            RepeatingState::Stopped => return,
        }

        if self.policy == OverlapPolicy::Skip && self.in_flight.get() > 0 {
            self.skipped.set(self.skipped.get() + 1);
            debug!(in_flight = self.in_flight.get(), "tick skipped; previous tick still running");
            return;
        }

        (self.launch)(self);
    }

    fn disarm(&self) {
        let timer = self.timer.borrow_mut().take();
        drop(timer);
    }
}

/// Handle to a running periodic job. Dropping the last handle cancels the
/// timer; ticks already in flight still report to `on_tick`.
pub struct RepeatingJob {
    inner: Rc<Inner>,
}

impl RepeatingJob {
    pub fn start<T, W, D>(
        dispatcher: &Dispatcher,
        work: W,
        on_tick: D,
        interval: Duration,
        policy: OverlapPolicy,
    ) -> Self
    where
        T: Send + 'static,
        W: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + 'static,
    {
        let work = Arc::new(work);
        let on_tick = Rc::new(on_tick);

        let launch: Box<dyn Fn(&Rc<Inner>)> = Box::new(move |inner: &Rc<Inner>| {
            let work = Arc::clone(&work);
            let on_tick = Rc::clone(&on_tick);
            let on_finish = Rc::downgrade(inner);

            inner.in_flight.set(inner.in_flight.get() + 1);
            inner.dispatched.set(inner.dispatched.get() + 1);

            inner.dispatcher.run_failable(
                move || Ok(work()),
                |err| warn!(error = %err, "repeating job tick failed"),
                move |result| {
                    if let Some(inner) = on_finish.upgrade() {
                        inner.in_flight.set(inner.in_flight.get().saturating_sub(1));
                    }
                    if let Some(value) = result.success() {
                        on_tick(value);
                    }
                },
            );
        });

        let inner = Rc::new(Inner {
            dispatcher: dispatcher.clone(),
            policy,
            state: Cell::new(RepeatingState::Armed),
            in_flight: Cell::new(0),
            dispatched: Cell::new(0),
            skipped: Cell::new(0),
            timer: RefCell::new(None),
            launch,
        });

        inner.tick();

        let weak = Rc::downgrade(&inner);
        let timer = dispatcher.every(interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.tick();
            }
        });
        *inner.timer.borrow_mut() = Some(timer);

        Self { inner }
    }

    /// Extra tick now; the timer schedule is unchanged.
    pub fn trigger(&self) {
        self.inner.tick();
    }

    /// Requests cancellation. Does not interrupt a tick in flight.
    pub fn stop(&self) {
        if self.inner.state.get() == RepeatingState::Armed {
            self.inner.state.set(RepeatingState::Stopping);
        }
    }

    pub fn state(&self) -> RepeatingState {
        self.inner.state.get()
    }

    /// Workers dispatched whose result has not been delivered yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.get()
    }

    /// Total ticks that dispatched a worker.
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.get()
    }

    /// Ticks dropped by [`OverlapPolicy::Skip`].
    pub fn skipped(&self) -> u64 {
        self.inner.skipped.get()
    }
}
