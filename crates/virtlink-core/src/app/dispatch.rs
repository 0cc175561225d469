//! Dispatch context - the single consumer loop that owns all core state.
//!
//! Workers, timers and backend event sources never touch core state. They
//! send a [`Message`] into one unbounded channel and the dispatch context
//! runs the matching callback. Only one callback runs at a time, and callbacks
//! run in channel order.
//!
//! ```text
//!   worker (spawn_blocking) ──Complete/Abandon──┐
//!   timer task             ──Signal────────────┤
//!   backend event thread   ──Signal────────────┼──► mpsc ──► Dispatcher::turn ──► callback
//!   DispatchHandle::post   ──Post──────────────┘
//! ```
//!
//! Callbacks stored here are `!Send`: they capture `Rc` state owned by the
//! dispatch context. Only the payload crosses threads, as `Box<dyn Any + Send>`,
//! and it is downcast back to the type the callback was registered for.
//!
//! Connection and resource state is plain `Cell`/`RefCell` data with no
//! locks. That only holds as long as every mutation happens inside a
//! callback run by this loop, so workers must report results through a
//! `Completer` or a [`SignalSender`] and never touch the state directly.
//! A job whose callback is registered but never completed shows up in
//! [`Dispatcher::pending_jobs`]; tests use that to assert nothing is left
//! behind.
//!
//! The loop itself is driven by the caller: [`Dispatcher::serve`] for a
//! long-running front end, or [`Dispatcher::run_until`] and
//! [`Dispatcher::drain`] when a test wants to step it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::model::ids::{Channel, SeqAllocator};
use crate::model::{ChannelId, JobId};

/// Shortest period accepted by [`Dispatcher::every`].
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

type Payload = Box<dyn Any + Send>;

enum Message {
    /// A job finished; run its one-shot callback.
    Complete { job: JobId, payload: Payload },
    /// A job's worker died; forget its callback.
    Abandon { job: JobId },
    /// A persistent route fired.
    Signal { channel: ChannelId, payload: Payload },
    /// Arbitrary closure posted from any thread.
    Post(Box<dyn FnOnce() + Send>),
}

struct Inner {
    tx: mpsc::UnboundedSender<Message>,
    rx: RefCell<mpsc::UnboundedReceiver<Message>>,
    pending: RefCell<HashMap<JobId, Box<dyn FnOnce(Payload)>>>,
    channels: RefCell<HashMap<ChannelId, Rc<dyn Fn(Payload)>>>,
    channel_ids: SeqAllocator<Channel>,
}

/// Handle to the dispatch context. Cheap to clone, `!Send`.
///
/// Must be created inside a tokio runtime; workers are spawned on its
/// blocking pool and timers on its scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<Inner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(Inner {
                tx,
                rx: RefCell::new(rx),
                pending: RefCell::new(HashMap::new()),
                channels: RefCell::new(HashMap::new()),
                channel_ids: SeqAllocator::new(),
            }),
        }
    }

    /// Thread-safe entry point for posting work onto this context.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            tx: self.inner.tx.clone(),
        }
    }

    /// Registers the one-shot callback for `job`. The worker reports back
    /// through the returned `Completer`.
    pub(crate) fn expect_completion<T, F>(&self, job: JobId, on_done: F) -> Completer
    where
        T: Send + 'static,
        F: FnOnce(T) + 'static,
    {
        let callback: Box<dyn FnOnce(Payload)> =
            Box::new(move |payload: Payload| match payload.downcast::<T>() {
                Ok(value) => on_done(*value),
                Err(_) => error!(job = %job, "completion payload has unexpected type"),
            });
        self.inner.pending.borrow_mut().insert(job, callback);
        Completer {
            job,
            tx: self.inner.tx.clone(),
        }
    }

    /// Jobs dispatched whose callback has not run yet.
    pub fn pending_jobs(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Opens a persistent route: every `SignalSender::send` runs `handler`
    /// on this context until [`Dispatcher::close_channel`] is called.
    pub fn channel<T, F>(&self, handler: F) -> (ChannelId, SignalSender<T>)
    where
        T: Send + 'static,
        F: Fn(T) + 'static,
    {
        let id = self.inner.channel_ids.allocate();
        let route: Rc<dyn Fn(Payload)> = Rc::new(move |payload: Payload| {
            match payload.downcast::<T>() {
                Ok(value) => handler(*value),
                Err(_) => error!(channel = %id, "signal payload has unexpected type"),
            }
        });
        self.inner.channels.borrow_mut().insert(id, route);
        let sender = SignalSender {
            channel: id,
            tx: self.inner.tx.clone(),
            _marker: PhantomData,
        };
        (id, sender)
    }

    /// Retires a route. Signals already queued for it are discarded.
    pub fn close_channel(&self, id: ChannelId) -> bool {
        self.inner.channels.borrow_mut().remove(&id).is_some()
    }

    pub fn open_channels(&self) -> usize {
        self.inner.channels.borrow().len()
    }

    /// Fires `handler` on this context every `period`, first after one
    /// period has elapsed. Periods below [`MIN_TIMER_PERIOD`] are raised to
    /// it. Stops on [`Timer::cancel`] or when the `Timer` is dropped.
    pub fn every<F>(&self, period: Duration, handler: F) -> Timer
    where
        F: Fn() + 'static,
    {
        if period < MIN_TIMER_PERIOD {
            debug!(?period, "timer period raised to the minimum");
        }
        let period = period.max(MIN_TIMER_PERIOD);
        let (channel, sender) = self.channel::<(), _>(move |()| handler());
        let token = CancellationToken::new();
        let child = token.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticks.tick() => {
                        if sender.send(()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Timer {
            channel,
            token,
            dispatcher: self.clone(),
        }
    }

    fn process(&self, msg: Message) {
        match msg {
            Message::Complete { job, payload } => {
                let callback = self.inner.pending.borrow_mut().remove(&job);
                match callback {
                    Some(callback) => {
                        trace!(job = %job, "running completion");
                        callback(payload);
                    }
                    None => debug!(job = %job, "completion without a pending callback"),
                }
            }
            Message::Abandon { job } => {
                self.inner.pending.borrow_mut().remove(&job);
            }
            Message::Signal { channel, payload } => {
                let route = self.inner.channels.borrow().get(&channel).cloned();
                match route {
                    Some(route) => route(payload),
                    None => trace!(channel = %channel, "signal for closed channel dropped"),
                }
            }
            Message::Post(f) => f(),
        }
    }

    async fn next_message(&self) -> Option<Message> {
        std::future::poll_fn(|cx| self.inner.rx.borrow_mut().poll_recv(cx)).await
    }

    /// Processes one message if one is already queued.
    pub fn try_turn(&self) -> bool {
        let msg = self.inner.rx.borrow_mut().try_recv();
        match msg {
            Ok(msg) => {
                self.process(msg);
                true
            }
            Err(_) => false,
        }
    }

    /// Processes everything already queued; returns how many messages ran.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.try_turn() {
            n += 1;
        }
        n
    }

    /// Waits for one message and processes it.
    pub async fn turn(&self) {
        if let Some(msg) = self.next_message().await {
            self.process(msg);
        }
    }

    /// Processes messages until `cond` holds or `timeout` elapses.
    /// Returns the final value of `cond`.
    pub async fn run_until<F>(&self, mut cond: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cond() {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.next_message()).await {
                Ok(Some(msg)) => self.process(msg),
                Ok(None) | Err(_) => return cond(),
            }
        }
    }

    /// Processes messages for `duration`.
    pub async fn run_for(&self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, self.next_message()).await {
            self.process(msg);
        }
    }

    /// Main loop. Returns once `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.next_message() => match msg {
                    Some(msg) => self.process(msg),
                    None => break,
                },
            }
        }
        debug!(pending = self.pending_jobs(), "dispatch loop stopped");
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// `Send` side of one pending job.
pub(crate) struct Completer {
    job: JobId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Completer {
    pub(crate) fn job(&self) -> JobId {
        self.job
    }

    pub(crate) fn complete<T: Send + 'static>(self, value: T) {
        let msg = Message::Complete {
            job: self.job,
            payload: Box::new(value),
        };
        if self.tx.send(msg).is_err() {
            debug!(job = %self.job, "dispatch context gone; result dropped");
        }
    }

    pub(crate) fn abandon(self) {
        let _ = self.tx.send(Message::Abandon { job: self.job });
    }
}

/// The dispatch context is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dispatch context closed")]
pub struct DispatchClosed;

/// `Send` sender for a persistent route.
pub struct SignalSender<T> {
    channel: ChannelId,
    tx: mpsc::UnboundedSender<Message>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> SignalSender<T> {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn send(&self, value: T) -> Result<(), DispatchClosed> {
        self.tx
            .send(Message::Signal {
                channel: self.channel,
                payload: Box::new(value),
            })
            .map_err(|_| DispatchClosed)
    }
}

impl<T> Clone for SignalSender<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel,
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

/// "Run this on the dispatch context, ASAP, without blocking me."
/// FIFO per poster.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl DispatchHandle {
    pub fn post<F>(&self, f: F) -> Result<(), DispatchClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::Post(Box::new(f)))
            .map_err(|_| DispatchClosed)
    }
}

/// Periodic route created by [`Dispatcher::every`]. Dropping it cancels.
pub struct Timer {
    channel: ChannelId,
    token: CancellationToken,
    dispatcher: Dispatcher,
}

impl Timer {
    /// Stops the timer task and discards ticks already queued.
    pub fn cancel(&self) {
        self.token.cancel();
        self.dispatcher.close_channel(self.channel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn posts_run_in_fifo_order() {
        let dispatcher = Dispatcher::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel::<u32>();

        let handle = dispatcher.handle();
        std::thread::spawn(move || {
            for i in 0..3 {
                let tx = tx.clone();
                handle.post(move || tx.send(i).unwrap()).unwrap();
            }
        })
        .join()
        .unwrap();

        assert_eq!(dispatcher.drain(), 3);
        while let Ok(i) = rx.try_recv() {
            seen.borrow_mut().push(i);
        }
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn channel_routes_typed_signals() {
        let dispatcher = Dispatcher::new();
        let sum = Rc::new(Cell::new(0));
        let (_, sender) = dispatcher.channel::<u32, _>({
            let sum = sum.clone();
            move |v| sum.set(sum.get() + v)
        });

        let worker = std::thread::spawn(move || {
            sender.send(2).unwrap();
            sender.send(40).unwrap();
        });
        worker.join().unwrap();

        dispatcher.drain();
        assert_eq!(sum.get(), 42);
    }

    #[tokio::test]
    async fn closed_channel_discards_queued_signals() {
        let dispatcher = Dispatcher::new();
        let hits = Rc::new(Cell::new(0));
        let (id, sender) = dispatcher.channel::<(), _>({
            let hits = hits.clone();
            move |()| hits.set(hits.get() + 1)
        });

        sender.send(()).unwrap();
        assert!(dispatcher.close_channel(id));
        dispatcher.drain();

        assert_eq!(hits.get(), 0);
        assert_eq!(dispatcher.open_channels(), 0);
    }

    #[tokio::test]
    async fn timer_ticks_until_cancelled() {
        let dispatcher = Dispatcher::new();
        let ticks = Rc::new(Cell::new(0));
        let timer = dispatcher.every(Duration::from_millis(20), {
            let ticks = ticks.clone();
            move || ticks.set(ticks.get() + 1)
        });

        let reached = dispatcher
            .run_until(|| ticks.get() >= 2, Duration::from_secs(2))
            .await;
        assert!(reached);

        timer.cancel();
        let before = ticks.get();
        dispatcher.run_for(Duration::from_millis(100)).await;
        assert_eq!(ticks.get(), before);
        assert!(timer.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_timer_stops_ticking() {
        let dispatcher = Dispatcher::new();
        let ticks = Rc::new(Cell::new(0));
        let timer = dispatcher.every(Duration::from_millis(10), {
            let ticks = ticks.clone();
            move || ticks.set(ticks.get() + 1)
        });
        assert_eq!(dispatcher.open_channels(), 1);

        drop(timer);
        dispatcher.run_for(Duration::from_millis(100)).await;

        assert_eq!(ticks.get(), 0);
        assert_eq!(dispatcher.open_channels(), 0);
    }

    #[tokio::test]
    async fn zero_period_is_raised_to_the_minimum() {
        let dispatcher = Dispatcher::new();
        let ticks = Rc::new(Cell::new(0));
        let timer = dispatcher.every(Duration::ZERO, {
            let ticks = ticks.clone();
            move || ticks.set(ticks.get() + 1)
        });

        let reached = dispatcher
            .run_until(|| ticks.get() >= 3, Duration::from_secs(2))
            .await;
        assert!(reached);
        assert!(!timer.is_cancelled());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let dispatcher = Dispatcher::new();
        let token = CancellationToken::new();

        let stop = token.clone();
        dispatcher.handle().post(move || stop.cancel()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), dispatcher.serve(token.clone()))
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }
}
