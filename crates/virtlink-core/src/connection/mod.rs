//! Connection - one backend endpoint, its state machine and its event bus.
//!
//! ```text
//!                try_connect            connect work ok
//!  Disconnected ─────────────► Connecting ─────────────► Connected
//!       ▲                          │                         │
//!       │      connect work failed │                         │ disconnect / liveness
//!       └──────────────────────────┴─────────────────────────┘ failure / backend close
//! ```
//!
//! The backend handle exists only in `Connected`. Every public operation that
//! touches it goes through [`Connection::is_alive`] first; a failed check
//! drops the handle, moves to `Disconnected` and emits exactly one
//! `Disconnected` event.
//!
//! Backend signals arrive on backend-owned threads. They are routed onto the
//! dispatch context through a per-session channel that is closed when the
//! session ends, so signals from a dead session never reach the bus.
//!
//! Opening a session is blocking work: `open`, event source registration and
//! the capability probe all run on one worker, and the result is applied on
//! the dispatch context. Between `try_connect` and that result the connection
//! sits in `Connecting` without a handle. If the connection was disconnected
//! or deleted in the meantime, the late handle is closed on another worker
//! and no `Established` event is sent. Closing is also done on a worker,
//! because a backend may block on close while it flushes its transport.
//!
//! Resource wrappers subscribe to this connection's bus and hold a strong
//! `Connection`. The connection never holds its wrappers; the bus only holds
//! their callbacks, which reach the wrapper through a `Weak`.

mod operations;
mod records;

pub use self::records::CONNECTIONS_KEY;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app::{Dispatcher, EventBus};
use crate::error::{Error, Result};
use crate::model::{
    ChannelId, ConnectionChange, ConnectionRecord, ConnectionSettings, ConnectionState, Event,
    EventKind,
};
use crate::ports::{
    Backend, BackendHandle, BackendResult, BackendSignal, Capabilities, EventSource, SettingsStore,
    SignalSink,
};

/// What a successful connect hands back to the dispatch context.
struct Session {
    handle: Arc<dyn BackendHandle>,
    capabilities: Capabilities,
    secret_events: bool,
}

struct Inner {
    url: String,
    dispatcher: Dispatcher,
    backend: Arc<dyn Backend>,
    store: Rc<dyn SettingsStore>,
    settings: RefCell<ConnectionSettings>,
    state: Cell<ConnectionState>,
    handle: RefCell<Option<Arc<dyn BackendHandle>>>,
    capabilities: RefCell<Option<Capabilities>>,
    secret_events: Cell<bool>,
    signals: Cell<Option<ChannelId>>,
    deleted: Cell<bool>,
    bus: EventBus<Event>,
}

/// One backend endpoint. Cheap to clone; clones share state. `!Send`.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<Inner>,
}

impl Connection {
    /// Wraps an existing record. Nothing is persisted.
    pub fn new(
        dispatcher: &Dispatcher,
        backend: Arc<dyn Backend>,
        store: Rc<dyn SettingsStore>,
        record: ConnectionRecord,
    ) -> Self {
        let bus = EventBus::new(format!("connection {}", record.url));
        Self {
            inner: Rc::new(Inner {
                url: record.url,
                dispatcher: dispatcher.clone(),
                backend,
                store,
                settings: RefCell::new(record.settings),
                state: Cell::new(ConnectionState::Disconnected),
                handle: RefCell::new(None),
                capabilities: RefCell::new(None),
                secret_events: Cell::new(false),
                signals: Cell::new(None),
                deleted: Cell::new(false),
                bus,
            }),
        }
    }

    /// Persists a new record, then wraps it.
    pub fn create(
        dispatcher: &Dispatcher,
        backend: Arc<dyn Backend>,
        store: Rc<dyn SettingsStore>,
        record: ConnectionRecord,
    ) -> Result<Self> {
        records::insert(&*store, &record)?;
        info!(url = %record.url, name = %record.settings.name, "connection created");
        Ok(Self::new(dispatcher, backend, store, record))
    }

    /// One `Connection` per persisted record, in stored order.
    pub fn load_all(
        dispatcher: &Dispatcher,
        backend: Arc<dyn Backend>,
        store: Rc<dyn SettingsStore>,
    ) -> Result<Vec<Self>> {
        let records = records::load(&*store)?;
        debug!(count = records.len(), "loaded connection records");
        Ok(records
            .into_iter()
            .map(|record| Self::new(dispatcher, Arc::clone(&backend), Rc::clone(&store), record))
            .collect())
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.inner.settings.borrow().clone()
    }

    pub fn name(&self) -> String {
        self.inner.settings.borrow().name.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.get()
    }

    /// Capability snapshot cached at connect time or by `refresh_capabilities`.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.inner.capabilities.borrow().clone()
    }

    /// False when the backend refused the secret event source.
    pub fn supports_secret_events(&self) -> bool {
        self.inner.secret_events.get()
    }

    pub fn event_bus(&self) -> &EventBus<Event> {
        &self.inner.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================
    // Events
    // ========================================

    /// Broadcasts `kind` on this connection's bus.
    pub fn send_event(&self, kind: EventKind) {
        let event = Event::new(self.inner.url.clone(), kind);
        debug!(%event, "broadcast");
        self.inner.bus.broadcast(&event);
    }

    fn emit(&self, change: ConnectionChange) {
        self.send_event(EventKind::Connection(change));
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.replace(state);
        if previous != state {
            debug!(url = %self.inner.url, from = %previous, to = %state, "state change");
        }
    }

    fn ensure_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::Deleted {
                url: self.inner.url.clone(),
            });
        }
        Ok(())
    }

    // ========================================
    // Connect / disconnect
    // ========================================

    /// Starts connecting. A no-op unless `Disconnected`.
    ///
    /// Emits `Attempting` now, then `Established` or `Failed` once the
    /// connect work finishes on a worker.
    pub fn try_connect(&self) -> Result<()> {
        self.ensure_not_deleted()?;
        if !self.state().can_connect() {
            debug!(url = %self.inner.url, state = %self.state(), "try_connect ignored");
            return Ok(());
        }

        info!(url = %self.inner.url, "connecting");
        self.set_state(ConnectionState::Connecting);
        self.emit(ConnectionChange::Attempting);

        let weak = Rc::downgrade(&self.inner);
        let (channel, sender) = self.inner.dispatcher.channel(move |signal: BackendSignal| {
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.on_backend_signal(signal);
            }
        });
        self.inner.signals.set(Some(channel));
        let sink: SignalSink = Arc::new(move |signal: BackendSignal| {
            if sender.send(signal).is_err() {
                debug!("dispatch context gone; backend signal dropped");
            }
        });

        let backend = Arc::clone(&self.inner.backend);
        let url = self.inner.url.clone();
        let on_error = self.clone();
        let on_finally = self.clone();
        self.inner.dispatcher.run_failable(
            move || open_session(&*backend, &url, sink),
            move |err| on_error.on_connect_failed(err),
            move |result| {
                if let Some(session) = result.success() {
                    on_finally.on_connected(session);
                }
            },
        );
        Ok(())
    }

    fn on_connected(&self, session: Session) {
        if self.is_deleted() || self.state() != ConnectionState::Connecting {
            debug!(url = %self.inner.url, "connection no longer wanted; closing");
            self.end_session();
            self.close_on_worker(session.handle);
            return;
        }

        if !session.secret_events {
            warn!(url = %self.inner.url, "secret events unavailable on this backend");
        }
        *self.inner.handle.borrow_mut() = Some(session.handle);
        *self.inner.capabilities.borrow_mut() = Some(session.capabilities);
        self.inner.secret_events.set(session.secret_events);
        self.set_state(ConnectionState::Connected);
        info!(url = %self.inner.url, "connected");
        self.emit(ConnectionChange::Established);
    }

    fn on_connect_failed(&self, err: Error) {
        warn!(url = %self.inner.url, error = %err, "connect failed");
        self.end_session();
        if self.is_deleted() {
            return;
        }
        self.emit(ConnectionChange::Failed {
            reason: err.to_string(),
        });
    }

    /// Closes the session. Fails with `NotConnected` unless `Connected`.
    pub fn disconnect(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected {
                url: self.inner.url.clone(),
            });
        }
        info!(url = %self.inner.url, "disconnecting");
        if let Some(handle) = self.end_session() {
            self.close_on_worker(handle);
        }
        self.emit(ConnectionChange::Disconnected);
        Ok(())
    }

    /// Liveness barrier. Call before any operation that touches the handle.
    ///
    /// On a dead handle: drops it, moves to `Disconnected`, emits exactly one
    /// `Disconnected` event and returns `ConnectionLost`.
    pub fn is_alive(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected {
                url: self.inner.url.clone(),
            });
        }
        let handle = self.inner.handle.borrow().clone();
        if handle.as_ref().is_some_and(|h| h.is_alive()) {
            return Ok(());
        }

        warn!(url = %self.inner.url, "connection lost");
        if let Some(handle) = self.end_session() {
            self.close_on_worker(handle);
        }
        self.emit(ConnectionChange::Disconnected);
        Err(Error::ConnectionLost {
            url: self.inner.url.clone(),
        })
    }

    /// Live handle for one backend call.
    pub(crate) fn live_handle(&self) -> Result<Arc<dyn BackendHandle>> {
        self.is_alive()?;
        self.inner
            .handle
            .borrow()
            .clone()
            .ok_or_else(|| Error::NotConnected {
                url: self.inner.url.clone(),
            })
    }

    /// Drops session state and returns the handle, if any. No events.
    fn end_session(&self) -> Option<Arc<dyn BackendHandle>> {
        if let Some(channel) = self.inner.signals.take() {
            self.inner.dispatcher.close_channel(channel);
        }
        self.inner.capabilities.borrow_mut().take();
        self.inner.secret_events.set(false);
        self.set_state(ConnectionState::Disconnected);
        self.inner.handle.borrow_mut().take()
    }

    fn close_on_worker(&self, handle: Arc<dyn BackendHandle>) {
        let url = self.inner.url.clone();
        self.inner.dispatcher.run(
            move || {
                if let Err(err) = handle.deregister_event_sources() {
                    debug!(url = %url, error = %err, "deregister failed during close");
                }
                handle.close()
            },
            |result: BackendResult<()>| {
                if let Err(err) = result {
                    warn!(error = %err, "backend close failed");
                }
            },
        );
    }

    fn on_backend_signal(&self, signal: BackendSignal) {
        if !self.is_connected() {
            debug!(url = %self.inner.url, ?signal, "signal before session established; dropped");
            return;
        }
        let kind = match signal {
            BackendSignal::Closed { reason } => {
                info!(url = %self.inner.url, ?reason, "backend closed the connection");
                // The backend already closed the handle; just forget it.
                self.end_session();
                self.emit(ConnectionChange::Disconnected);
                return;
            }
            BackendSignal::Domain { uuid, event, detail } => {
                EventKind::DomainLifecycle { uuid, event, detail }
            }
            BackendSignal::Network { uuid, event, detail } => {
                EventKind::NetworkLifecycle { uuid, event, detail }
            }
            BackendSignal::Pool { uuid, event, detail } => {
                EventKind::PoolLifecycle { uuid, event, detail }
            }
            BackendSignal::Secret { uuid, event, detail } => {
                EventKind::SecretLifecycle { uuid, event, detail }
            }
        };
        self.send_event(kind);
    }

    // ========================================
    // Settings and deletion
    // ========================================

    /// Persists `settings`, then emits `SettingsChanged`.
    pub fn set_settings(&self, settings: ConnectionSettings) -> Result<()> {
        self.ensure_not_deleted()?;
        records::update(&*self.inner.store, &self.inner.url, &settings)?;
        *self.inner.settings.borrow_mut() = settings;
        self.emit(ConnectionChange::SettingsChanged);
        Ok(())
    }

    /// Removes this connection.
    ///
    /// Broadcasts `Deleted` first so subscribers can let go, then requires the
    /// bus to be empty. On a leak nothing is removed and `SubscriberLeak`
    /// names the remaining subscribers. Otherwise the persisted record is
    /// removed and an open session is closed.
    pub fn delete_connection(&self) -> Result<()> {
        self.ensure_not_deleted()?;
        self.emit(ConnectionChange::Deleted);
        self.inner.bus.ensure_empty()?;

        records::remove(&*self.inner.store, &self.inner.url)?;
        self.inner.deleted.set(true);
        info!(url = %self.inner.url, "connection deleted");

        // A connect still in flight is closed when its work reports back.
        if self.is_connected() {
            if let Some(handle) = self.end_session() {
                self.close_on_worker(handle);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .field("subscribers", &self.inner.bus.len())
            .finish()
    }
}

/// Connect work. Runs on a worker.
fn open_session(backend: &dyn Backend, url: &str, sink: SignalSink) -> Result<Session> {
    let handle = backend.open(url)?;
    match register_and_probe(&*handle, sink) {
        Ok((capabilities, secret_events)) => Ok(Session {
            handle,
            capabilities,
            secret_events,
        }),
        Err(err) => {
            if let Err(dereg_err) = handle.deregister_event_sources() {
                debug!(url, error = %dereg_err, "deregister after failed connect also failed");
            }
            if let Err(close_err) = handle.close() {
                debug!(url, error = %close_err, "close after failed connect also failed");
            }
            Err(err)
        }
    }
}

fn register_and_probe(handle: &dyn BackendHandle, sink: SignalSink) -> Result<(Capabilities, bool)> {
    let mut secret_events = true;
    for source in EventSource::ALL {
        match handle.register_event_source(source, Arc::clone(&sink)) {
            Ok(()) => {}
            Err(err) if source.is_optional() => {
                debug!(?source, error = %err, "optional event source unavailable");
                secret_events = false;
            }
            Err(err) => return Err(err.into()),
        }
    }
    let capabilities = handle.capabilities()?;
    Ok((capabilities, secret_events))
}
