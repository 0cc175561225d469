//! Resource wrappers - per-object views scoped to one connection.
//!
//! A wrapper ([`Domain`], [`Network`], [`Pool`], [`Secret`]) subscribes to its
//! connection's bus when it is created and re-broadcasts, on its own bus, only
//! the events that concern it:
//!
//! 1. **Category filter**: connection-generic events pass; resource events
//!    pass only if they belong to the wrapper's resource type.
//! 2. **Identity filter**: resource events pass only if their subject is the
//!    wrapper's uuid. Pool volume events are exempt; their subject is a
//!    volume name.
//!
//! When `Disconnected` or `Deleted` arrives from the connection, the wrapper
//! drops its own connection subscription before forwarding the event. Nothing
//! else unsubscribes on anyone's behalf.
//!
//! # Deletion
//! `delete_*` broadcasts the kind's `Deleted` generic event on the
//! connection's bus (which reaches this wrapper's bus through the filter),
//! then requires the wrapper's bus to be empty, and only then issues the
//! destructive backend call.

mod domain;
mod network;
mod pool;
mod secret;

pub use self::domain::Domain;
pub use self::network::Network;
pub use self::pool::Pool;
pub use self::secret::Secret;

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::app::{EventBus, JobResult};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::model::{Event, EventKind, JobId, ResourceType, SubscriptionId};
use crate::ports::{BackendHandle, ObjectInfo};

/// State shared by every wrapper kind. Reached through `Deref` on the wrapper.
pub struct Resource {
    kind: ResourceType,
    uuid: String,
    connection: Connection,
    bus: EventBus<Event>,
    subscription: Cell<Option<SubscriptionId>>,
    this: Weak<Resource>,
}

impl Resource {
    /// Liveness check, then subscribe to the connection.
    fn new(connection: &Connection, kind: ResourceType, uuid: String) -> Result<Rc<Self>> {
        connection.is_alive()?;
        let resource = Rc::new_cyclic(|this| Resource {
            kind,
            bus: EventBus::new(format!("{kind} {uuid}")),
            uuid,
            connection: connection.clone(),
            subscription: Cell::new(None),
            this: this.clone(),
        });
        resource.attach()?;
        debug!(url = %connection.url(), resource = %resource.label(), "wrapper created");
        Ok(resource)
    }

    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// This object's own bus.
    pub fn event_bus(&self) -> &EventBus<Event> {
        &self.bus
    }

    /// Whether the wrapper currently listens to its connection.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.get().is_some()
    }

    fn label(&self) -> String {
        format!("{} {}", self.kind, self.uuid)
    }

    /// Subscribes to the connection's bus. A wrapper holds at most one
    /// subscription; a second `attach` fails with `DuplicateSubscriber`.
    pub fn attach(&self) -> Result<()> {
        if self.subscription.get().is_some() {
            warn!(resource = %self.label(), "wrapper already attached");
            return Err(Error::DuplicateSubscriber { label: self.label() });
        }
        let this = self.this.clone();
        let id = self
            .connection
            .event_bus()
            .register(self.label(), move |event: &Event| {
                if let Some(resource) = this.upgrade() {
                    resource.on_connection_event(event);
                }
            });
        self.subscription.set(Some(id));
        Ok(())
    }

    /// Drops the connection subscription. Detaching twice is a no-op.
    pub fn detach(&self) -> Result<()> {
        match self.subscription.take() {
            Some(id) => self.connection.event_bus().unregister(id),
            None => Ok(()),
        }
    }

    /// Whether `event` concerns this object.
    fn accepts(&self, event: &Event) -> bool {
        match event.category().resource_type() {
            None => true,
            Some(kind) if kind != self.kind => false,
            Some(_) => match &event.kind {
                EventKind::PoolGeneric { change, .. } if change.concerns_volume() => true,
                _ => event.subject() == Some(self.uuid.as_str()),
            },
        }
    }

    fn on_connection_event(&self, event: &Event) {
        if !self.accepts(event) {
            return;
        }
        if event.ends_connection_session() {
            if let Some(id) = self.subscription.take() {
                debug!(resource = %self.label(), "connection session ended; detaching");
                if let Err(err) = self.connection.event_bus().unregister(id) {
                    warn!(resource = %self.label(), error = %err, "detach failed");
                }
            }
        }
        self.bus.broadcast(event);
    }

    /// Current backend summary of this object.
    pub fn info(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<ObjectInfo>) + 'static,
    ) -> Result<JobId> {
        let kind = self.kind;
        self.call(move |h, uuid| Ok(h.info(kind, uuid)?), on_error, on_finally)
    }

    /// Runs `work(handle, uuid)` on a worker after the liveness barrier.
    fn call<T, W>(
        &self,
        work: W,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<T>) + 'static,
    ) -> Result<JobId>
    where
        T: Send + 'static,
        W: FnOnce(&dyn BackendHandle, &str) -> Result<T> + Send + 'static,
    {
        let uuid = self.uuid.clone();
        self.connection
            .call(move |h| work(h, &uuid), on_error, on_finally)
    }

    /// Like `call`; broadcasts `change` on the connection's bus once the work
    /// succeeded, before `on_finally` runs.
    fn call_then_notify<T, W>(
        &self,
        work: W,
        change: EventKind,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<T>) + 'static,
    ) -> Result<JobId>
    where
        T: Send + 'static,
        W: FnOnce(&dyn BackendHandle, &str) -> Result<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        self.call(work, on_error, move |result: JobResult<T>| {
            if result.is_success() {
                connection.send_event(change);
            }
            on_finally(result)
        })
    }

    /// Deletion protocol: announce, require an empty bus, then destroy.
    fn delete_with<W>(
        &self,
        deleted: EventKind,
        work: W,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId>
    where
        W: FnOnce(&dyn BackendHandle, &str) -> Result<()> + Send + 'static,
    {
        self.connection.is_alive()?;
        self.connection.send_event(deleted);
        self.bus.ensure_empty()?;
        info!(url = %self.connection.url(), resource = %self.label(), "deleting");
        self.call(work, on_error, on_finally)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            if self.connection.event_bus().is_registered(id) {
                let _ = self.connection.event_bus().unregister(id);
            }
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind)
            .field("uuid", &self.uuid)
            .field("connection", &self.connection.url())
            .field("subscribed", &self.is_subscribed())
            .field("subscribers", &self.bus.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{WAIT, connected, fixture, record_events};
    use crate::model::{
        ConnectionChange, DomainChange, DomainLifecycle, NetworkLifecycle, PoolChange,
    };
    use crate::ports::BackendSignal;
    use rstest::rstest;

    fn event(kind: EventKind) -> Event {
        Event::new("test://host/system", kind)
    }

    #[tokio::test]
    async fn construction_requires_a_live_connection() {
        let fx = fixture();
        assert!(matches!(fx.conn.domain("d1"), Err(Error::NotConnected { .. })));

        let fx = connected().await;
        fx.backend.kill();
        assert!(matches!(fx.conn.domain("d1"), Err(Error::ConnectionLost { .. })));
        assert!(fx.conn.event_bus().is_empty());
    }

    #[tokio::test]
    async fn second_attach_is_a_duplicate() {
        let fx = connected().await;
        let domain = fx.conn.domain("d1").unwrap();

        assert!(matches!(
            domain.attach(),
            Err(Error::DuplicateSubscriber { label }) if label == "domain d1"
        ));
        assert_eq!(fx.conn.event_bus().len(), 1);
    }

    #[tokio::test]
    async fn detach_then_attach_again() {
        let fx = connected().await;
        let domain = fx.conn.domain("d1").unwrap();

        domain.detach().unwrap();
        domain.detach().unwrap();
        assert!(fx.conn.event_bus().is_empty());

        domain.attach().unwrap();
        assert!(domain.is_subscribed());
    }

    #[rstest]
    #[case::connection_generic(EventKind::Connection(ConnectionChange::SettingsChanged), true)]
    #[case::own_lifecycle(
        EventKind::DomainLifecycle { uuid: "d1".into(), event: DomainLifecycle::Started, detail: 0 },
        true
    )]
    #[case::own_generic(EventKind::DomainGeneric { uuid: "d1".into(), change: DomainChange::Added }, true)]
    #[case::other_domain(
        EventKind::DomainLifecycle { uuid: "d2".into(), event: DomainLifecycle::Started, detail: 0 },
        false
    )]
    #[case::other_type_same_uuid(
        EventKind::NetworkLifecycle { uuid: "d1".into(), event: NetworkLifecycle::Started, detail: 0 },
        false
    )]
    #[tokio::test]
    async fn domain_filter(#[case] kind: EventKind, #[case] forwarded: bool) {
        let fx = connected().await;
        let domain = fx.conn.domain("d1").unwrap();
        let (_, log) = record_events(domain.event_bus(), "view");

        fx.conn.send_event(kind);
        assert_eq!(log.borrow().len(), usize::from(forwarded));
    }

    #[tokio::test]
    async fn backend_signal_reaches_only_the_matching_wrapper() {
        let fx = connected().await;
        let u1 = fx.backend.add_object(ResourceType::Domain, "web", false);
        let u2 = fx.backend.add_object(ResourceType::Domain, "db", false);
        let first = fx.conn.domain(u1.clone()).unwrap();
        let second = fx.conn.domain(u2).unwrap();
        let (_, first_log) = record_events(first.event_bus(), "first-view");
        let (_, second_log) = record_events(second.event_bus(), "second-view");

        fx.backend.raise(BackendSignal::Domain {
            uuid: u1.clone(),
            event: DomainLifecycle::Started,
            detail: 0,
        });
        assert!(fx.dispatcher.run_until(|| !first_log.borrow().is_empty(), WAIT).await);
        fx.dispatcher.drain();

        assert_eq!(first_log.borrow().len(), 1);
        assert_eq!(first_log.borrow()[0].subject(), Some(u1.as_str()));
        assert!(second_log.borrow().is_empty());
    }

    #[tokio::test]
    async fn pool_passes_volume_events_for_any_subject() {
        let fx = connected().await;
        let pool = fx.conn.pool("p1").unwrap();

        assert!(pool.accepts(&event(EventKind::PoolGeneric {
            uuid: "disk.img".into(),
            change: PoolChange::VolumeAdded { pool: "p1".into() },
        })));
        assert!(!pool.accepts(&event(EventKind::PoolGeneric {
            uuid: "p2".into(),
            change: PoolChange::Refreshed,
        })));
    }

    #[tokio::test]
    async fn disconnect_cascades_to_wrappers() {
        let fx = connected().await;
        let domain = fx.conn.domain("d1").unwrap();
        let network = fx.conn.network("n1").unwrap();
        let (_, domain_log) = record_events(domain.event_bus(), "domain-view");
        let (_, network_log) = record_events(network.event_bus(), "network-view");

        fx.conn.disconnect().unwrap();

        assert!(!domain.is_subscribed());
        assert!(!network.is_subscribed());
        assert!(fx.conn.event_bus().is_empty());
        assert_eq!(
            domain_log.borrow()[0].connection_change(),
            Some(&ConnectionChange::Disconnected)
        );
        assert_eq!(network_log.borrow().len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_wrapper_unsubscribes_it() {
        let fx = connected().await;
        let domain = fx.conn.domain("d1").unwrap();
        let clone = domain.clone();
        assert_eq!(fx.conn.event_bus().len(), 1);

        drop(domain);
        assert_eq!(fx.conn.event_bus().len(), 1);
        drop(clone);
        assert!(fx.conn.event_bus().is_empty());
    }

    #[tokio::test]
    async fn wrappers_let_the_connection_be_deleted() {
        let fx = connected().await;
        let domain = fx.conn.domain("d1").unwrap();
        let (_, log) = record_events(domain.event_bus(), "view");

        // The wrapper detaches itself on Deleted; its own subscriber is not
        // on the connection's bus.
        fx.conn.delete_connection().unwrap();
        assert!(!domain.is_subscribed());
        assert_eq!(
            log.borrow()[0].connection_change(),
            Some(&ConnectionChange::Deleted)
        );
        assert!(
            fx.dispatcher
                .run_until(|| fx.backend.count_calls("close") == 1, WAIT)
                .await
        );
    }
}
