//! Backend operations issued through a connection.
//!
//! Each one passes the liveness barrier on the dispatch context, then runs the
//! backend call on a worker with `run_failable`. Barrier failures are returned
//! to the caller directly; backend failures reach `on_error`.

use tracing::info;

use super::Connection;
use crate::app::JobResult;
use crate::error::{Error, Result};
use crate::model::{DomainChange, EventKind, JobId, NetworkChange, PoolChange, ResourceType, SecretChange};
use crate::ports::{BackendHandle, Capabilities, ObjectInfo};
use crate::resources::{Domain, Network, Pool, Secret};

/// The `Added` generic event for a freshly defined object.
pub(crate) fn added_event(kind: ResourceType, uuid: String) -> EventKind {
    match kind {
        ResourceType::Domain => EventKind::DomainGeneric {
            uuid,
            change: DomainChange::Added,
        },
        ResourceType::Network => EventKind::NetworkGeneric {
            uuid,
            change: NetworkChange::Added,
        },
        ResourceType::Pool => EventKind::PoolGeneric {
            uuid,
            change: PoolChange::Added,
        },
        ResourceType::Secret => EventKind::SecretGeneric {
            uuid,
            change: SecretChange::Added,
        },
    }
}

impl Connection {
    /// Runs `work` against the live handle on a worker.
    pub fn call<T, W, E, F>(&self, work: W, on_error: E, on_finally: F) -> Result<JobId>
    where
        T: Send + 'static,
        W: FnOnce(&dyn BackendHandle) -> Result<T> + Send + 'static,
        E: FnOnce(Error) + 'static,
        F: FnOnce(JobResult<T>) + 'static,
    {
        let handle = self.live_handle()?;
        Ok(self
            .dispatcher()
            .run_failable(move || work(&*handle), on_error, on_finally))
    }

    /// Enumerates objects of one family.
    pub fn list(
        &self,
        kind: ResourceType,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Vec<ObjectInfo>>) + 'static,
    ) -> Result<JobId> {
        self.call(move |h| Ok(h.list(kind)?), on_error, on_finally)
    }

    pub fn list_domains(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Vec<ObjectInfo>>) + 'static,
    ) -> Result<JobId> {
        self.list(ResourceType::Domain, on_error, on_finally)
    }

    pub fn list_networks(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Vec<ObjectInfo>>) + 'static,
    ) -> Result<JobId> {
        self.list(ResourceType::Network, on_error, on_finally)
    }

    pub fn list_pools(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Vec<ObjectInfo>>) + 'static,
    ) -> Result<JobId> {
        self.list(ResourceType::Pool, on_error, on_finally)
    }

    pub fn list_secrets(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Vec<ObjectInfo>>) + 'static,
    ) -> Result<JobId> {
        self.list(ResourceType::Secret, on_error, on_finally)
    }

    /// Defines a new object from `xml`. On success the kind's `Added`
    /// generic event is broadcast before `on_finally` runs.
    pub fn define(
        &self,
        kind: ResourceType,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<ObjectInfo>) + 'static,
    ) -> Result<JobId> {
        let xml = xml.into();
        let conn = self.clone();
        self.call(
            move |h| Ok(h.define(kind, &xml)?),
            on_error,
            move |result: JobResult<ObjectInfo>| {
                if let JobResult::Success(info) = &result {
                    info!(url = %conn.url(), %kind, uuid = %info.uuid, name = %info.name, "defined");
                    conn.send_event(added_event(kind, info.uuid.clone()));
                }
                on_finally(result)
            },
        )
    }

    pub fn define_domain(
        &self,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<ObjectInfo>) + 'static,
    ) -> Result<JobId> {
        self.define(ResourceType::Domain, xml, on_error, on_finally)
    }

    pub fn define_network(
        &self,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<ObjectInfo>) + 'static,
    ) -> Result<JobId> {
        self.define(ResourceType::Network, xml, on_error, on_finally)
    }

    pub fn define_pool(
        &self,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<ObjectInfo>) + 'static,
    ) -> Result<JobId> {
        self.define(ResourceType::Pool, xml, on_error, on_finally)
    }

    pub fn define_secret(
        &self,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<ObjectInfo>) + 'static,
    ) -> Result<JobId> {
        self.define(ResourceType::Secret, xml, on_error, on_finally)
    }

    /// Re-reads the capability snapshot into the cache.
    pub fn refresh_capabilities(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Capabilities>) + 'static,
    ) -> Result<JobId> {
        let conn = self.clone();
        self.call(
            |h| Ok(h.capabilities()?),
            on_error,
            move |result: JobResult<Capabilities>| {
                if let JobResult::Success(caps) = &result {
                    if conn.is_connected() {
                        *conn.inner.capabilities.borrow_mut() = Some(caps.clone());
                    }
                }
                on_finally(result)
            },
        )
    }

    // ========================================
    // Resource lookup
    // ========================================

    pub fn domain(&self, uuid: impl Into<String>) -> Result<Domain> {
        Domain::new(self, uuid.into())
    }

    pub fn network(&self, uuid: impl Into<String>) -> Result<Network> {
        Network::new(self, uuid.into())
    }

    pub fn pool(&self, uuid: impl Into<String>) -> Result<Pool> {
        Pool::new(self, uuid.into())
    }

    pub fn secret(&self, uuid: impl Into<String>) -> Result<Secret> {
        Secret::new(self, uuid.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{WAIT, connected, fixture, record_events};
    use super::*;
    use crate::model::{ConnectionChange, EventCategory};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[tokio::test]
    async fn call_refuses_when_not_connected() {
        let fx = fixture();
        let result = fx.conn.list_domains(|_| {}, |_| {});
        assert!(matches!(result, Err(Error::NotConnected { .. })));
        assert_eq!(fx.dispatcher.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn call_on_a_dead_handle_disconnects_first() {
        let fx = connected().await;
        let (_, log) = record_events(fx.conn.event_bus(), "test");
        fx.backend.kill();

        let result = fx.conn.list_pools(|_| {}, |_| {});
        assert!(matches!(result, Err(Error::ConnectionLost { .. })));
        assert_eq!(
            log.borrow()[0].connection_change(),
            Some(&ConnectionChange::Disconnected)
        );
        assert_eq!(fx.backend.count_calls("list"), 0);
    }

    #[tokio::test]
    async fn list_returns_backend_objects() {
        let fx = connected().await;
        fx.backend.add_object(ResourceType::Domain, "vm1", true);
        fx.backend.add_object(ResourceType::Network, "default", true);
        let names = Rc::new(RefCell::new(None));

        fx.conn
            .list_domains(|err| panic!("unexpected error: {err}"), {
                let names = names.clone();
                move |result| {
                    let infos = result.success().unwrap_or_default();
                    *names.borrow_mut() = Some(infos.into_iter().map(|i| i.name).collect::<Vec<_>>());
                }
            })
            .unwrap();

        assert!(fx.dispatcher.run_until(|| names.borrow().is_some(), WAIT).await);
        assert_eq!(names.borrow().clone().unwrap(), vec!["vm1".to_string()]);
    }

    #[tokio::test]
    async fn define_broadcasts_added_before_finally() {
        let fx = connected().await;
        let (_, log) = record_events(fx.conn.event_bus(), "test");
        let seen_at_finally = Rc::new(RefCell::new(None));

        fx.conn
            .define_network(
                "<network><name>lan</name></network>",
                |err| panic!("unexpected error: {err}"),
                {
                    let log = log.clone();
                    let seen = seen_at_finally.clone();
                    move |result| {
                        let info = result.success().unwrap();
                        let generic: Vec<_> = log
                            .borrow()
                            .iter()
                            .filter(|e| e.category() == EventCategory::NetworkGeneric)
                            .map(|e| e.kind.clone())
                            .collect();
                        *seen.borrow_mut() = Some((info.uuid, generic));
                    }
                },
            )
            .unwrap();

        assert!(fx.dispatcher.run_until(|| seen_at_finally.borrow().is_some(), WAIT).await);
        let (uuid, generic) = seen_at_finally.borrow_mut().take().unwrap();
        assert_eq!(generic, vec![added_event(ResourceType::Network, uuid)]);
    }

    #[tokio::test]
    async fn define_failure_reaches_on_error() {
        let fx = connected().await;
        let failed = Rc::new(RefCell::new(None));

        fx.conn
            .define_pool(
                "<pool/>",
                {
                    let failed = failed.clone();
                    move |err| *failed.borrow_mut() = Some(err.as_label())
                },
                |result| assert!(!result.is_success()),
            )
            .unwrap();

        assert!(fx.dispatcher.run_until(|| failed.borrow().is_some(), WAIT).await);
        assert_eq!(*failed.borrow(), Some("backend"));
    }

    #[tokio::test]
    async fn refresh_capabilities_updates_the_cache() {
        let fx = connected().await;
        let done = Rc::new(RefCell::new(false));

        fx.conn
            .refresh_capabilities(|_| {}, {
                let done = done.clone();
                move |_| *done.borrow_mut() = true
            })
            .unwrap();

        assert!(fx.dispatcher.run_until(|| *done.borrow(), WAIT).await);
        assert!(fx.conn.capabilities().unwrap().host.contains("test://host/system"));
    }
}
