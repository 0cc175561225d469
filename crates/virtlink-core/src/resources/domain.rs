use std::ops::Deref;
use std::rc::Rc;

use super::Resource;
use crate::app::JobResult;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::model::{DomainChange, EventKind, JobId, ResourceType};
use crate::ports::DomainAction;

/// A virtual machine on one connection.
#[derive(Debug, Clone)]
pub struct Domain {
    resource: Rc<Resource>,
}

impl Deref for Domain {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Domain {
    pub(crate) fn new(connection: &Connection, uuid: String) -> Result<Self> {
        Ok(Self {
            resource: Resource::new(connection, ResourceType::Domain, uuid)?,
        })
    }

    fn generic(&self, change: DomainChange) -> EventKind {
        EventKind::DomainGeneric {
            uuid: self.uuid().to_string(),
            change,
        }
    }

    fn action(
        &self,
        action: DomainAction,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call(
            move |h, uuid| Ok(h.domain_action(uuid, action)?),
            on_error,
            on_finally,
        )
    }

    pub fn start(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call(
            |h, uuid| Ok(h.start(ResourceType::Domain, uuid)?),
            on_error,
            on_finally,
        )
    }

    /// Graceful shutdown request; the guest decides when it is done.
    pub fn shutdown(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.action(DomainAction::Shutdown, on_error, on_finally)
    }

    pub fn reboot(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.action(DomainAction::Reboot, on_error, on_finally)
    }

    /// Hard power-off.
    pub fn force_off(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call(
            |h, uuid| Ok(h.stop(ResourceType::Domain, uuid)?),
            on_error,
            on_finally,
        )
    }

    pub fn suspend(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.action(DomainAction::Suspend, on_error, on_finally)
    }

    pub fn resume(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.action(DomainAction::Resume, on_error, on_finally)
    }

    pub fn set_autostart(
        &self,
        enabled: bool,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call_then_notify(
            move |h, uuid| Ok(h.set_autostart(ResourceType::Domain, uuid, enabled)?),
            self.generic(DomainChange::AutostartChanged { enabled }),
            on_error,
            on_finally,
        )
    }

    /// Replaces the definition; emits `SettingsChanged` on success.
    pub fn update_definition(
        &self,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        let xml = xml.into();
        self.call_then_notify(
            move |h, uuid| Ok(h.redefine(ResourceType::Domain, uuid, &xml)?),
            self.generic(DomainChange::SettingsChanged),
            on_error,
            on_finally,
        )
    }

    pub fn take_snapshot(
        &self,
        name: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        let name = name.into();
        let change = self.generic(DomainChange::SnapshotTaken { name: name.clone() });
        self.call_then_notify(
            move |h, uuid| Ok(h.create_snapshot(uuid, &name)?),
            change,
            on_error,
            on_finally,
        )
    }

    pub fn delete_snapshot(
        &self,
        name: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        let name = name.into();
        let change = self.generic(DomainChange::SnapshotDeleted { name: name.clone() });
        self.call_then_notify(
            move |h, uuid| Ok(h.delete_snapshot(uuid, &name)?),
            change,
            on_error,
            on_finally,
        )
    }

    /// Undefines the domain. Fails with `SubscriberLeak` if anything is still
    /// subscribed to this wrapper after the `Deleted` announcement.
    pub fn delete_domain(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.delete_with(
            self.generic(DomainChange::Deleted),
            |h, uuid| Ok(h.undefine(ResourceType::Domain, uuid)?),
            on_error,
            on_finally,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{WAIT, connected, record_events};
    use crate::model::{DomainLifecycle, Event, EventCategory};
    use std::cell::{Cell, RefCell};

    fn done_flag() -> (Rc<Cell<bool>>, impl FnOnce(JobResult<()>) + 'static) {
        let flag = Rc::new(Cell::new(false));
        let setter = {
            let flag = flag.clone();
            move |result: JobResult<()>| {
                assert!(result.is_success());
                flag.set(true)
            }
        };
        (flag, setter)
    }

    #[tokio::test]
    async fn start_reports_backend_lifecycle_event() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Domain, "vm1", false);
        let domain = fx.conn.domain(uuid.clone()).unwrap();
        let (_, log) = record_events(domain.event_bus(), "view");

        domain.start(|err| panic!("start failed: {err}"), |_| {}).unwrap();

        assert!(fx.dispatcher.run_until(|| !log.borrow().is_empty(), WAIT).await);
        assert_eq!(
            log.borrow()[0].kind,
            EventKind::DomainLifecycle {
                uuid,
                event: DomainLifecycle::Started,
                detail: 0
            }
        );
    }

    #[tokio::test]
    async fn snapshot_emits_generic_event() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Domain, "vm1", true);
        let domain = fx.conn.domain(uuid.clone()).unwrap();
        let (_, log) = record_events(domain.event_bus(), "view");
        let (done, on_finally) = done_flag();

        domain
            .take_snapshot("before-upgrade", |err| panic!("{err}"), on_finally)
            .unwrap();

        assert!(fx.dispatcher.run_until(|| done.get(), WAIT).await);
        assert_eq!(fx.backend.snapshots(&uuid), vec!["before-upgrade".to_string()]);
        let generic: Vec<_> = log
            .borrow()
            .iter()
            .filter(|e| e.category() == EventCategory::DomainGeneric)
            .map(|e| e.kind.clone())
            .collect();
        assert_eq!(
            generic,
            vec![EventKind::DomainGeneric {
                uuid,
                change: DomainChange::SnapshotTaken {
                    name: "before-upgrade".into()
                }
            }]
        );
    }

    #[tokio::test]
    async fn failed_action_emits_nothing() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Domain, "vm1", true);
        let domain = fx.conn.domain(uuid).unwrap();
        let (_, log) = record_events(domain.event_bus(), "view");
        fx.backend.fail_next("set_autostart", "read-only connection");
        let error = Rc::new(RefCell::new(None));

        domain
            .set_autostart(
                true,
                {
                    let error = error.clone();
                    move |err| *error.borrow_mut() = Some(err.to_string())
                },
                |_| {},
            )
            .unwrap();

        assert!(fx.dispatcher.run_until(|| error.borrow().is_some(), WAIT).await);
        fx.dispatcher.run_for(std::time::Duration::from_millis(20)).await;
        assert!(error.borrow().as_deref().unwrap().contains("read-only"));
        assert!(log.borrow().is_empty());
    }

    #[tokio::test]
    async fn update_definition_replaces_xml() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Domain, "vm1", false);
        let domain = fx.conn.domain(uuid.clone()).unwrap();
        let (done, on_finally) = done_flag();

        domain
            .update_definition("<domain><name>vm1-renamed</name></domain>", |e| panic!("{e}"), on_finally)
            .unwrap();

        assert!(fx.dispatcher.run_until(|| done.get(), WAIT).await);
        assert_eq!(fx.backend.object_info(&uuid).unwrap().name, "vm1-renamed");
        assert!(fx.backend.definition(&uuid).unwrap().contains("vm1-renamed"));
    }

    #[tokio::test]
    async fn delete_with_a_lingering_subscriber_never_reaches_the_backend() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Domain, "vm1", false);
        let domain = fx.conn.domain(uuid.clone()).unwrap();
        record_events(domain.event_bus(), "details-view");
        let (_, conn_log) = record_events(fx.conn.event_bus(), "tree-view");

        let result = domain.delete_domain(|_| {}, |_| {});

        assert!(matches!(result, Err(Error::SubscriberLeak { .. })));
        assert_eq!(
            conn_log.borrow()[0].kind,
            EventKind::DomainGeneric {
                uuid: uuid.clone(),
                change: DomainChange::Deleted
            }
        );
        fx.dispatcher.run_for(std::time::Duration::from_millis(20)).await;
        assert_eq!(fx.backend.count_calls("undefine"), 0);
        assert!(fx.backend.object_info(&uuid).is_some());
    }

    #[tokio::test]
    async fn subscriber_that_leaves_on_deleted_allows_delete() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Domain, "vm1", false);
        let domain = fx.conn.domain(uuid.clone()).unwrap();

        let id = Rc::new(Cell::new(None));
        let registered = domain.event_bus().register("details-view", {
            let owner = domain.clone();
            let id = id.clone();
            move |ev: &Event| {
                if let EventKind::DomainGeneric {
                    change: DomainChange::Deleted,
                    ..
                } = ev.kind
                {
                    if let Some(id) = id.take() {
                        owner.event_bus().unregister(id).unwrap();
                    }
                }
            }
        });
        id.set(Some(registered));
        let (done, on_finally) = done_flag();

        domain.delete_domain(|err| panic!("{err}"), on_finally).unwrap();

        assert!(fx.dispatcher.run_until(|| done.get(), WAIT).await);
        assert_eq!(fx.backend.count_calls("undefine"), 1);
        assert!(fx.backend.object_info(&uuid).is_none());
    }
}
