use std::ops::Deref;
use std::rc::Rc;

use super::Resource;
use crate::app::JobResult;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::model::{EventKind, JobId, NetworkChange, ResourceType};

/// A virtual network on one connection.
#[derive(Debug, Clone)]
pub struct Network {
    resource: Rc<Resource>,
}

impl Deref for Network {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Network {
    pub(crate) fn new(connection: &Connection, uuid: String) -> Result<Self> {
        Ok(Self {
            resource: Resource::new(connection, ResourceType::Network, uuid)?,
        })
    }

    fn generic(&self, change: NetworkChange) -> EventKind {
        EventKind::NetworkGeneric {
            uuid: self.uuid().to_string(),
            change,
        }
    }

    pub fn start(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call(
            |h, uuid| Ok(h.start(ResourceType::Network, uuid)?),
            on_error,
            on_finally,
        )
    }

    pub fn stop(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call(
            |h, uuid| Ok(h.stop(ResourceType::Network, uuid)?),
            on_error,
            on_finally,
        )
    }

    pub fn set_autostart(
        &self,
        enabled: bool,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call_then_notify(
            move |h, uuid| Ok(h.set_autostart(ResourceType::Network, uuid, enabled)?),
            self.generic(NetworkChange::AutostartChanged { enabled }),
            on_error,
            on_finally,
        )
    }

    pub fn delete_network(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.delete_with(
            self.generic(NetworkChange::Deleted),
            |h, uuid| Ok(h.undefine(ResourceType::Network, uuid)?),
            on_error,
            on_finally,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{WAIT, connected, record_events};
    use crate::model::{EventCategory, NetworkLifecycle};
    use std::cell::Cell;

    #[tokio::test]
    async fn stop_then_autostart() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Network, "default", true);
        let network = fx.conn.network(uuid.clone()).unwrap();
        let (_, log) = record_events(network.event_bus(), "view");
        let done = Rc::new(Cell::new(0));

        let bump = |done: &Rc<Cell<u32>>| {
            let done = done.clone();
            move |_: JobResult<()>| done.set(done.get() + 1)
        };
        network.stop(|e| panic!("{e}"), bump(&done)).unwrap();
        network
            .set_autostart(true, |e| panic!("{e}"), bump(&done))
            .unwrap();

        assert!(fx.dispatcher.run_until(|| done.get() == 2 && log.borrow().len() == 2, WAIT).await);
        let info = fx.backend.object_info(&uuid).unwrap();
        assert!(!info.active);
        assert!(info.autostart);

        let categories: Vec<_> = log.borrow().iter().map(|e| e.category()).collect();
        assert!(categories.contains(&EventCategory::NetworkLifecycle));
        assert!(categories.contains(&EventCategory::NetworkGeneric));
        assert!(log.borrow().iter().any(|e| e.kind
            == EventKind::NetworkLifecycle {
                uuid: uuid.clone(),
                event: NetworkLifecycle::Stopped,
                detail: 0
            }));
    }

    #[tokio::test]
    async fn delete_network_without_subscribers() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Network, "lan", false);
        let network = fx.conn.network(uuid.clone()).unwrap();
        let done = Rc::new(Cell::new(false));

        network
            .delete_network(|e| panic!("{e}"), {
                let done = done.clone();
                move |r| done.set(r.is_success())
            })
            .unwrap();

        assert!(fx.dispatcher.run_until(|| done.get(), WAIT).await);
        assert!(fx.backend.object_info(&uuid).is_none());
    }
}
