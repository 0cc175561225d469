use std::ops::Deref;
use std::rc::Rc;

use super::Resource;
use crate::app::JobResult;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::model::{EventKind, JobId, ResourceType, SecretChange};

/// A stored secret on one connection.
///
/// Backends without secret lifecycle events (see
/// `Connection::supports_secret_events`) still get the generic events below.
#[derive(Debug, Clone)]
pub struct Secret {
    resource: Rc<Resource>,
}

impl Deref for Secret {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Secret {
    pub(crate) fn new(connection: &Connection, uuid: String) -> Result<Self> {
        Ok(Self {
            resource: Resource::new(connection, ResourceType::Secret, uuid)?,
        })
    }

    fn generic(&self, change: SecretChange) -> EventKind {
        EventKind::SecretGeneric {
            uuid: self.uuid().to_string(),
            change,
        }
    }

    /// Replaces the secret's value. The bytes are moved to the worker and
    /// never logged.
    pub fn set_value(
        &self,
        value: Vec<u8>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call_then_notify(
            move |h, uuid| Ok(h.set_secret_value(uuid, &value)?),
            self.generic(SecretChange::ValueChanged),
            on_error,
            on_finally,
        )
    }

    pub fn delete_secret(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.delete_with(
            self.generic(SecretChange::Deleted),
            |h, uuid| Ok(h.undefine(ResourceType::Secret, uuid)?),
            on_error,
            on_finally,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{WAIT, connected, record_events};
    use crate::ports::EventSource;
    use std::cell::Cell;

    #[tokio::test]
    async fn set_value_without_secret_events() {
        let fx = crate::connection::tests::fixture();
        fx.backend.reject_event_source(EventSource::SecretLifecycle);
        fx.conn.try_connect().unwrap();
        assert!(fx.dispatcher.run_until(|| fx.conn.is_connected(), WAIT).await);

        let uuid = fx.backend.add_object(ResourceType::Secret, "iscsi-chap", false);
        let secret = fx.conn.secret(uuid.clone()).unwrap();
        let (_, log) = record_events(secret.event_bus(), "view");
        let done = Rc::new(Cell::new(false));

        secret
            .set_value(b"hunter2".to_vec(), |e| panic!("{e}"), {
                let done = done.clone();
                move |r| done.set(r.is_success())
            })
            .unwrap();

        assert!(fx.dispatcher.run_until(|| done.get(), WAIT).await);
        assert_eq!(fx.backend.secret_value(&uuid), Some(b"hunter2".to_vec()));
        assert_eq!(
            log.borrow()[0].kind,
            EventKind::SecretGeneric {
                uuid,
                change: SecretChange::ValueChanged
            }
        );
    }

    #[tokio::test]
    async fn delete_secret_removes_it() {
        let fx = connected().await;
        let uuid = fx.backend.add_object(ResourceType::Secret, "ceph", false);
        let secret = fx.conn.secret(uuid.clone()).unwrap();
        let done = Rc::new(Cell::new(false));

        secret
            .delete_secret(|e| panic!("{e}"), {
                let done = done.clone();
                move |r| done.set(r.is_success())
            })
            .unwrap();

        assert!(fx.dispatcher.run_until(|| done.get(), WAIT).await);
        assert!(fx.backend.object_info(&uuid).is_none());
    }
}
