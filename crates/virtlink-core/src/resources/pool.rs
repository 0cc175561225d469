use std::io::Write;
use std::ops::Deref;
use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Resource;
use crate::app::{JobResult, ensure_not_cancelled};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::model::{EventKind, JobId, PoolChange, ResourceType};
use crate::ports::{VolumeInfo, VolumeStream};

const DOWNLOAD_CHUNK: usize = 256 * 1024;

/// A storage pool on one connection, and the volumes inside it.
///
/// Volume events use the volume name as subject and are forwarded to every
/// pool wrapper on the connection; check `PoolChange::VolumeAdded::pool` to
/// tell pools apart.
#[derive(Debug, Clone)]
pub struct Pool {
    resource: Rc<Resource>,
}

impl Deref for Pool {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Pool {
    pub(crate) fn new(connection: &Connection, uuid: String) -> Result<Self> {
        Ok(Self {
            resource: Resource::new(connection, ResourceType::Pool, uuid)?,
        })
    }

    fn generic(&self, change: PoolChange) -> EventKind {
        EventKind::PoolGeneric {
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
            |h, uuid| Ok(h.start(ResourceType::Pool, uuid)?),
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
            |h, uuid| Ok(h.stop(ResourceType::Pool, uuid)?),
            on_error,
            on_finally,
        )
    }

    /// Rescans the pool's backing storage.
    pub fn refresh(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.call_then_notify(
            |h, uuid| Ok(h.refresh_pool(uuid)?),
            self.generic(PoolChange::Refreshed),
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
            move |h, uuid| Ok(h.set_autostart(ResourceType::Pool, uuid, enabled)?),
            self.generic(PoolChange::AutostartChanged { enabled }),
            on_error,
            on_finally,
        )
    }

    pub fn list_volumes(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<Vec<VolumeInfo>>) + 'static,
    ) -> Result<JobId> {
        self.call(|h, uuid| Ok(h.list_volumes(uuid)?), on_error, on_finally)
    }

    /// Creates a volume from `xml`; emits `VolumeAdded` with the new volume's
    /// name as subject.
    pub fn create_volume(
        &self,
        xml: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<VolumeInfo>) + 'static,
    ) -> Result<JobId> {
        let xml = xml.into();
        let connection = self.connection().clone();
        let pool = self.uuid().to_string();
        self.call(
            move |h, uuid| Ok(h.create_volume(uuid, &xml)?),
            on_error,
            move |result: JobResult<VolumeInfo>| {
                if let JobResult::Success(volume) = &result {
                    connection.send_event(EventKind::PoolGeneric {
                        uuid: volume.name.clone(),
                        change: PoolChange::VolumeAdded { pool },
                    });
                }
                on_finally(result)
            },
        )
    }

    pub fn delete_volume(
        &self,
        name: impl Into<String>,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        let name = name.into();
        let change = EventKind::PoolGeneric {
            uuid: name.clone(),
            change: PoolChange::VolumeDeleted {
                pool: self.uuid().to_string(),
            },
        };
        self.call_then_notify(
            move |h, uuid| Ok(h.delete_volume(uuid, &name)?),
            change,
            on_error,
            on_finally,
        )
    }

    /// Streams volume `name` into `sink` on a worker.
    ///
    /// `on_progress(bytes_so_far)` runs on the dispatch context after each
    /// chunk, always before `on_finally`. Cancelling `cancel` stops the
    /// transfer at the next chunk boundary with `Error::Cancelled`.
    pub fn download_volume(
        &self,
        name: impl Into<String>,
        mut sink: Box<dyn Write + Send>,
        cancel: CancellationToken,
        on_progress: impl Fn(u64) + 'static,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<u64>) + 'static,
    ) -> Result<JobId> {
        let name = name.into();
        let dispatcher = self.connection().dispatcher().clone();
        let (progress_channel, progress) = dispatcher.channel(on_progress);

        let result = self.call(
            move |h, uuid| {
                let stream = h.open_volume_stream(uuid, &name)?;
                copy_stream(stream, &mut *sink, &cancel, |total| {
                    let _ = progress.send(total);
                })
            },
            on_error,
            {
                let dispatcher = dispatcher.clone();
                move |result: JobResult<u64>| {
                    dispatcher.close_channel(progress_channel);
                    on_finally(result)
                }
            },
        );
        if result.is_err() {
            dispatcher.close_channel(progress_channel);
        }
        result
    }

    pub fn delete_pool(
        &self,
        on_error: impl FnOnce(Error) + 'static,
        on_finally: impl FnOnce(JobResult<()>) + 'static,
    ) -> Result<JobId> {
        self.delete_with(
            self.generic(PoolChange::Deleted),
            |h, uuid| Ok(h.undefine(ResourceType::Pool, uuid)?),
            on_error,
            on_finally,
        )
    }
}

/// Copies `stream` into `sink`, checking `cancel` before every chunk.
/// The stream is aborted on any failure.
fn copy_stream(
    mut stream: Box<dyn VolumeStream>,
    sink: &mut dyn Write,
    cancel: &CancellationToken,
    mut progress: impl FnMut(u64),
) -> Result<u64> {
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];
    let mut total = 0u64;
    loop {
        if let Err(err) = ensure_not_cancelled(cancel) {
            debug!(bytes = total, "download cancelled");
            stream.abort();
            return Err(err);
        }
        let n = match stream.read_chunk(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                stream.abort();
                return Err(err.into());
            }
        };
        if n == 0 {
            break;
        }
        if let Err(err) = sink.write_all(&buf[..n]) {
            stream.abort();
            return Err(err.into());
        }
        total += n as u64;
        progress(total);
    }
    sink.flush()?;
    Ok(total)
}
