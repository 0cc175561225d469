//! SimulatedBackend - scriptable in-process hypervisor for development and tests.
//!
//! One `SimulatedBackend` models one host. `open` returns a handle bound to a
//! fresh session; only the latest session is alive, so a handle from an older
//! session fails every call.
//!
//! Mutating calls raise the lifecycle signal a real host would (start ->
//! Started, undefine -> Undefined, ...) on the calling worker thread.
//!
//! # Scripting
//! - `fail_open` / `reject_event_source` / `fail_next`: inject failures
//! - `kill`: the session dies silently (only a liveness check notices)
//! - `close_from_backend`: the session dies and the close source fires
//! - `raise`: deliver an arbitrary signal to the registered sinks
//! - `calls`: ordered log of every handle method invoked

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::BackendError;
use crate::model::{DomainLifecycle, NetworkLifecycle, PoolLifecycle, ResourceType, SecretLifecycle};
use crate::ports::{
    Backend, BackendHandle, BackendResult, BackendSignal, Capabilities, CloseReason, DomainAction,
    EventSource, ObjectInfo, SignalSink, VolumeInfo, VolumeStream,
};

const DEFAULT_STREAM_CHUNK: usize = 4096;

struct SimVolume {
    info: VolumeInfo,
    data: Vec<u8>,
}

struct SimObject {
    kind: ResourceType,
    info: ObjectInfo,
    xml: String,
    snapshots: Vec<String>,
    volumes: BTreeMap<String, SimVolume>,
    secret: Option<Vec<u8>>,
}

struct World {
    objects: BTreeMap<String, SimObject>,
    session: u64,
    alive: bool,
    sinks: Vec<(EventSource, SignalSink)>,
    open_failure: Option<String>,
    rejected_sources: HashSet<EventSource>,
    failures: HashMap<String, String>,
    calls: Vec<String>,
    next_id: u64,
    stream_chunk: usize,
}

impl World {
    fn allocate_uuid(&mut self, kind: ResourceType) -> String {
        self.next_id += 1;
        format!("{kind}-{:04}", self.next_id)
    }

    fn object(&self, op: &str, kind: ResourceType, uuid: &str) -> BackendResult<&SimObject> {
        self.objects
            .get(uuid)
            .filter(|o| o.kind == kind)
            .ok_or_else(|| BackendError::new(op, format!("no {kind} with uuid {uuid}")))
    }

    fn object_mut(&mut self, op: &str, kind: ResourceType, uuid: &str) -> BackendResult<&mut SimObject> {
        self.objects
            .get_mut(uuid)
            .filter(|o| o.kind == kind)
            .ok_or_else(|| BackendError::new(op, format!("no {kind} with uuid {uuid}")))
    }

    fn sinks_for(&self, source: EventSource) -> Vec<SignalSink> {
        self.sinks
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, sink)| Arc::clone(sink))
            .collect()
    }
}

fn lock(world: &Mutex<World>) -> MutexGuard<'_, World> {
    world.lock().unwrap_or_else(PoisonError::into_inner)
}

fn source_of(signal: &BackendSignal) -> EventSource {
    match signal {
        BackendSignal::Domain { .. } => EventSource::DomainLifecycle,
        BackendSignal::Network { .. } => EventSource::NetworkLifecycle,
        BackendSignal::Pool { .. } => EventSource::PoolLifecycle,
        BackendSignal::Secret { .. } => EventSource::SecretLifecycle,
        BackendSignal::Closed { .. } => EventSource::Close,
    }
}

/// Sinks are invoked outside the lock.
fn deliver(world: &Mutex<World>, signal: BackendSignal) {
    let sinks = lock(world).sinks_for(source_of(&signal));
    trace!(?signal, sinks = sinks.len(), "raising backend signal");
    for sink in sinks {
        sink(signal.clone());
    }
}

fn lifecycle_signal(kind: ResourceType, uuid: &str, started: bool) -> BackendSignal {
    let uuid = uuid.to_string();
    match kind {
        ResourceType::Domain => BackendSignal::Domain {
            uuid,
            event: if started { DomainLifecycle::Started } else { DomainLifecycle::Stopped },
            detail: 0,
        },
        ResourceType::Network => BackendSignal::Network {
            uuid,
            event: if started { NetworkLifecycle::Started } else { NetworkLifecycle::Stopped },
            detail: 0,
        },
        ResourceType::Pool => BackendSignal::Pool {
            uuid,
            event: if started { PoolLifecycle::Started } else { PoolLifecycle::Stopped },
            detail: 0,
        },
        ResourceType::Secret => BackendSignal::Secret {
            uuid,
            event: if started { SecretLifecycle::Defined } else { SecretLifecycle::Undefined },
            detail: 0,
        },
    }
}

fn definition_signal(kind: ResourceType, uuid: &str, defined: bool) -> BackendSignal {
    let uuid = uuid.to_string();
    match kind {
        ResourceType::Domain => BackendSignal::Domain {
            uuid,
            event: if defined { DomainLifecycle::Defined } else { DomainLifecycle::Undefined },
            detail: 0,
        },
        ResourceType::Network => BackendSignal::Network {
            uuid,
            event: if defined { NetworkLifecycle::Defined } else { NetworkLifecycle::Undefined },
            detail: 0,
        },
        ResourceType::Pool => BackendSignal::Pool {
            uuid,
            event: if defined { PoolLifecycle::Defined } else { PoolLifecycle::Undefined },
            detail: 0,
        },
        ResourceType::Secret => BackendSignal::Secret {
            uuid,
            event: if defined { SecretLifecycle::Defined } else { SecretLifecycle::Undefined },
            detail: 0,
        },
    }
}

/// Extracts `<name>...</name>` from a definition document.
fn name_from_xml(xml: &str) -> Option<&str> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = start + xml[start..].find("</name>")?;
    Some(xml[start..end].trim()).filter(|n| !n.is_empty())
}

/// Scriptable backend. Cheap to clone; clones share the simulated host.
#[derive(Clone)]
pub struct SimulatedBackend {
    world: Arc<Mutex<World>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(World {
                objects: BTreeMap::new(),
                session: 0,
                alive: false,
                sinks: Vec::new(),
                open_failure: None,
                rejected_sources: HashSet::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
                next_id: 0,
                stream_chunk: DEFAULT_STREAM_CHUNK,
            })),
        }
    }

    /// Adds an object to the host and returns its uuid.
    pub fn add_object(&self, kind: ResourceType, name: &str, active: bool) -> String {
        let mut world = lock(&self.world);
        let uuid = world.allocate_uuid(kind);
        world.objects.insert(
            uuid.clone(),
            SimObject {
                kind,
                info: ObjectInfo {
                    uuid: uuid.clone(),
                    name: name.to_string(),
                    active,
                    autostart: false,
                },
                xml: format!("<{kind}><name>{name}</name></{kind}>"),
                snapshots: Vec::new(),
                volumes: BTreeMap::new(),
                secret: None,
            },
        );
        uuid
    }

    /// Adds a volume holding `data` to an existing pool.
    pub fn add_volume(&self, pool: &str, name: &str, data: Vec<u8>) -> BackendResult<()> {
        let mut world = lock(&self.world);
        let object = world.object_mut("add_volume", ResourceType::Pool, pool)?;
        object.volumes.insert(
            name.to_string(),
            SimVolume {
                info: VolumeInfo {
                    name: name.to_string(),
                    capacity: data.len() as u64,
                },
                data,
            },
        );
        Ok(())
    }

    pub fn object_info(&self, uuid: &str) -> Option<ObjectInfo> {
        lock(&self.world).objects.get(uuid).map(|o| o.info.clone())
    }

    pub fn definition(&self, uuid: &str) -> Option<String> {
        lock(&self.world).objects.get(uuid).map(|o| o.xml.clone())
    }

    pub fn snapshots(&self, domain: &str) -> Vec<String> {
        lock(&self.world)
            .objects
            .get(domain)
            .map(|o| o.snapshots.clone())
            .unwrap_or_default()
    }

    pub fn secret_value(&self, uuid: &str) -> Option<Vec<u8>> {
        lock(&self.world).objects.get(uuid).and_then(|o| o.secret.clone())
    }

    /// Every following `open` fails with `message` until cleared with `None`.
    pub fn fail_open(&self, message: Option<&str>) {
        lock(&self.world).open_failure = message.map(str::to_string);
    }

    /// Registration of `source` fails on every following session.
    pub fn reject_event_source(&self, source: EventSource) {
        lock(&self.world).rejected_sources.insert(source);
    }

    /// The next call of `op` (a handle method name) fails with `message`.
    pub fn fail_next(&self, op: &str, message: &str) {
        lock(&self.world)
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn set_stream_chunk(&self, bytes: usize) {
        lock(&self.world).stream_chunk = bytes.max(1);
    }

    /// The current session dies without telling anyone.
    pub fn kill(&self) {
        let mut world = lock(&self.world);
        world.alive = false;
        debug!(session = world.session, "simulated session killed");
    }

    /// The current session dies and the close source fires.
    pub fn close_from_backend(&self, reason: CloseReason) {
        lock(&self.world).alive = false;
        deliver(&self.world, BackendSignal::Closed { reason });
    }

    /// Delivers `signal` to the sinks registered for its source.
    pub fn raise(&self, signal: BackendSignal) {
        deliver(&self.world, signal);
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.world).alive
    }

    pub fn registered_sources(&self) -> Vec<EventSource> {
        lock(&self.world).sinks.iter().map(|(s, _)| *s).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.world).calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        lock(&self.world).calls.iter().filter(|c| *c == op).count()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SimulatedBackend {
    fn open(&self, url: &str) -> BackendResult<Arc<dyn BackendHandle>> {
        let mut world = lock(&self.world);
        world.calls.push("open".to_string());
        if let Some(message) = world.open_failure.clone() {
            return Err(BackendError::new("open", message));
        }
        world.session += 1;
        world.alive = true;
        world.sinks.clear();
        debug!(url, session = world.session, "simulated session opened");
        Ok(Arc::new(SimHandle {
            world: Arc::clone(&self.world),
            uri: url.to_string(),
            session: world.session,
        }))
    }
}

struct SimHandle {
    world: Arc<Mutex<World>>,
    uri: String,
    session: u64,
}

impl SimHandle {
    /// Logs `op` and checks that this session may still be used.
    fn enter(&self, op: &str) -> BackendResult<MutexGuard<'_, World>> {
        let mut world = lock(&self.world);
        world.calls.push(op.to_string());
        if !world.alive || world.session != self.session {
            return Err(BackendError::new(op, "connection is closed"));
        }
        if let Some(message) = world.failures.remove(op) {
            return Err(BackendError::new(op, message));
        }
        Ok(world)
    }
}

impl BackendHandle for SimHandle {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn is_alive(&self) -> bool {
        let world = lock(&self.world);
        world.alive && world.session == self.session
    }

    fn close(&self) -> BackendResult<()> {
        let mut world = lock(&self.world);
        world.calls.push("close".to_string());
        if world.session == self.session {
            world.alive = false;
            world.sinks.clear();
        }
        Ok(())
    }

    fn capabilities(&self) -> BackendResult<Capabilities> {
        let _world = self.enter("capabilities")?;
        Ok(Capabilities {
            host: format!("<capabilities><host uri='{}'/></capabilities>", self.uri),
            domain: "<domainCapabilities/>".to_string(),
        })
    }

    fn register_event_source(&self, source: EventSource, sink: SignalSink) -> BackendResult<()> {
        let mut world = self.enter("register_event_source")?;
        if world.rejected_sources.contains(&source) {
            return Err(BackendError::new(
                "register_event_source",
                format!("{source:?} events are not supported"),
            ));
        }
        world.sinks.push((source, sink));
        Ok(())
    }

    fn deregister_event_sources(&self) -> BackendResult<()> {
        let mut world = lock(&self.world);
        world.calls.push("deregister_event_sources".to_string());
        if world.session == self.session {
            world.sinks.clear();
        }
        match world.failures.remove("deregister_event_sources") {
            Some(message) => Err(BackendError::new("deregister_event_sources", message)),
            None => Ok(()),
        }
    }

    fn list(&self, kind: ResourceType) -> BackendResult<Vec<ObjectInfo>> {
        let world = self.enter("list")?;
        Ok(world
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .map(|o| o.info.clone())
            .collect())
    }

    fn info(&self, kind: ResourceType, uuid: &str) -> BackendResult<ObjectInfo> {
        let world = self.enter("info")?;
        Ok(world.object("info", kind, uuid)?.info.clone())
    }

    fn define(&self, kind: ResourceType, xml: &str) -> BackendResult<ObjectInfo> {
        let info = {
            let mut world = self.enter("define")?;
            let name = name_from_xml(xml)
                .ok_or_else(|| BackendError::new("define", "definition has no <name>"))?
                .to_string();
            if world.objects.values().any(|o| o.kind == kind && o.info.name == name) {
                return Err(BackendError::new("define", format!("{kind} '{name}' already exists")));
            }
            let uuid = world.allocate_uuid(kind);
            let info = ObjectInfo {
                uuid: uuid.clone(),
                name,
                active: false,
                autostart: false,
            };
            world.objects.insert(
                uuid,
                SimObject {
                    kind,
                    info: info.clone(),
                    xml: xml.to_string(),
                    snapshots: Vec::new(),
                    volumes: BTreeMap::new(),
                    secret: None,
                },
            );
            info
        };
        deliver(&self.world, definition_signal(kind, &info.uuid, true));
        Ok(info)
    }

    fn redefine(&self, kind: ResourceType, uuid: &str, xml: &str) -> BackendResult<()> {
        {
            let mut world = self.enter("redefine")?;
            let object = world.object_mut("redefine", kind, uuid)?;
            object.xml = xml.to_string();
            if let Some(name) = name_from_xml(xml) {
                object.info.name = name.to_string();
            }
        }
        deliver(&self.world, definition_signal(kind, uuid, true));
        Ok(())
    }

    fn undefine(&self, kind: ResourceType, uuid: &str) -> BackendResult<()> {
        {
            let mut world = self.enter("undefine")?;
            world.object("undefine", kind, uuid)?;
            world.objects.remove(uuid);
        }
        deliver(&self.world, definition_signal(kind, uuid, false));
        Ok(())
    }

    fn start(&self, kind: ResourceType, uuid: &str) -> BackendResult<()> {
        {
            let mut world = self.enter("start")?;
            let object = world.object_mut("start", kind, uuid)?;
            if object.info.active {
                return Err(BackendError::new("start", format!("{kind} is already active")));
            }
            object.info.active = true;
        }
        deliver(&self.world, lifecycle_signal(kind, uuid, true));
        Ok(())
    }

    fn stop(&self, kind: ResourceType, uuid: &str) -> BackendResult<()> {
        {
            let mut world = self.enter("stop")?;
            let object = world.object_mut("stop", kind, uuid)?;
            if !object.info.active {
                return Err(BackendError::new("stop", format!("{kind} is not active")));
            }
            object.info.active = false;
        }
        deliver(&self.world, lifecycle_signal(kind, uuid, false));
        Ok(())
    }

    fn set_autostart(&self, kind: ResourceType, uuid: &str, enabled: bool) -> BackendResult<()> {
        let mut world = self.enter("set_autostart")?;
        world.object_mut("set_autostart", kind, uuid)?.info.autostart = enabled;
        Ok(())
    }

    fn domain_action(&self, uuid: &str, action: DomainAction) -> BackendResult<()> {
        let event = {
            let mut world = self.enter("domain_action")?;
            let object = world.object_mut("domain_action", ResourceType::Domain, uuid)?;
            match action {
                DomainAction::Shutdown => {
                    object.info.active = false;
                    Some(DomainLifecycle::Shutdown)
                }
                DomainAction::Reboot => None,
                DomainAction::Suspend => Some(DomainLifecycle::Suspended),
                DomainAction::Resume => Some(DomainLifecycle::Resumed),
            }
        };
        if let Some(event) = event {
            deliver(
                &self.world,
                BackendSignal::Domain {
                    uuid: uuid.to_string(),
                    event,
                    detail: 0,
                },
            );
        }
        Ok(())
    }

    fn create_snapshot(&self, domain: &str, name: &str) -> BackendResult<()> {
        let mut world = self.enter("create_snapshot")?;
        let object = world.object_mut("create_snapshot", ResourceType::Domain, domain)?;
        if object.snapshots.iter().any(|s| s == name) {
            return Err(BackendError::new("create_snapshot", format!("snapshot '{name}' exists")));
        }
        object.snapshots.push(name.to_string());
        Ok(())
    }

    fn delete_snapshot(&self, domain: &str, name: &str) -> BackendResult<()> {
        let mut world = self.enter("delete_snapshot")?;
        let object = world.object_mut("delete_snapshot", ResourceType::Domain, domain)?;
        let before = object.snapshots.len();
        object.snapshots.retain(|s| s != name);
        if object.snapshots.len() == before {
            return Err(BackendError::new("delete_snapshot", format!("no snapshot '{name}'")));
        }
        Ok(())
    }

    fn refresh_pool(&self, pool: &str) -> BackendResult<()> {
        let world = self.enter("refresh_pool")?;
        world.object("refresh_pool", ResourceType::Pool, pool)?;
        Ok(())
    }

    fn list_volumes(&self, pool: &str) -> BackendResult<Vec<VolumeInfo>> {
        let world = self.enter("list_volumes")?;
        let object = world.object("list_volumes", ResourceType::Pool, pool)?;
        Ok(object.volumes.values().map(|v| v.info.clone()).collect())
    }

    fn create_volume(&self, pool: &str, xml: &str) -> BackendResult<VolumeInfo> {
        let mut world = self.enter("create_volume")?;
        let name = name_from_xml(xml)
            .ok_or_else(|| BackendError::new("create_volume", "definition has no <name>"))?
            .to_string();
        let object = world.object_mut("create_volume", ResourceType::Pool, pool)?;
        if object.volumes.contains_key(&name) {
            return Err(BackendError::new("create_volume", format!("volume '{name}' exists")));
        }
        let info = VolumeInfo {
            name: name.clone(),
            capacity: 0,
        };
        object.volumes.insert(
            name,
            SimVolume {
                info: info.clone(),
                data: Vec::new(),
            },
        );
        Ok(info)
    }

    fn delete_volume(&self, pool: &str, name: &str) -> BackendResult<()> {
        let mut world = self.enter("delete_volume")?;
        let object = world.object_mut("delete_volume", ResourceType::Pool, pool)?;
        object
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::new("delete_volume", format!("no volume '{name}'")))
    }

    fn open_volume_stream(&self, pool: &str, name: &str) -> BackendResult<Box<dyn VolumeStream>> {
        let world = self.enter("open_volume_stream")?;
        let object = world.object("open_volume_stream", ResourceType::Pool, pool)?;
        let volume = object
            .volumes
            .get(name)
            .ok_or_else(|| BackendError::new("open_volume_stream", format!("no volume '{name}'")))?;
        Ok(Box::new(SimVolumeStream {
            world: Arc::clone(&self.world),
            data: volume.data.clone(),
            pos: 0,
            chunk: world.stream_chunk,
        }))
    }

    fn set_secret_value(&self, uuid: &str, value: &[u8]) -> BackendResult<()> {
        let mut world = self.enter("set_secret_value")?;
        world.object_mut("set_secret_value", ResourceType::Secret, uuid)?.secret = Some(value.to_vec());
        Ok(())
    }
}

struct SimVolumeStream {
    world: Arc<Mutex<World>>,
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl VolumeStream for SimVolumeStream {
    fn read_chunk(&mut self, buf: &mut [u8]) -> BackendResult<usize> {
        let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn abort(self: Box<Self>) {
        lock(&self.world).calls.push("abort_volume_stream".to_string());
    }
}
