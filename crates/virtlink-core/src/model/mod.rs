//! Model types (ids, state, events, settings).

pub mod events;
pub mod ids;
pub mod settings;
pub mod state;

pub use events::{
    ConnectionChange, DomainChange, DomainLifecycle, Event, EventCategory, EventKind,
    NetworkChange, NetworkLifecycle, PoolChange, PoolLifecycle, ResourceType, SecretChange,
    SecretLifecycle,
};
pub use ids::{ChannelId, JobId, SubscriptionId};
pub use settings::{ClientConfig, ConnectionRecord, ConnectionSettings, OverlapPolicy};
pub use state::ConnectionState;
