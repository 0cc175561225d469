//! App - the dispatch context and the primitives built on it.
//!
//! # Components
//! - **Dispatcher**: single consumer loop; owns every `!Send` callback
//! - **jobs**: Deferred Job Runner (`Dispatcher::run`, `Dispatcher::run_failable`)
//! - **RepeatingJob**: periodic schedule over the job runner
//! - **EventBus**: per-object subscriber registry

pub mod bus;
pub mod dispatch;
pub mod jobs;
pub mod repeating;

pub use self::bus::EventBus;
pub use self::dispatch::{DispatchClosed, DispatchHandle, Dispatcher, SignalSender, Timer};
pub use self::jobs::{JobResult, ensure_not_cancelled};
pub use self::repeating::{RepeatingJob, RepeatingState};
