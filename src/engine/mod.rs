//! Scheduler engine: discovery, dispatch and the control loop around them.

pub mod context;
pub mod control;
pub mod discovery;
pub mod dispatch;

pub use context::SchedulerContext;
pub use control::{ControlPlane, SchedulerConfig};
pub use discovery::discover;
pub use dispatch::Dispatcher;
