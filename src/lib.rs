#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
pub mod engine;
mod error;
pub mod events;
pub mod plugin;
pub mod project;
pub mod server;
pub mod services;
mod utils;

pub use crate::core::{Config, Context};
pub use crate::engine::{FailurePolicy, Task, TaskResult};
pub use crate::error::*;
pub use crate::events::{BuildEvent, EventBus, Subscription};
pub use crate::plugin::{Capability, Plugin, Registry};
pub use crate::project::{Dependency, Project, ProjectId, Scope};
pub use crate::server::Daemon;
pub use crate::services::Services;
pub use crate::utils::init_logging;
