pub mod attributes;
pub mod config;
pub mod control;
pub mod dht20;
pub mod dispatch;
pub mod display;
pub mod hal;
pub mod lcd;
pub mod session;
pub mod state;
pub mod tasks;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::RuntimeConfig;
pub use dispatch::{Dispatcher, Outbound};
pub use session::{CloudClient, CloudSession, Link, LinkError, SessionError};
pub use state::SharedState;
pub use tasks::{roster, TaskId, TaskSpec};
pub use topics::*;
