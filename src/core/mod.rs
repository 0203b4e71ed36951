//! Ambient pieces shared by every component: errors, configuration and the
//! run context.

pub mod config;
pub mod context;
pub mod error;

pub use config::ConnectivityConfig;
pub use context::RunContext;
pub use error::{Error, Result};
