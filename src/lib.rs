pub mod ca;
pub mod config;
pub mod config_reload;
pub mod constants;
pub mod domain;
pub mod error;
pub mod graceful_shutdown;
pub mod management;
pub mod metrics;
pub mod mitm;
pub mod plugins;
pub mod proxy;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use error::{FpsError, Result};
