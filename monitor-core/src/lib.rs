pub mod config;
pub mod db;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod logging;
pub mod models;
pub mod notify;
pub mod probe;
pub mod queue;
pub mod schedule;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
