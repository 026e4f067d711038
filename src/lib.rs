pub mod actors;
pub mod alerts;
pub mod api;
pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod metrics;
pub mod notify;
pub mod optimize;
pub mod pool;
pub mod probe;
pub mod report;
pub mod target;
pub mod util;

pub use error::{Error, Result};
