//! # Millwright Core
//!
//! Configuration and error types shared by the scheduler crate and the
//! `millwright` binary.

pub mod config;
pub mod error;

pub use config::{
    BrokerConfig, IntervalAnchor, MaintenanceWindowConfig, MillwrightConfig, RetryConfig,
    SchedulerConfig,
};
pub use error::{MillwrightError, Result};
