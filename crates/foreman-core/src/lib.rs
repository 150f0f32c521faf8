//! Shared domain types for the foreman task-queue orchestration service.
//!
//! Everything here is plain data: the persistent entities, the health and
//! alarm value types that flow between the engine's subsystems, the error
//! taxonomy, and the configuration model. The runtime lives in
//! `foreman-engine`.

mod config;
mod error;

pub mod alarm;
pub mod health;
pub mod model;

pub use self::config::{
    AlarmConfig, AlertConfig, ApiConfig, BrokerConfig, Config, DashboardConfig, DatabaseConfig,
    MonitorConfig,
};
pub use self::error::{Error, Result};
