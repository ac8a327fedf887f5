#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared plumbing for the subflow workspace.
//!
//! Holds the pieces every other crate needs: configuration structs with
//! environment loading, Postgres pool construction, the migrations runner,
//! and the plan-tier vocabulary.

pub mod config;
pub mod db;
pub mod plan;

pub use config::{AbuseConfig, AppConfig, BackfillConfig, ConfigError, TenantApiConfig};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use plan::PlanTier;
