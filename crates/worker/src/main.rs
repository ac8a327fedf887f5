//! Subflow Background Worker
//!
//! Handles scheduled jobs including:
//! - Tenant assignment retry for users whose sync is pending (hourly at :15)
//! - Credential bind retry for users with a tenant (hourly at :45)
//! - Attempt ledger statistics and retention purge (daily at 2:00 UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! Invoked with an argument, runs a single maintenance command instead:
//! `retry-tenant-assignment`, `retry-credential-bind`, `backfill-legacy-users`,
//! or `manage-attempts`. Options come from `BACKFILL_*` and `ATTEMPT_*`
//! environment variables; `manage-attempts` needs only `DATABASE_URL`.

use std::sync::Arc;
use std::time::Duration;

use subflow_identity::{
    AttemptAdmin, AttemptFilter, BackfillOptions, IdentityService, OP_BACKFILL_LEGACY_USERS,
    OP_RETRY_CREDENTIAL_BIND, OP_RETRY_TENANT_ASSIGNMENT, PgAttemptLedger,
};
use subflow_shared::{create_migration_pool, create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Read the database URL, failing fast when unset.
fn database_url() -> String {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set")
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
        .unwrap_or(false)
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn backfill_options_from_env() -> BackfillOptions {
    BackfillOptions {
        limit: env_i64("BACKFILL_LIMIT"),
        email: env_string("BACKFILL_EMAIL"),
        dry_run: env_flag("BACKFILL_DRY_RUN"),
        skip_password_check: env_flag("BACKFILL_SKIP_PASSWORD_CHECK"),
    }
}

const MANAGE_ATTEMPTS: &str = "manage-attempts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OneShotCommand {
    Backfill,
    ManageAttempts,
}

/// Route a one-shot command to the service it needs. Backfill commands
/// call the tenant directory and need the full identity service; attempt
/// administration touches only the ledger and runs with `DATABASE_URL`
/// alone.
fn classify_command(command: &str) -> Option<OneShotCommand> {
    match command {
        OP_RETRY_TENANT_ASSIGNMENT | OP_RETRY_CREDENTIAL_BIND | OP_BACKFILL_LEGACY_USERS => {
            Some(OneShotCommand::Backfill)
        }
        MANAGE_ATTEMPTS => Some(OneShotCommand::ManageAttempts),
        _ => None,
    }
}

/// Run a single backfill command with env-sourced options.
async fn run_backfill_command(identity: &IdentityService, command: &str) -> anyhow::Result<()> {
    let options = backfill_options_from_env();
    match command {
        OP_RETRY_TENANT_ASSIGNMENT => {
            identity.backfill.retry_tenant_assignment(&options).await?;
        }
        OP_RETRY_CREDENTIAL_BIND => {
            identity.backfill.retry_credential_bind(&options).await?;
        }
        OP_BACKFILL_LEGACY_USERS => {
            identity.backfill.backfill_legacy_users(&options).await?;
        }
        other => anyhow::bail!("unknown backfill command: {other}"),
    }
    Ok(())
}

/// Attempt ledger administration driven by `ATTEMPT_*` environment variables.
async fn manage_attempts(admin: &AttemptAdmin) -> anyhow::Result<()> {
    let filter = AttemptFilter {
        ip: env_string("ATTEMPT_IP"),
        email: env_string("ATTEMPT_EMAIL"),
        days: env_i64("ATTEMPT_DAYS"),
        limit: env_i64("ATTEMPT_LIMIT"),
    };
    let action = env_string("ATTEMPT_ACTION").unwrap_or_else(|| "stats".to_string());

    match action.as_str() {
        "list" => {
            let attempts = admin.list(&filter).await?;
            for attempt in &attempts {
                info!(
                    id = %attempt.id,
                    ip = %attempt.ip_address,
                    email = ?attempt.email,
                    device = %attempt.device_signature,
                    blocked = attempt.blocked,
                    created_at = %attempt.created_at,
                    "Attempt"
                );
            }
            info!(total = attempts.len(), "Attempt list complete");
        }
        "unblock" => {
            let cleared = admin.unblock(&filter).await?;
            info!(cleared = cleared, "Unblock complete");
        }
        "stats" => {
            let stats = admin.stats(&filter).await?;
            info!(
                total_attempts = stats.total_attempts,
                blocked_attempts = stats.blocked_attempts,
                distinct_ips = stats.distinct_ips,
                distinct_emails = stats.distinct_emails,
                distinct_devices = stats.distinct_devices,
                "Attempt stats"
            );
        }
        "purge" => {
            let days = env_i64("ATTEMPT_RETENTION_DAYS").unwrap_or(180);
            let purged = admin.purge_older_than(days).await?;
            info!(purged = purged, days = days, "Attempt purge complete");
        }
        other => anyhow::bail!("unknown attempt action: {other}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Subflow Worker");

    let database_url = database_url();

    if env_flag("RUN_MIGRATIONS") {
        let migration_pool = create_migration_pool(&database_url).await?;
        run_migrations(&migration_pool).await?;
        info!("Database migrations applied");
    }

    let pool: sqlx::PgPool = create_pool(&database_url).await?;

    // One-shot maintenance command
    if let Some(command) = std::env::args().nth(1) {
        match classify_command(&command) {
            Some(OneShotCommand::ManageAttempts) => {
                // Ledger administration must not require tenant API settings
                let admin = AttemptAdmin::new(Arc::new(PgAttemptLedger::new(pool)));
                manage_attempts(&admin).await?;
            }
            Some(OneShotCommand::Backfill) => {
                let identity = IdentityService::from_env(pool)?;
                run_backfill_command(&identity, &command).await?;
            }
            None => anyhow::bail!("unknown command: {command}"),
        }
        return Ok(());
    }

    // Create identity service
    let identity = match IdentityService::from_env(pool) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            // If the tenant API isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create identity service - running in minimal mode");
            info!("Worker running without tenant synchronization");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry tenant assignment for users whose sync is pending (hourly)
    // Cron: at minute 15 of every hour, offset from the bind retry below
    let tenant_identity = identity.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let identity = tenant_identity.clone();
            Box::pin(async move {
                info!("Running scheduled tenant assignment retry");
                let options = BackfillOptions::default();
                if let Err(e) = identity.backfill.retry_tenant_assignment(&options).await {
                    error!(error = %e, "Tenant assignment retry failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Tenant assignment retry (hourly at :15)");

    // Job 2: Retry the credential bind for users that already have a tenant
    let bind_identity = identity.clone();
    scheduler
        .add(Job::new_async("0 45 * * * *", move |_uuid, _l| {
            let identity = bind_identity.clone();
            Box::pin(async move {
                info!("Running scheduled credential bind retry");
                let options = BackfillOptions::default();
                if let Err(e) = identity.backfill.retry_credential_bind(&options).await {
                    error!(error = %e, "Credential bind retry failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Credential bind retry (hourly at :45)");

    // Job 3: Attempt ledger maintenance (daily at 2:00 UTC)
    // Logs last-day stats and purges old rows when a retention is configured
    let maintenance_identity = identity.clone();
    let retention_days = env_i64("ATTEMPT_RETENTION_DAYS");
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let identity = maintenance_identity.clone();
            Box::pin(async move {
                info!("Running attempt ledger maintenance");

                let filter = AttemptFilter {
                    days: Some(1),
                    ..Default::default()
                };
                match identity.admin.stats(&filter).await {
                    Ok(stats) => info!(
                        total_attempts = stats.total_attempts,
                        blocked_attempts = stats.blocked_attempts,
                        distinct_ips = stats.distinct_ips,
                        distinct_emails = stats.distinct_emails,
                        distinct_devices = stats.distinct_devices,
                        "Attempt stats for the last day"
                    ),
                    Err(e) => error!(error = %e, "Attempt stats query failed"),
                }

                if let Some(days) = retention_days {
                    match identity.admin.purge_older_than(days).await {
                        Ok(purged) => {
                            info!(purged = purged, days = days, "Purged expired attempt records");
                        }
                        Err(e) => error!(error = %e, "Attempt purge failed"),
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Attempt ledger maintenance (daily at 2:00 UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Subflow Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
