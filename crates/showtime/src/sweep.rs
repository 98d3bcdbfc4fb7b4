//! Age-based cleanup of tracked environments.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{ShowtimeError, ShowtimeResult};
use crate::orchestrator::Environments;
use crate::show::parse_duration_token;

/// Options for a cleanup sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOptions {
    /// Report what would be deleted without deleting anything.
    pub dry_run: bool,
    /// Reference time for ages. Defaults to the current time.
    pub now: Option<DateTime<Utc>>,
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Services deleted, or eligible for deletion on a dry run.
    pub deleted: Vec<String>,
    /// Services whose deletion failed, with the error message.
    pub failed: Vec<(String, String)>,
    pub dry_run: bool,
}

impl SweepReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Parse an age such as `48h`, `2d`, `1w` or `90m`.
pub fn parse_age(raw: &str) -> ShowtimeResult<Duration> {
    let invalid = || ShowtimeError::InvalidAge(raw.to_string());
    let (amount, unit) = parse_duration_token(raw.trim()).ok_or_else(invalid)?;
    crate::show::Ttl::For { amount, unit }
        .duration()
        .ok_or_else(invalid)
}

/// Delete every tracked environment created more than `max_age` ago.
///
/// Failures are collected per service and never abort the sweep. Services
/// whose creation time is unknown are left alone.
pub async fn cleanup_older_than<E: Environments + ?Sized>(
    environments: &E,
    max_age: Duration,
    options: SweepOptions,
) -> ShowtimeResult<SweepReport> {
    let now = options.now.unwrap_or_else(Utc::now);
    let max_age = chrono::Duration::from_std(max_age)
        .map_err(|_| ShowtimeError::InvalidAge(format!("{}s", max_age.as_secs())))?;

    let mut report = SweepReport {
        dry_run: options.dry_run,
        ..SweepReport::default()
    };

    for environment in environments.list().await? {
        let Some(created_at) = environment.created_at else {
            debug!(service_name = %environment.service_name, "No creation time, skipping");
            continue;
        };
        if now - created_at <= max_age {
            continue;
        }

        if options.dry_run {
            info!(service_name = %environment.service_name, "Would delete expired environment");
            report.deleted.push(environment.service_name);
            continue;
        }

        match environments
            .delete(&environment.service_name, environment.pr_number)
            .await
        {
            Ok(()) => {
                info!(service_name = %environment.service_name, "Deleted expired environment");
                report.deleted.push(environment.service_name);
            }
            Err(e) => {
                warn!(
                    service_name = %environment.service_name,
                    error = %e,
                    "Failed to delete expired environment"
                );
                report
                    .failed
                    .push((environment.service_name, e.to_string()));
            }
        }
    }

    Ok(report)
}
