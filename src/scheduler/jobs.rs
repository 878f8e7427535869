use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::service::SchedulerError;
use crate::config::SchedulerConfig;

/// When the reset pass fires
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fixed period between firings
    Every(Duration),
    /// Cron expression (e.g., "0 0 0 * * *" for midnight) evaluated in `timezone`
    Cron {
        expression: String,
        timezone: chrono_tz::Tz,
    },
}

impl Trigger {
    /// Build the trigger from configuration. A cron expression wins over the interval.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        if let Some(expression) = config.cron.as_deref().filter(|c| !c.trim().is_empty()) {
            let timezone: chrono_tz::Tz = config
                .timezone
                .parse()
                .map_err(|_| SchedulerError::InvalidTimezone(config.timezone.clone()))?;

            // Validate cron expression by trying to parse it
            if tokio_cron_scheduler::Job::new_async(expression, |_, _| Box::pin(async {}))
                .is_err()
            {
                return Err(SchedulerError::InvalidCron(expression.to_string()));
            }

            return Ok(Self::Cron {
                expression: expression.to_string(),
                timezone,
            });
        }

        if config.interval_secs == 0 {
            return Err(SchedulerError::InvalidInterval);
        }
        Ok(Self::Every(Duration::from_secs(config.interval_secs)))
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(period) => write!(f, "every {}s", period.as_secs()),
            Self::Cron {
                expression,
                timezone,
            } => write!(f, "cron '{}' ({})", expression, timezone),
        }
    }
}

/// Outcome of one reset pass
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records created for users that had none
    pub provisioned: usize,
    /// Records whose window elapsed and were replenished
    pub reset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_secs: u64, cron: Option<&str>, timezone: &str) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            interval_secs,
            cron: cron.map(str::to_string),
            timezone: timezone.to_string(),
        }
    }

    #[test]
    fn test_interval_trigger() {
        let trigger = Trigger::from_config(&config(86400, None, "UTC")).unwrap();
        assert_eq!(trigger, Trigger::Every(Duration::from_secs(86400)));
        assert_eq!(trigger.to_string(), "every 86400s");
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            Trigger::from_config(&config(0, None, "UTC")),
            Err(SchedulerError::InvalidInterval)
        ));
    }

    #[test]
    fn test_cron_trigger() {
        let trigger =
            Trigger::from_config(&config(0, Some("0 0 0 * * *"), "Asia/Jakarta")).unwrap();
        assert!(matches!(trigger, Trigger::Cron { .. }));
        assert_eq!(trigger.to_string(), "cron '0 0 0 * * *' (Asia/Jakarta)");
    }

    #[test]
    fn test_blank_cron_falls_back_to_interval() {
        let trigger = Trigger::from_config(&config(60, Some("  "), "UTC")).unwrap();
        assert_eq!(trigger, Trigger::Every(Duration::from_secs(60)));
    }

    #[test]
    fn test_invalid_cron() {
        assert!(matches!(
            Trigger::from_config(&config(60, Some("not a cron"), "UTC")),
            Err(SchedulerError::InvalidCron(_))
        ));
    }

    #[test]
    fn test_invalid_timezone() {
        assert!(matches!(
            Trigger::from_config(&config(60, Some("0 0 0 * * *"), "Mars/Olympus")),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }
}
