//! Time-based trigger driven by a cron expression

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ::cron::Schedule;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{TriggerDriver, TriggerHandle};
use crate::error::{AutomationError, AutomationResult};
use crate::sync::lock;

#[derive(Debug, Deserialize)]
pub(crate) struct CronOptions {
    expression: String,
    /// IANA zone name; UTC when absent
    #[serde(default)]
    timezone: Option<String>,
}

/// Fires on a cron schedule
///
/// Five-field expressions (minute resolution) are accepted and get a
/// leading seconds field of `0`.
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CronTrigger {
    pub(crate) fn new(options: CronOptions) -> AutomationResult<Self> {
        let expression = normalize(&options.expression);
        let schedule = Schedule::from_str(&expression).map_err(|e| {
            AutomationError::Config(format!(
                "invalid cron expression '{}': {}",
                options.expression, e
            ))
        })?;
        let timezone = match &options.timezone {
            Some(name) => name.parse::<Tz>().map_err(|e| {
                AutomationError::Config(format!("unknown timezone '{}': {}", name, e))
            })?,
            None => Tz::UTC,
        };

        Ok(Self {
            expression,
            schedule,
            timezone,
            task: Mutex::new(None),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First scheduled time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_after(&self.schedule, self.timezone, after)
    }
}

fn normalize(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

fn next_after(schedule: &Schedule, timezone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

#[async_trait]
impl TriggerDriver for CronTrigger {
    async fn on_start(&self, handle: TriggerHandle) -> AutomationResult<()> {
        let schedule = self.schedule.clone();
        let timezone = self.timezone;
        let expression = self.expression.clone();

        let task = tokio::spawn(async move {
            let mut after = Utc::now();
            while let Some(next) = next_after(&schedule, timezone, after) {
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                trace!(trigger = handle.trigger_id(), next = %next, "Waiting for schedule");
                tokio::time::sleep(wait).await;

                if let Err(e) = handle.fire(json!({ "scheduled": next.to_rfc3339() })) {
                    debug!(trigger = handle.trigger_id(), "Skipping scheduled firing: {}", e);
                }
                after = next;
            }
            debug!(trigger = handle.trigger_id(), expression = %expression, "Schedule exhausted");
        });

        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn on_stop(&self) -> AutomationResult<()> {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        Ok(())
    }
}
