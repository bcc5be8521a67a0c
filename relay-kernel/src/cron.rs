//! Scheduled junction starts and stops.
//!
//! Expressions are 5-field (`min hour dom mon dow`) or 6-field with a leading
//! seconds column. Times are evaluated in the host's local time zone.

use chrono::{DateTime, Local};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

const CHECK_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CronSchedule(cron::Schedule);

impl CronSchedule {
    pub fn parse(expr: &str) -> EngineResult<Self> {
        let expr = expr.trim();
        let normalized = match expr.split_whitespace().count() {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            n => {
                return Err(EngineError::bad_request(format!(
                    "cron expression '{expr}' has {n} fields, expected 5 or 6"
                )))
            }
        };
        cron::Schedule::from_str(&normalized)
            .map(Self)
            .map_err(|e| EngineError::bad_request(format!("invalid cron expression '{expr}': {e}")))
    }

    /// True when a fire time falls in `(after, until]`.
    pub fn fires_between(&self, after: DateTime<Local>, until: DateTime<Local>) -> bool {
        self.0.after(&after).next().is_some_and(|t| t <= until)
    }
}

fn parse_opt(expr: Option<&str>) -> Option<CronSchedule> {
    let expr = expr.filter(|e| !e.trim().is_empty())?;
    CronSchedule::parse(expr).ok()
}

/// Spawns the trigger loop. Start and stop are independent of manual control:
/// a manual stop does not suppress the next scheduled start.
pub fn spawn_cron(engine: Arc<Engine>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_EVERY);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = Local::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Local::now();
            for junction in engine.list_junctions() {
                if parse_opt(junction.cron_stop_expression.as_deref()).is_some_and(|s| s.fires_between(last, now)) {
                    tracing::info!("[cron] scheduled stop of '{}'", junction.name);
                    if let Err(e) = engine.stop(junction.id).await {
                        tracing::warn!("[cron] stop of '{}' failed: {e}", junction.name);
                    }
                }
                if parse_opt(junction.cron_expression.as_deref()).is_some_and(|s| s.fires_between(last, now)) {
                    tracing::info!("[cron] scheduled start of '{}'", junction.name);
                    if let Err(e) = engine.start(junction.id).await {
                        tracing::warn!("[cron] start of '{}' failed: {e}", junction.name);
                    }
                }
            }
            last = now;
        }
        tracing::debug!("[cron] trigger loop stopped");
    })
}
