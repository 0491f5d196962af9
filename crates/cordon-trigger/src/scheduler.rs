use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cordon_store::{Schedule, Store};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::request::{RunRequest, RunSubmitter, TriggerKind};
use crate::TriggerError;

/// Lease name shared by every scheduler instance.
const LEASE_NAME: &str = "cron-scheduler";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// How often due schedules are scanned.
  pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(10),
    }
  }
}

/// Leader-elected cron scheduler.
///
/// Every instance polls; only the lease holder fires. Submissions are
/// idempotent under `(schedule_id, firing_instant)`, so a lease handover
/// between scan and submit cannot double-start a run.
pub struct CronScheduler {
  store: Arc<dyn Store>,
  submitter: Arc<dyn RunSubmitter>,
  config: SchedulerConfig,
  instance_id: String,
}

impl CronScheduler {
  pub fn new(
    store: Arc<dyn Store>,
    submitter: Arc<dyn RunSubmitter>,
    config: SchedulerConfig,
  ) -> Self {
    Self {
      store,
      submitter,
      config,
      instance_id: Uuid::new_v4().to_string(),
    }
  }

  /// Run until cancelled.
  pub async fn run(&self, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(self.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        _ = cancel.cancelled() => {
          info!("cron scheduler stopping");
          return;
        }
      }

      if let Err(e) = self.tick(Utc::now()).await {
        error!(error = %e, "cron scheduler tick failed");
      }
    }
  }

  /// One scan: take the lease, fire due schedules, advance their cursors.
  pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), TriggerError> {
    let lease_until = now
      + chrono::Duration::from_std(self.config.poll_interval * 3).expect("interval fits");
    let leader = self
      .store
      .acquire_lease(LEASE_NAME, &self.instance_id, lease_until, now)
      .await?;
    if !leader {
      return Ok(());
    }

    for schedule in self.store.due_schedules(now).await? {
      if let Err(e) = self.fire(&schedule, now).await {
        // One broken schedule must not starve the others.
        warn!(schedule_id = %schedule.id, error = %e, "schedule firing failed");
      }
    }
    Ok(())
  }

  async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<(), TriggerError> {
    let firing_instant = schedule.next_fire_at;
    let request = RunRequest {
      workflow_id: schedule.workflow_id.clone(),
      tenant_id: schedule.tenant_id.clone(),
      kind: TriggerKind::Schedule,
      payload: serde_json::json!({
        "schedule_id": schedule.id,
        "fired_at": firing_instant,
      }),
      idempotency_key: Some(format!(
        "schedule:{}:{}",
        schedule.id,
        firing_instant.timestamp()
      )),
      max_in_flight: None,
      timeout_override: None,
    };

    let run_id = self.submitter.submit(request).await?;
    info!(schedule_id = %schedule.id, run_id = %run_id, "schedule fired");

    let next = next_fire(&schedule.cron, now)?;
    self.store.update_schedule_fire(&schedule.id, next).await?;
    Ok(())
  }
}

/// Next firing of a cron expression strictly after `after`.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, TriggerError> {
  let schedule = cron::Schedule::from_str(expression).map_err(|e| TriggerError::InvalidCron {
    expression: expression.to_string(),
    message: e.to_string(),
  })?;
  schedule
    .after(&after)
    .next()
    .ok_or_else(|| TriggerError::InvalidCron {
      expression: expression.to_string(),
      message: "no future firing time".to_string(),
    })
}
