use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conduit_core::config::ScheduleConfig;
use conduit_core::error::Result;
use conduit_engine::{GraphWalker, RunReport, Services};

use crate::event::TriggerEvent;

struct ScheduledFlow {
    name: String,
    schedule: Schedule,
    flow_id: String,
    input: Value,
}

/// Runs flows on cron schedules.
pub struct FlowScheduler {
    jobs: Vec<ScheduledFlow>,
    walker: Arc<GraphWalker>,
    services: Arc<Services>,
    cancel: CancellationToken,
}

impl FlowScheduler {
    pub fn new(
        schedules: &[ScheduleConfig],
        walker: Arc<GraphWalker>,
        services: Arc<Services>,
        cancel: CancellationToken,
    ) -> Self {
        let mut jobs = Vec::new();

        for config in schedules {
            match Schedule::from_str(&config.cron) {
                Ok(schedule) => {
                    jobs.push(ScheduledFlow {
                        name: config.name.clone(),
                        schedule,
                        flow_id: config.flow_id.clone(),
                        input: config.input.clone(),
                    });
                    info!(name = %config.name, cron = %config.cron, flow_id = %config.flow_id, "Schedule registered");
                }
                Err(e) => {
                    warn!(
                        name = %config.name,
                        cron = %config.cron,
                        error = %e,
                        "Invalid cron expression, skipping schedule"
                    );
                }
            }
        }

        Self {
            jobs,
            walker,
            services,
            cancel,
        }
    }

    /// Names of the schedules that parsed.
    pub fn jobs(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    /// Earliest upcoming fire time after `now`, with its schedule name.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, &str)> {
        self.jobs
            .iter()
            .filter_map(|job| job.schedule.after(&now).next().map(|at| (at, job.name.as_str())))
            .min_by_key(|(at, _)| *at)
    }

    /// Run the named schedule's flow once, now.
    pub async fn fire(&self, name: &str) -> Option<Result<RunReport>> {
        let job = self.jobs.iter().find(|j| j.name == name)?;
        Some(self.run_job(job).await)
    }

    async fn run_job(&self, job: &ScheduledFlow) -> Result<RunReport> {
        let event = TriggerEvent::Schedule {
            name: job.name.clone(),
            fired_at: Utc::now(),
            input: job.input.clone(),
        };
        self.walker
            .run_stored(
                &job.flow_id,
                event.payload(),
                self.services.clone(),
                self.cancel.child_token(),
            )
            .await
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        if self.jobs.is_empty() {
            info!("No schedules configured, scheduler idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.jobs.len(), "Flow scheduler started");

        loop {
            let now = Utc::now();
            let Some((fire_at, name)) = self.next_fire(now) else {
                // No schedule has an upcoming time.
                self.cancel.cancelled().await;
                break;
            };
            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));

            info!(
                schedule = %name,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next scheduled run"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!(schedule = %name, "Firing schedule");
                    match self.fire(name).await {
                        Some(Ok(report)) if report.succeeded() => {
                            info!(schedule = %name, execution_id = %report.execution_id, "Scheduled run completed")
                        }
                        Some(Ok(report)) => warn!(
                            schedule = %name,
                            execution_id = %report.execution_id,
                            status = ?report.status,
                            "Scheduled run did not complete"
                        ),
                        Some(Err(e)) => error!(schedule = %name, error = %e, "Scheduled run failed to start"),
                        None => {}
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Flow scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use conduit_core::store::InMemoryFlowStore;
    use conduit_test_utils::{services, test_registry, walker, FlowBuilder};
    use serde_json::json;

    fn schedule(name: &str, cron: &str, flow_id: &str) -> ScheduleConfig {
        ScheduleConfig {
            name: name.into(),
            cron: cron.into(),
            flow_id: flow_id.into(),
            input: json!({"source": "cron"}),
        }
    }

    fn scheduler(schedules: &[ScheduleConfig], store: InMemoryFlowStore, cancel: CancellationToken) -> FlowScheduler {
        FlowScheduler::new(schedules, walker(test_registry()), services(store), cancel)
    }

    #[test]
    fn invalid_cron_is_skipped() {
        let s = scheduler(
            &[schedule("ok", "0 0 3 * * *", "f"), schedule("bad", "every day", "f")],
            InMemoryFlowStore::new(),
            CancellationToken::new(),
        );
        assert_eq!(s.jobs(), vec!["ok"]);
    }

    #[test]
    fn next_fire_picks_earliest_schedule() {
        let s = scheduler(
            &[
                schedule("nightly", "0 0 3 * * *", "f"),
                schedule("hourly", "0 0 * * * *", "f"),
            ],
            InMemoryFlowStore::new(),
            CancellationToken::new(),
        );
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 0).unwrap();
        let (at, name) = s.next_fire(now).unwrap();
        assert_eq!(name, "hourly");
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn fire_runs_the_flow_with_schedule_payload() {
        let flow = FlowBuilder::new("cleanup")
            .node("start", "trigger:schedule", json!({}))
            .node("echo", "test:echo", json!({"output": "{{input.schedule}} from {{input.source}}"}))
            .edge("start", "echo")
            .build();
        let s = scheduler(
            &[schedule("nightly", "0 0 3 * * *", "cleanup")],
            InMemoryFlowStore::new().with_flow(flow),
            CancellationToken::new(),
        );

        let report = s.fire("nightly").await.unwrap().unwrap();
        assert!(report.succeeded());
        assert_eq!(report.output, json!("nightly from cron"));
        assert!(s.fire("unknown").await.is_none());
    }

    #[tokio::test]
    async fn missing_flow_is_an_error() {
        let s = scheduler(
            &[schedule("nightly", "0 0 3 * * *", "ghost")],
            InMemoryFlowStore::new(),
            CancellationToken::new(),
        );
        assert!(s.fire("nightly").await.unwrap().is_err());
    }

    #[tokio::test]
    async fn idle_scheduler_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let s = scheduler(&[], InMemoryFlowStore::new(), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), s.run())
            .await
            .expect("scheduler should stop");
    }
}
