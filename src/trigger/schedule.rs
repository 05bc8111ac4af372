//! Schedule trigger: submits a job at a fixed interval

use crate::error::TriggerError;
use crate::persistence::TriggerConfigStore;
use crate::trigger::{
    touch_last_checked, JobSubmitter, PipelineTriggerConfig, PipelineTriggerType, Watchers,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Type name used in trigger configurations
pub const SCHEDULE_TYPE: &str = "schedule";

/// Configuration of a schedule trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl ScheduleConfig {
    pub fn parse(value: &serde_json::Value) -> Result<Self, TriggerError> {
        let config: ScheduleConfig = serde_json::from_value(value.clone())
            .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        if config.interval_secs == 0 {
            return Err(TriggerError::InvalidConfig(
                "intervalSecs must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Fires on a timer
pub struct ScheduleTriggerType {
    submitter: Arc<dyn JobSubmitter>,
    store: Option<Arc<dyn TriggerConfigStore>>,
    watchers: Watchers,
}

impl ScheduleTriggerType {
    pub fn new(submitter: Arc<dyn JobSubmitter>) -> Self {
        Self {
            submitter,
            store: None,
            watchers: Watchers::new(),
        }
    }

    /// Record each tick as the trigger's `last_checked`
    pub fn with_store(mut self, store: Arc<dyn TriggerConfigStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait]
impl PipelineTriggerType for ScheduleTriggerType {
    fn name(&self) -> &str {
        SCHEDULE_TYPE
    }

    fn validate_config(&self, config: &PipelineTriggerConfig) -> Result<(), TriggerError> {
        ScheduleConfig::parse(&config.configuration).map(|_| ())
    }

    async fn start(&self, config: &PipelineTriggerConfig) -> Result<(), TriggerError> {
        let schedule = ScheduleConfig::parse(&config.configuration)?;
        let period = Duration::from_secs(schedule.interval_secs);

        let submitter = self.submitter.clone();
        let store = self.store.clone();
        let scheduled = config.clone();

        let spawned = self
            .watchers
            .start(config.id, move |token| async move {
                // First tick one period after start
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let description = scheduled
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("{} (scheduled)", scheduled.name));
                    let request = scheduled
                        .job_request(description)
                        .with_parameter("scheduledAt", Utc::now().to_rfc3339());
                    match submitter.submit_request(request).await {
                        Ok(guid) => info!("Trigger '{}' submitted job {}", scheduled.name, guid),
                        Err(e) => warn!("Trigger '{}' failed to submit a job: {}", scheduled.name, e),
                    }

                    if let Some(store) = &store {
                        touch_last_checked(store.as_ref(), &scheduled).await;
                    }
                }

                debug!("Stopped schedule for trigger '{}'", scheduled.name);
            })
            .await;

        if !spawned {
            debug!("Trigger '{}' is already running", config.name);
        }
        Ok(())
    }

    async fn stop(&self, config: &PipelineTriggerConfig) {
        if self.watchers.stop(config.id).await {
            info!("Stopped trigger '{}'", config.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let config = ScheduleConfig::parse(&serde_json::json!({ "intervalSecs": 60 })).unwrap();
        assert_eq!(config.interval_secs, 60);

        assert!(ScheduleConfig::parse(&serde_json::json!({ "intervalSecs": 0 })).is_err());
        assert!(ScheduleConfig::parse(&serde_json::json!({})).is_err());
    }
}
