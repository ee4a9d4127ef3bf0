use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument};

use crew_core::ids::GroupId;
use crew_store::fan_in::{CompletionRow, FanInGroupRow};
use crew_store::{CompletionOutcome, Database, FanInRepo};

use crate::error::FanInError;

/// The action started once every member of a group has reported.
#[async_trait]
pub trait DownstreamTrigger: Send + Sync {
    async fn trigger(&self, group: &FanInGroupRow, completions: &[CompletionRow]) -> Result<(), String>;
}

/// Trigger that only records the event in the log.
pub struct LoggingTrigger;

#[async_trait]
impl DownstreamTrigger for LoggingTrigger {
    async fn trigger(&self, group: &FanInGroupRow, completions: &[CompletionRow]) -> Result<(), String> {
        info!(group_id = %group.id, members = completions.len(), "fan-in group complete");
        Ok(())
    }
}

/// Collects member completions and starts the downstream action exactly once.
pub struct FanInGate {
    repo: FanInRepo,
    trigger: Arc<dyn DownstreamTrigger>,
}

impl FanInGate {
    pub fn new(db: Database, trigger: Arc<dyn DownstreamTrigger>) -> Self {
        Self {
            repo: FanInRepo::new(db),
            trigger,
        }
    }

    pub fn repo(&self) -> &FanInRepo {
        &self.repo
    }

    pub fn create_group(&self, expected_count: u32) -> Result<FanInGroupRow, FanInError> {
        Ok(self.repo.create_group(expected_count)?)
    }

    /// Record one member's completion. The caller whose write completes the
    /// group runs the trigger; a trigger failure is kept on the group and
    /// does not change the returned outcome.
    #[instrument(skip(self, payload), fields(group_id = %group_id, member_id = %member_id))]
    pub async fn record_completion(
        &self,
        group_id: &GroupId,
        member_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CompletionOutcome, FanInError> {
        let outcome = self.repo.record_completion(group_id, member_id, payload)?;
        if outcome.is_triggering_caller {
            if let Err(e) = self.fire(group_id).await {
                error!(error = %e, "downstream trigger failed");
                self.repo.record_trigger_error(group_id, &e)?;
            }
        }
        Ok(outcome)
    }

    /// Run the trigger again for a group whose members have all reported.
    /// Completions are read back, never re-recorded.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub async fn retry_trigger(&self, group_id: &GroupId) -> Result<(), FanInError> {
        let group = self.repo.get_group(group_id)?;
        let completions = self.repo.completions(group_id)?;
        if !self.repo.all_complete(group_id)? {
            return Err(FanInError::Incomplete {
                group_id: group_id.clone(),
                completed: completions.len(),
                expected: group.expected_count,
            });
        }
        if let Err(e) = self.trigger.trigger(&group, &completions).await {
            error!(error = %e, "downstream trigger failed on retry");
            self.repo.record_trigger_error(group_id, &e)?;
            return Err(FanInError::Trigger(e));
        }
        info!("downstream trigger retried");
        Ok(())
    }

    async fn fire(&self, group_id: &GroupId) -> Result<(), String> {
        let group = self.repo.get_group(group_id).map_err(|e| e.to_string())?;
        let completions = self.repo.completions(group_id).map_err(|e| e.to_string())?;
        self.trigger.trigger(&group, &completions).await
    }
}
