//! Run registry.
//!
//! Owns every submitted run's controller, assigns identifiers, and answers
//! status, listing, cancellation, subscription, and purge requests. Runs are
//! independent: a controller only touches its own record.

use crate::controller::{CancelOutcome, ExecutionContext, RunController, Subscription};
use crate::notify::{Dispatcher, NotifyError};
use crate::ssh::SshManager;
use chrono::Utc;
use simrun_core::{Config, ListScope, RunDescriptor, RunId, RunRecord, RunState, RunSummary, ValidationError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid run descriptor: {0}")]
    Validation(#[from] ValidationError),
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("run {id} is still {state}")]
    StillActive { id: RunId, state: RunState },
    #[error("failed to set up notifications: {0}")]
    Setup(#[from] NotifyError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Arc<RunController>>>,
    ctx: Arc<ExecutionContext>,
    retention: Duration,
}

impl RunRegistry {
    pub fn new(ctx: Arc<ExecutionContext>, retention: Duration) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            ctx,
            retention,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let ssh = Arc::new(SshManager::from_config(config));
        let dispatcher = Dispatcher::from_config(config)?;
        let ctx = ExecutionContext::new(config, ssh, dispatcher);
        Ok(Self::new(Arc::new(ctx), config.retention()))
    }

    pub fn ssh(&self) -> &Arc<SshManager> {
        self.ctx.remote.ssh()
    }

    fn controller(&self, id: &RunId) -> Result<Arc<RunController>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    fn controllers(&self) -> Vec<Arc<RunController>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Validate and start a run. Returns as soon as the run is registered.
    pub fn submit(&self, descriptor: RunDescriptor) -> Result<RunId> {
        descriptor.validate()?;
        if !descriptor.target.is_remote() {
            descriptor.validate_local_paths()?;
        }

        let controller = {
            let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
            let mut id = RunId::new();
            while runs.contains_key(&id) {
                id = RunId::new();
            }
            let controller = Arc::new(RunController::new(
                id.clone(),
                descriptor,
                self.ctx.limits.record,
            ));
            runs.insert(id, Arc::clone(&controller));
            controller
        };

        let descriptor = controller.snapshot().descriptor;
        info!(
            run_id = %controller.id(),
            label = %descriptor.display_label(),
            location = %descriptor.target.summary(),
            command = %descriptor.executable.display_command(),
            "run submitted"
        );
        let id = controller.id().clone();
        tokio::spawn(controller.run(Arc::clone(&self.ctx)));
        Ok(id)
    }

    pub fn cancel(&self, id: &RunId) -> Result<CancelOutcome> {
        Ok(self.controller(id)?.request_cancel())
    }

    pub fn get_status(&self, id: &RunId) -> Result<RunRecord> {
        Ok(self.controller(id)?.snapshot())
    }

    /// Runs in `scope`, oldest first. Terminal runs past retention are hidden
    /// even before maintenance purges them.
    pub fn list_runs(&self, scope: ListScope) -> Vec<RunSummary> {
        let now = Utc::now();
        let mut runs: Vec<RunSummary> = self
            .controllers()
            .iter()
            .map(|c| c.summary())
            .filter(|s| scope.includes(s.state))
            .filter(|s| !self.expired(s.ended_at, now))
            .collect();
        runs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    pub fn subscribe(&self, id: &RunId) -> Result<Subscription> {
        Ok(self.controller(id)?.subscribe())
    }

    /// Wait for the run to reach a terminal state with notifications sent.
    pub async fn wait_for_completion(&self, id: &RunId) -> Result<RunRecord> {
        let controller = self.controller(id)?;
        Ok(controller.wait().await)
    }

    /// Remove a finished run. Active runs are refused.
    pub fn purge(&self, id: &RunId) -> Result<RunRecord> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let controller = runs.get(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if !controller.is_finished() {
            return Err(RegistryError::StillActive {
                id: id.clone(),
                state: controller.state(),
            });
        }
        let record = controller.snapshot();
        runs.remove(id);
        debug!(run_id = %id, "run purged");
        Ok(record)
    }

    /// Drop finished runs whose retention has elapsed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let before = runs.len();
        runs.retain(|_, c| !(c.is_finished() && self.expired(c.snapshot().ended_at, now)));
        let purged = before - runs.len();
        if purged > 0 {
            info!(purged, "purged expired runs");
        }
        purged
    }

    fn expired(&self, ended_at: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) -> bool {
        let Some(ended) = ended_at else {
            return false;
        };
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        now - ended > retention
    }

    /// Request cancellation of every active run and wait for them to finish.
    pub async fn cancel_all(&self) -> usize {
        let active: Vec<_> = self
            .controllers()
            .into_iter()
            .filter(|c| !c.is_finished())
            .collect();
        let count = active
            .iter()
            .filter(|c| c.request_cancel() == CancelOutcome::Requested)
            .count();
        for controller in &active {
            controller.wait().await;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::test_support::RecordingTransport;
    use crate::ssh::test_support::{fake_ssh, settings};
    use simrun_core::{ExecutableSpec, NotificationChannel, NotificationPreference, TriggerPolicy};

    fn registry(dir: &std::path::Path, retention: Duration) -> (RunRegistry, Arc<RecordingTransport>) {
        let script = fake_ssh(dir);
        let ssh = Arc::new(SshManager::new(settings(dir, &script)));
        let recorder = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(
            recorder.clone(),
            recorder.clone(),
            "Simulation run notification",
            Duration::from_secs(2),
        );
        let mut config = Config::default();
        config.cancel_grace_ms = 500;
        let ctx = ExecutionContext::new(&config, ssh, dispatcher);
        (RunRegistry::new(Arc::new(ctx), retention), recorder)
    }

    fn sh(dir: &std::path::Path, script: &str) -> RunDescriptor {
        RunDescriptor::local(ExecutableSpec::new("sh", ["-c", script]), dir)
    }

    #[tokio::test]
    async fn rejects_invalid_descriptor_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(dir.path(), Duration::from_secs(60));
        let err = registry
            .submit(RunDescriptor::local(ExecutableSpec::new("", ["x"]), dir.path()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
        let err = registry
            .submit(RunDescriptor::local(
                ExecutableSpec::new("echo", ["x"]),
                dir.path().join("missing"),
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(dir.path(), Duration::from_secs(60));
        let id = RunId::from_string("nope");
        assert!(matches!(registry.get_status(&id), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.cancel(&id), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.purge(&id), Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn lists_by_scope_and_purges_finished_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(dir.path(), Duration::from_secs(60));
        let done = registry.submit(sh(dir.path(), "exit 0")).unwrap();
        registry.wait_for_completion(&done).await.unwrap();
        let active = registry.submit(sh(dir.path(), "sleep 30")).unwrap();

        let active_ids: Vec<_> = registry.list_runs(ListScope::Active).into_iter().map(|s| s.id).collect();
        assert_eq!(active_ids, vec![active.clone()]);
        let terminal_ids: Vec<_> = registry.list_runs(ListScope::Terminal).into_iter().map(|s| s.id).collect();
        assert_eq!(terminal_ids, vec![done.clone()]);
        assert_eq!(registry.list_runs(ListScope::All).len(), 2);

        assert!(matches!(registry.purge(&active), Err(RegistryError::StillActive { .. })));
        let purged = registry.purge(&done).unwrap();
        assert_eq!(purged.state, RunState::Succeeded);
        assert!(matches!(registry.get_status(&done), Err(RegistryError::NotFound(_))));

        assert_eq!(registry.cancel_all().await, 1);
        assert_eq!(registry.get_status(&active).unwrap().state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn expired_runs_are_hidden_and_purged() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(dir.path(), Duration::ZERO);
        let id = registry.submit(sh(dir.path(), "true")).unwrap();
        registry.wait_for_completion(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.list_runs(ListScope::All).is_empty());
        assert_eq!(registry.purge_expired(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn notifies_each_channel_once() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, recorder) = registry(dir.path(), Duration::from_secs(60));
        let descriptor = sh(dir.path(), "exit 2").with_notification(NotificationPreference {
            channels: vec![
                NotificationChannel::Email("user@example.com".into()),
                NotificationChannel::Topic("sims".into()),
            ],
            trigger: TriggerPolicy::OnFailure,
        });
        let id = registry.submit(descriptor).unwrap();
        let record = registry.wait_for_completion(&id).await.unwrap();
        assert_eq!(record.state, RunState::Failed);
        assert_eq!(record.exit_code, Some(2));
        let mut sent = recorder.destinations();
        sent.sort();
        assert_eq!(sent, vec!["sims", "user@example.com"]);
    }
}
