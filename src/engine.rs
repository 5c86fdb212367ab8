//! Plan/apply engine.
//!
//! One engine drives an operation through its phases:
//! `Planning -> AwaitingApproval -> Applying -> Committed | Failed`, or
//! `Cancelled` when approval is refused or the run is interrupted. The
//! state lock is held from planning until the final commit and renewed on a
//! heartbeat while the run waits on approval or providers.

use async_trait::async_trait;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, OutputConfig, TopologyConfig};
use crate::error::{ConfigError, Result, TopoformError};
use crate::model::{Graph, Resource, build_graph};
use crate::outputs::{Output, compute_outputs};
use crate::planner::{
    ApplyReport, ChangeAction, ChangeSet, DEFAULT_PARALLELISM, DriftReport, PlanExecutor,
    plan_changes, refresh,
};
use crate::provider::ProviderAdapter;
use crate::state::{
    HistoryEntry, LOCK_EXPIRY_SECS, LockToken, Operation, StateSnapshot, StateStore,
    generate_holder_id,
};

/// Attempts at taking the lock and loading state when racing another run.
const LOCK_ATTEMPTS: u32 = 3;

/// Phase an operation is in, or ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Computing the change set.
    Planning,
    /// Waiting for the approver.
    AwaitingApproval,
    /// Executing changes.
    Applying,
    /// Every change succeeded and state is committed.
    Committed,
    /// Some change failed; partial progress is committed.
    Failed,
    /// Approval was refused or the run was interrupted.
    Cancelled,
}

/// Decides whether a change set may be applied.
#[async_trait]
pub trait Approver: Send + Sync {
    /// Returns true to proceed.
    async fn approve(&self, changes: &ChangeSet) -> Result<bool>;
}

/// Approver that always proceeds (`--auto-approve`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _changes: &ChangeSet) -> Result<bool> {
        Ok(true)
    }
}

/// The desired side of a run: graph, declared outputs and config hash.
#[derive(Debug, Clone)]
pub struct Desired {
    /// Resource graph.
    pub graph: Graph,
    /// Declared outputs.
    pub outputs: Vec<OutputConfig>,
    /// Hash of the configuration the graph came from.
    pub config_hash: String,
}

impl Desired {
    /// Builds the desired graph from a (variable-substituted) configuration.
    ///
    /// # Errors
    ///
    /// Returns a graph error for duplicate ids, dangling references or cycles.
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        let resources: Vec<Resource> = config.resources.iter().map(Resource::from_config).collect();
        Ok(Self {
            graph: build_graph(resources)?,
            outputs: config.outputs.clone(),
            config_hash: ConfigHasher::new().hash_config(config),
        })
    }

    /// Nothing desired; applying it destroys everything.
    ///
    /// # Errors
    ///
    /// Never fails in practice; graph construction of an empty set is total.
    pub fn empty() -> Result<Self> {
        Ok(Self {
            graph: build_graph(Vec::new())?,
            outputs: Vec::new(),
            config_hash: String::from("destroy"),
        })
    }
}

/// Result of `plan`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    /// The change set.
    pub changes: ChangeSet,
    /// Refresh results, when refresh ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
}

/// Result of `apply` or `destroy`.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// Terminal phase.
    pub phase: Phase,
    /// Applied change set.
    pub changes: ChangeSet,
    /// Refresh results, when refresh ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    /// Per-resource results.
    pub report: ApplyReport,
    /// Outputs after the run.
    pub outputs: Vec<Output>,
    /// Failure rendering declared outputs, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_error: Option<String>,
    /// State serial after the run.
    pub serial: u64,
}

impl ApplyOutcome {
    /// Returns true if the run committed every change.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.phase == Phase::Committed
    }
}

/// Drives plan, apply, destroy and drift runs for one environment.
pub struct Engine<S> {
    store: S,
    adapter: Arc<dyn ProviderAdapter>,
    holder: String,
    parallelism: usize,
    lock_timeout: Duration,
    heartbeat: Duration,
    refresh: bool,
    cancel: Arc<AtomicBool>,
}

impl<S: StateStore> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.store.backend_type())
            .field("provider", &self.adapter.kind())
            .field("holder", &self.holder)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl<S: StateStore> Engine<S> {
    /// Creates an engine.
    #[must_use]
    pub fn new(store: S, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            store,
            adapter,
            holder: generate_holder_id(),
            parallelism: DEFAULT_PARALLELISM,
            lock_timeout: Duration::from_secs(60),
            heartbeat: Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs() / 3),
            refresh: true,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the number of changes in flight.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets how long to wait for the state lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets how often a held lock is renewed.
    #[must_use]
    pub const fn with_lock_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Enables or disables refresh before planning.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Shares a cancellation flag, typically set on Ctrl-C.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the state store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Computes a change set.
    ///
    /// Without `lock` the plan is advisory: state is read without the lock
    /// and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or locked, or a refresh
    /// read fails.
    pub async fn plan(&self, desired: &Desired, lock: bool) -> Result<PlanOutcome> {
        info!("Phase: {}", Phase::Planning);
        if !lock {
            let snapshot = self.store.load().await?;
            return self.compute(desired, snapshot).await.map(|(changes, drift, _)| PlanOutcome {
                changes,
                drift,
            });
        }

        let (token, snapshot) = self.lock_and_load("plan").await?;
        let result = tokio::select! {
            result = self.compute(desired, snapshot) => result,
            never = self.keep_lock(&token) => match never {},
        };
        self.release(&token).await;
        let (changes, drift, _) = result?;
        Ok(PlanOutcome { changes, drift })
    }

    /// Refreshes every binding and reports drift without writing state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a read fails.
    pub async fn drift(&self, desired: &Desired) -> Result<DriftReport> {
        let mut snapshot = self.store.load().await?;
        self.check_provider(&snapshot)?;
        refresh(self.adapter.as_ref(), &desired.graph, &mut snapshot).await
    }

    /// Plans and applies the desired graph.
    ///
    /// With `saved`, the fresh plan must match it or the run stops with
    /// `PlanError::StalePlan` before any change.
    ///
    /// # Errors
    ///
    /// Returns an error for lock, state, validation and stale-plan failures.
    /// Provider failures of individual changes end in [`Phase::Failed`].
    pub async fn apply(
        &self,
        desired: &Desired,
        saved: Option<&ChangeSet>,
        approver: &dyn Approver,
    ) -> Result<ApplyOutcome> {
        self.run(desired, saved, approver, Operation::Apply).await
    }

    /// Destroys everything recorded in state.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::apply`].
    pub async fn destroy(&self, approver: &dyn Approver) -> Result<ApplyOutcome> {
        let desired = Desired::empty()?;
        self.run(&desired, None, approver, Operation::Destroy).await
    }

    /// Returns the outputs of the last successful apply.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn outputs(&self) -> Result<Vec<Output>> {
        Ok(self.store.load().await?.outputs)
    }

    async fn run(
        &self,
        desired: &Desired,
        saved: Option<&ChangeSet>,
        approver: &dyn Approver,
        operation: Operation,
    ) -> Result<ApplyOutcome> {
        info!("Phase: {}", Phase::Planning);
        let (token, snapshot) = self.lock_and_load(&operation.to_string()).await?;
        let result = tokio::select! {
            result = self.run_locked(desired, saved, approver, operation, snapshot, &token) => result,
            never = self.keep_lock(&token) => match never {},
        };
        self.release(&token).await;
        result
    }

    /// Renews the lock every heartbeat until the caller drops the future.
    ///
    /// A failed renewal is only logged; the next commit with the token
    /// reports the lost lock.
    async fn keep_lock(&self, token: &LockToken) -> Infallible {
        let mut ticker = tokio::time::interval(self.heartbeat.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.store.renew_lock(token).await {
                Ok(lock) => debug!("State lock renewed until {}", lock.expires_at),
                Err(e) => warn!("Failed to renew state lock: {e}"),
            }
        }
    }

    async fn run_locked(
        &self,
        desired: &Desired,
        saved: Option<&ChangeSet>,
        approver: &dyn Approver,
        operation: Operation,
        snapshot: StateSnapshot,
        token: &LockToken,
    ) -> Result<ApplyOutcome> {
        let (fresh, drift, mut snapshot) = self.compute(desired, snapshot).await?;
        let changes = match saved {
            Some(saved) => {
                saved.ensure_matches(&fresh)?;
                saved.clone()
            }
            None => fresh,
        };

        let unchanged = |phase: Phase, snapshot: &StateSnapshot| ApplyOutcome {
            phase,
            changes: changes.clone(),
            drift: drift.clone(),
            report: ApplyReport {
                change_set_id: changes.id.clone(),
                ..ApplyReport::default()
            },
            outputs: snapshot.outputs.clone(),
            output_error: None,
            serial: snapshot.serial,
        };

        if !changes.has_changes() {
            info!("No changes. Infrastructure matches the configuration.");
            return Ok(unchanged(Phase::Committed, &snapshot));
        }

        info!("Phase: {}", Phase::AwaitingApproval);
        if self.cancel.load(Ordering::SeqCst) || !approver.approve(&changes).await? {
            warn!("Apply not approved; nothing was changed");
            return Ok(unchanged(Phase::Cancelled, &snapshot));
        }

        info!("Phase: {}", Phase::Applying);
        let executor = PlanExecutor::new(Arc::clone(&self.adapter))
            .with_parallelism(self.parallelism)
            .with_cancel_flag(Arc::clone(&self.cancel));
        let report = executor
            .execute(&changes, &desired.graph, &mut snapshot, &self.store, token)
            .await?;

        let phase = if !report.failed.is_empty() || !report.blocked.is_empty() {
            Phase::Failed
        } else if !report.cancelled.is_empty() {
            Phase::Cancelled
        } else {
            Phase::Committed
        };

        let mut output_error = None;
        let mut phase = phase;
        if phase == Phase::Committed {
            match compute_outputs(&desired.outputs, &snapshot.bindings) {
                Ok(outputs) => snapshot.outputs = outputs,
                Err(e) => {
                    error!("Failed to render outputs: {e}");
                    output_error = Some(e.to_string());
                    phase = Phase::Failed;
                }
            }
        } else {
            debug!("Keeping previous outputs after a {phase} run");
        }

        snapshot.add_history(HistoryEntry::new(
            operation,
            &changes.id,
            report.succeeded.clone(),
            report.failed.iter().map(|f| f.resource_id.clone()).collect(),
        ));
        snapshot.serial = self.store.commit(&snapshot, token).await?;
        info!("Phase: {phase} (state serial {})", snapshot.serial);

        Ok(ApplyOutcome {
            phase,
            changes,
            drift,
            report,
            outputs: snapshot.outputs,
            output_error,
            serial: snapshot.serial,
        })
    }

    /// Refreshes (when enabled) and plans against a loaded snapshot.
    async fn compute(
        &self,
        desired: &Desired,
        mut snapshot: StateSnapshot,
    ) -> Result<(ChangeSet, Option<DriftReport>, StateSnapshot)> {
        self.check_provider(&snapshot)?;

        let drift = if self.refresh && !snapshot.bindings.is_empty() {
            let report = refresh(self.adapter.as_ref(), &desired.graph, &mut snapshot).await?;
            if report.has_drift() {
                warn!(
                    "Refresh found {} drifted and {} missing resource(s)",
                    report.drifted.len(),
                    report.missing.len()
                );
            }
            Some(report)
        } else {
            None
        };

        let drifted = drift.as_ref().map(DriftReport::drifted_ids).unwrap_or_default();
        let changes = plan_changes(&desired.graph, &snapshot, &drifted, &desired.config_hash);
        info!(
            "Plan {}: {} to create, {} to update, {} to destroy",
            changes.id,
            changes.count(ChangeAction::Create),
            changes.count(ChangeAction::Update),
            changes.count(ChangeAction::Destroy)
        );
        Ok((changes, drift, snapshot))
    }

    fn check_provider(&self, snapshot: &StateSnapshot) -> Result<()> {
        let configured = self.adapter.kind();
        match snapshot.provider {
            Some(recorded) if recorded != configured && !snapshot.bindings.is_empty() => {
                Err(TopoformError::Config(ConfigError::validation(
                    format!(
                        "state was applied with provider {recorded}, configuration uses {configured}; destroy it first"
                    ),
                    "provider.kind",
                )))
            }
            _ => Ok(()),
        }
    }

    /// Takes the lock and loads state, retrying races with another run.
    async fn lock_and_load(&self, operation: &str) -> Result<(LockToken, StateSnapshot)> {
        let mut attempt = 1;
        loop {
            let result = self.try_lock_and_load(operation).await;
            match result {
                Err(e) if e.is_retryable() && attempt < LOCK_ATTEMPTS => {
                    let delay = e.retry_delay_secs().unwrap_or(1);
                    warn!("{e}; retrying in {delay}s (attempt {attempt}/{LOCK_ATTEMPTS})");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_lock_and_load(&self, operation: &str) -> Result<(LockToken, StateSnapshot)> {
        let token = self
            .store
            .acquire_lock(&self.holder, operation, self.lock_timeout)
            .await?;
        match self.store.load().await {
            Ok(snapshot) => Ok((token, snapshot)),
            Err(e) => {
                self.release(&token).await;
                Err(e)
            }
        }
    }

    async fn release(&self, token: &LockToken) {
        if let Err(e) = self.store.release_lock(token).await {
            warn!("Failed to release state lock: {e}");
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting approval",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
