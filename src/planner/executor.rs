//! Change set executor.
//!
//! Changes run concurrently up to a parallelism limit, each one starting
//! only after every change it depends on has succeeded. State is committed
//! after every finished change so an interrupted apply loses nothing that
//! reached the provider.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::diff::ChangeAction;
use super::plan::{Change, ChangeSet};
use crate::config::ConfigHasher;
use crate::error::{ApplyError, ErrorClass, ProviderError, Result, TopoformError};
use crate::model::interpolate::resolve_attributes;
use crate::model::{Graph, Resource};
use crate::provider::ProviderAdapter;
use crate::state::{LockToken, ProviderBinding, StateSnapshot, StateStore};

/// Default number of changes in flight.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executor for change sets.
pub struct PlanExecutor {
    adapter: Arc<dyn ProviderAdapter>,
    parallelism: usize,
    cancel: Arc<AtomicBool>,
    hasher: ConfigHasher,
}

/// A change that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChange {
    /// Resource id.
    pub resource_id: String,
    /// Attempted action.
    pub action: ChangeAction,
    /// Error class.
    pub class: ErrorClass,
    /// Error message.
    pub message: String,
}

/// Result of executing a change set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Change set that was executed.
    pub change_set_id: String,
    /// Resources changed successfully, in completion order.
    pub succeeded: Vec<String>,
    /// Resources whose change failed.
    pub failed: Vec<FailedChange>,
    /// Resources not attempted because a dependency failed.
    pub blocked: Vec<String>,
    /// Resources not attempted because the apply was cancelled.
    pub cancelled: Vec<String>,
}

impl ApplyReport {
    /// Returns true if every pending change succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.cancelled.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Cancelled,
}

/// What to write into state for a finished change.
#[derive(Debug)]
enum Record {
    Set(ProviderBinding),
    Remove,
    Keep,
}

#[derive(Debug)]
enum NodeResult {
    Succeeded,
    Failed(ErrorClass, String),
    Cancelled,
}

#[derive(Debug)]
struct NodeOutcome {
    resource_id: String,
    record: Record,
    result: NodeResult,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.adapter.kind())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates an executor with the default parallelism.
    #[must_use]
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            parallelism: DEFAULT_PARALLELISM,
            cancel: Arc::new(AtomicBool::new(false)),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the number of changes in flight, at least one.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Shares a cancellation flag; once set no further change starts.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes the pending changes of a change set.
    ///
    /// Failed changes block their dependents but not unrelated branches.
    /// The snapshot is committed through `store` after every finished change.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::CheckpointFailed`, carrying the outcomes seen so
    /// far, if a checkpoint commit fails; provider failures are reported in
    /// the [`ApplyReport`].
    pub async fn execute<S>(
        &self,
        changes: &ChangeSet,
        graph: &Graph,
        snapshot: &mut StateSnapshot,
        store: &S,
        token: &LockToken,
    ) -> Result<ApplyReport>
    where
        S: StateStore + ?Sized,
    {
        let pending: Vec<&Change> = changes.pending().collect();
        info!(
            "Applying {} change(s) with parallelism {}",
            pending.len(),
            self.parallelism
        );

        let mut report = ApplyReport {
            change_set_id: changes.id.clone(),
            ..ApplyReport::default()
        };
        let mut states: BTreeMap<&str, NodeState> = pending
            .iter()
            .map(|c| (c.resource_id.as_str(), NodeState::Pending))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();

        loop {
            let cancelled = self.cancel.load(Ordering::SeqCst);

            for change in &pending {
                let id = change.resource_id.as_str();
                if states.get(id) != Some(&NodeState::Pending) {
                    continue;
                }
                if cancelled {
                    states.insert(id, NodeState::Cancelled);
                    report.cancelled.push(id.to_string());
                    continue;
                }

                let deps: Vec<NodeState> = change
                    .depends_on
                    .iter()
                    .filter_map(|d| states.get(d.as_str()).copied())
                    .collect();
                if deps.iter().any(|s| matches!(s, NodeState::Failed | NodeState::Blocked)) {
                    warn!("Skipping {} of '{id}': a dependency failed", change.action);
                    states.insert(id, NodeState::Blocked);
                    report.blocked.push(id.to_string());
                    continue;
                }
                if deps.contains(&NodeState::Cancelled) {
                    states.insert(id, NodeState::Cancelled);
                    report.cancelled.push(id.to_string());
                    continue;
                }
                if !deps.iter().all(|s| *s == NodeState::Succeeded) {
                    continue;
                }

                match self.prepare(change, graph, snapshot) {
                    Ok(work) => {
                        debug!("Starting {} of '{id}'", change.action);
                        states.insert(id, NodeState::Running);
                        tasks.spawn(run(
                            work,
                            Arc::clone(&self.adapter),
                            Arc::clone(&semaphore),
                            Arc::clone(&self.cancel),
                        ));
                    }
                    Err(e) => {
                        error!("Cannot {} '{id}': {e}", change.action);
                        states.insert(id, NodeState::Failed);
                        report.failed.push(FailedChange {
                            resource_id: id.to_string(),
                            action: change.action,
                            class: ErrorClass::Validation,
                            message: e.to_string(),
                        });
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let outcome = joined.map_err(|e| TopoformError::internal(format!("apply task failed: {e}")))?;

            let id = outcome.resource_id.clone();
            let Some(change) = pending.iter().find(|c| c.resource_id == id) else {
                continue;
            };
            let state = self.record(change, graph, snapshot, outcome, &mut report);
            if let Some(slot) = states.get_mut(change.resource_id.as_str()) {
                *slot = state;
            }

            match store.commit(snapshot, token).await {
                Ok(serial) => snapshot.serial = serial,
                Err(e) => {
                    error!("Checkpoint after '{id}' failed: {e}");
                    self.cancel.store(true, Ordering::SeqCst);
                    while let Some(joined) = tasks.join_next().await {
                        let Ok(outcome) = joined else {
                            continue;
                        };
                        let Some(change) =
                            pending.iter().find(|c| c.resource_id == outcome.resource_id)
                        else {
                            continue;
                        };
                        let state = self.record(change, graph, snapshot, outcome, &mut report);
                        states.insert(change.resource_id.as_str(), state);
                    }
                    for change in &pending {
                        let id = change.resource_id.as_str();
                        if states.get(id) == Some(&NodeState::Pending) {
                            states.insert(id, NodeState::Cancelled);
                            report.cancelled.push(id.to_string());
                        }
                    }

                    match store.commit(snapshot, token).await {
                        Ok(serial) => snapshot.serial = serial,
                        Err(retry) => warn!("Final checkpoint failed as well: {retry}"),
                    }
                    return Err(ApplyError::CheckpointFailed {
                        report: Box::new(report),
                        source: Box::new(e),
                    }
                    .into());
                }
            }
        }

        // Nothing is running, so whatever is still pending waits on itself.
        for change in &pending {
            let id = change.resource_id.as_str();
            if states.get(id) != Some(&NodeState::Pending) {
                continue;
            }
            error!("Cannot {} '{id}': its dependencies form a cycle", change.action);
            states.insert(id, NodeState::Failed);
            report.failed.push(FailedChange {
                resource_id: id.to_string(),
                action: change.action,
                class: ErrorClass::Validation,
                message: format!(
                    "waits on a dependency cycle among {}",
                    change.depends_on.join(", ")
                ),
            });
        }

        info!(
            "Apply finished: {} succeeded, {} failed, {} blocked, {} cancelled",
            report.succeeded.len(),
            report.failed.len(),
            report.blocked.len(),
            report.cancelled.len()
        );
        Ok(report)
    }

    /// Resolves what a change needs before it is handed to a worker.
    fn prepare(
        &self,
        change: &Change,
        graph: &Graph,
        snapshot: &StateSnapshot,
    ) -> std::result::Result<Work, crate::error::GraphError> {
        let previous = snapshot.get(&change.resource_id).cloned();
        let desired = match (change.action, graph.get(&change.resource_id)) {
            (ChangeAction::Create | ChangeAction::Update, Some(resource)) => {
                let attributes =
                    resolve_attributes(&resource.id, &resource.attributes, &snapshot.bindings)?;
                Some(Resource {
                    attributes,
                    ..resource.clone()
                })
            }
            _ => None,
        };
        Ok(Work {
            resource_id: change.resource_id.clone(),
            action: change.action,
            replace: change.replace,
            previous,
            desired,
        })
    }

    /// Applies a finished change to the snapshot and the report.
    fn record(
        &self,
        change: &Change,
        graph: &Graph,
        snapshot: &mut StateSnapshot,
        outcome: NodeOutcome,
        report: &mut ApplyReport,
    ) -> NodeState {
        match outcome.record {
            Record::Set(mut binding) => {
                if let Some(resource) = graph.get(&change.resource_id) {
                    binding.config_hash = self.hasher.hash_resource(resource);
                    binding.references = resource.references.clone();
                }
                snapshot.provider = Some(self.adapter.kind());
                snapshot.set_binding(binding);
            }
            Record::Remove => {
                snapshot.remove_binding(&change.resource_id);
            }
            Record::Keep => {}
        }

        match outcome.result {
            NodeResult::Succeeded => {
                info!("{} of '{}' succeeded", change.action, change.resource_id);
                report.succeeded.push(outcome.resource_id);
                NodeState::Succeeded
            }
            NodeResult::Failed(class, message) => {
                error!("{} of '{}' failed: {message}", change.action, change.resource_id);
                report.failed.push(FailedChange {
                    resource_id: outcome.resource_id,
                    action: change.action,
                    class,
                    message,
                });
                NodeState::Failed
            }
            NodeResult::Cancelled => {
                report.cancelled.push(outcome.resource_id);
                NodeState::Cancelled
            }
        }
    }
}

/// Owned inputs of one change.
#[derive(Debug)]
struct Work {
    resource_id: String,
    action: ChangeAction,
    replace: bool,
    previous: Option<ProviderBinding>,
    desired: Option<Resource>,
}

async fn run(
    work: Work,
    adapter: Arc<dyn ProviderAdapter>,
    semaphore: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
) -> NodeOutcome {
    let resource_id = work.resource_id.clone();
    let action = work.action;

    let Ok(_permit) = semaphore.acquire_owned().await else {
        return NodeOutcome {
            resource_id,
            record: Record::Keep,
            result: NodeResult::Cancelled,
        };
    };
    if cancel.load(Ordering::SeqCst) {
        return NodeOutcome {
            resource_id,
            record: Record::Keep,
            result: NodeResult::Cancelled,
        };
    }

    let (record, outcome) = match tokio::spawn(perform(work, adapter)).await {
        Ok(done) => done,
        Err(e) => {
            let panicked = ApplyError::WorkerPanicked {
                resource: resource_id.clone(),
                message: e.to_string(),
            };
            warn!("{action} of '{resource_id}' aborted: {panicked}");
            return NodeOutcome {
                resource_id,
                record: Record::Keep,
                result: NodeResult::Failed(ErrorClass::Internal, panicked.to_string()),
            };
        }
    };

    let result = match outcome {
        Ok(()) => NodeResult::Succeeded,
        Err(e) => NodeResult::Failed(e.class(), e.to_string()),
    };
    NodeOutcome {
        resource_id,
        record,
        result,
    }
}

/// Performs one change against the provider.
async fn perform(
    work: Work,
    adapter: Arc<dyn ProviderAdapter>,
) -> (Record, std::result::Result<(), ProviderError>) {
    let Work {
        resource_id,
        action,
        replace,
        previous,
        desired,
    } = work;

    match action {
        ChangeAction::NoOp => (Record::Keep, Ok(())),
        ChangeAction::Destroy => match previous {
            None => (Record::Remove, Ok(())),
            Some(binding) => match adapter.destroy(&binding).await {
                Ok(()) => (Record::Remove, Ok(())),
                Err(e) => (Record::Keep, Err(e)),
            },
        },
        ChangeAction::Create | ChangeAction::Update => {
            let Some(resource) = desired else {
                return (
                    Record::Keep,
                    Err(ProviderError::InvalidResponse {
                        provider: adapter.kind(),
                        message: format!("'{resource_id}' is not in the configuration"),
                    }),
                );
            };

            let in_place = action == ChangeAction::Update && !replace;
            match previous {
                Some(binding) if in_place && binding.is_created() => {
                    match adapter.update(&binding, &resource).await {
                        Ok(updated) => (Record::Set(updated), Ok(())),
                        Err(e) => failed_create(e, Record::Keep),
                    }
                }
                Some(binding) if replace || binding.has_leftovers() || binding.is_created() => {
                    debug!("Removing existing objects of '{resource_id}' first");
                    if let Err(e) = adapter.destroy(&binding).await {
                        return (Record::Keep, Err(e));
                    }
                    match adapter.create(&resource).await {
                        Ok(created) => (Record::Set(created), Ok(())),
                        Err(e) => failed_create(e, Record::Remove),
                    }
                }
                _ => match adapter.create(&resource).await {
                    Ok(created) => (Record::Set(created), Ok(())),
                    Err(e) => failed_create(e, Record::Keep),
                },
            }
        }
    }
}

/// Keeps the objects a partly failed create left behind.
fn failed_create(
    error: ProviderError,
    otherwise: Record,
) -> (Record, std::result::Result<(), ProviderError>) {
    match error {
        ProviderError::PartialFailure {
            resource,
            binding,
            source,
        } => (
            Record::Set((*binding).clone()),
            Err(ProviderError::PartialFailure {
                resource,
                binding,
                source,
            }),
        ),
        other => (otherwise, Err(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::model::{ResourceKind, build_graph};
    use crate::planner::plan_changes;
    use crate::provider::{Aws, AwsAdapter, Fault, RetryPolicy, SimOp, SimulatedCloud};
    use crate::state::{BindingStatus, LocalStateStore, StateScope};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sim: Arc<SimulatedCloud>,
        store: LocalStateStore,
        token: LockToken,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalStateStore::new(dir.path(), StateScope::new("shop", "dev"));
        store.init().await.expect("init");
        let token = store
            .acquire_lock("test", "apply", Duration::from_secs(1))
            .await
            .expect("lock");
        Fixture {
            _dir: dir,
            sim: Arc::new(SimulatedCloud::new(ProviderKind::Aws, "eu-west-1")),
            store,
            token,
        }
    }

    impl Fixture {
        fn executor(&self) -> PlanExecutor {
            let adapter = AwsAdapter::new(Aws, self.sim.clone()).with_retry(RetryPolicy::immediate());
            PlanExecutor::new(Arc::new(adapter)).with_parallelism(2)
        }
    }

    fn topology() -> Graph {
        build_graph(vec![
            Resource::new("n1", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
            Resource::new("d1", ResourceKind::Database)
                .with_attribute("engine", "postgres")
                .depends_on("n1"),
            Resource::new("c1", ResourceKind::ComputeService)
                .with_attribute("image", "shop/api:1")
                .with_attribute("env", json!({"DB": "${d1.endpoint}"})),
            Resource::new("logs", ResourceKind::LogGroup).with_attribute("retention_days", 30),
        ])
        .expect("graph")
    }

    #[tokio::test]
    async fn test_creates_with_resolved_references() {
        let fx = fixture().await;
        let graph = topology();
        let mut snapshot = fx.store.load().await.expect("load");
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");

        let report = fx
            .executor()
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.succeeded.len(), 4);
        assert_eq!(snapshot.serial, 4);
        assert_eq!(snapshot.provider, Some(ProviderKind::Aws));
        assert_eq!(
            snapshot.bindings["c1"].references,
            [String::from("d1")].into_iter().collect::<BTreeSet<_>>()
        );

        let endpoint = snapshot.bindings["d1"].remote_attributes["endpoint"].clone();
        let objects = fx.sim.objects().await;
        let task = objects
            .iter()
            .find(|o| o.path == "ecs/task-definition")
            .expect("task definition");
        assert_eq!(task.attributes["env"]["DB"], endpoint);

        let stored = fx.store.load().await.expect("reload");
        assert_eq!(stored.bindings.len(), 4);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let fx = fixture().await;
        fx.sim.inject(Fault::on(SimOp::Create, "rds/")).await;
        let graph = topology();
        let mut snapshot = fx.store.load().await.expect("load");
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");

        let report = fx
            .executor()
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");

        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource_id, "d1");
        assert_eq!(report.failed[0].class, ErrorClass::Provider);
        assert_eq!(report.blocked, vec![String::from("c1")]);
        assert!(snapshot.bindings.contains_key("n1"));
        assert!(snapshot.bindings.contains_key("logs"));
        assert!(!snapshot.bindings.contains_key("d1"));
        assert!(!snapshot.bindings.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_partial_create_is_recorded() {
        let fx = fixture().await;
        fx.sim.inject(Fault::on(SimOp::Create, "rds/db-instance")).await;
        let graph = build_graph(vec![
            Resource::new("d1", ResourceKind::Database).with_attribute("subnet", "subnet-1"),
        ])
        .expect("graph");
        let mut snapshot = fx.store.load().await.expect("load");
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");

        let report = fx
            .executor()
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");

        assert_eq!(report.failed[0].class, ErrorClass::PartialFailure);
        let binding = &snapshot.bindings["d1"];
        assert_eq!(binding.status, BindingStatus::Partial);
        assert_eq!(binding.components.len(), 1);

        fx.sim.clear_faults().await;
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");
        assert!(changes.get("d1").is_some_and(|c| c.replace));
        let report = fx
            .executor()
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");
        assert!(report.is_success(), "{report:?}");
        assert!(snapshot.bindings["d1"].is_created());
        assert_eq!(fx.sim.objects().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_layout_change_drops_old_binding() {
        let fx = fixture().await;
        let plain = build_graph(vec![
            Resource::new("d1", ResourceKind::Database).with_attribute("engine", "postgres"),
        ])
        .expect("graph");
        let mut snapshot = fx.store.load().await.expect("load");
        let changes = plan_changes(&plain, &snapshot, &BTreeSet::new(), "h");
        fx.executor()
            .execute(&changes, &plain, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");
        assert!(snapshot.bindings["d1"].is_created());

        // Moving into a subnet adds a subnet group ahead of the instance.
        let in_subnet = build_graph(vec![
            Resource::new("d1", ResourceKind::Database)
                .with_attribute("engine", "postgres")
                .with_attribute("subnet", "subnet-1"),
        ])
        .expect("graph");
        fx.sim.inject(Fault::on(SimOp::Create, "rds/db-subnet-group")).await;
        let changes = plan_changes(&in_subnet, &snapshot, &BTreeSet::new(), "h");
        assert_eq!(changes.get("d1").expect("d1").action, ChangeAction::Update);

        let report = fx
            .executor()
            .execute(&changes, &in_subnet, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");

        assert_eq!(report.failed[0].resource_id, "d1");
        let binding = &fx.store.load().await.expect("reload").bindings["d1"];
        assert!(binding.remote_id.is_none());
        assert!(!binding.is_created());
        assert!(fx.sim.objects().await.is_empty());

        fx.sim.clear_faults().await;
        let changes = plan_changes(&in_subnet, &snapshot, &BTreeSet::new(), "h");
        assert_eq!(changes.get("d1").expect("d1").action, ChangeAction::Create);
    }

    #[tokio::test]
    async fn test_cyclic_recorded_references_fail_instead_of_vanishing() {
        let fx = fixture().await;
        let mut snapshot = fx.store.load().await.expect("load");
        for (id, other) in [("a", "b"), ("b", "a")] {
            let mut binding = ProviderBinding::new(id, ResourceKind::LogGroup, ProviderKind::Aws);
            binding.remote_id = Some(format!("{id}-000001"));
            binding.references.insert(String::from(other));
            snapshot.set_binding(binding);
        }
        let graph = build_graph(Vec::new()).expect("graph");
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");
        assert_eq!(changes.count(ChangeAction::Destroy), 2);

        let report = fx
            .executor()
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");

        assert!(!report.is_success());
        let mut failed: Vec<&str> = report.failed.iter().map(|f| f.resource_id.as_str()).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec!["a", "b"]);
        assert!(report.failed.iter().all(|f| f.class == ErrorClass::Validation));
        assert_eq!(snapshot.bindings.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture().await;
        let graph = topology();
        let mut snapshot = fx.store.load().await.expect("load");
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");

        let cancel = Arc::new(AtomicBool::new(true));
        let report = fx
            .executor()
            .with_cancel_flag(cancel)
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect("execute");

        assert_eq!(report.cancelled.len(), 4);
        assert!(snapshot.bindings.is_empty());
        assert!(fx.sim.objects().await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_lock_stops_apply() {
        let fx = fixture().await;
        let graph = topology();
        let mut snapshot = fx.store.load().await.expect("load");
        let changes = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");
        fx.store.force_unlock().await.expect("unlock");

        let err = fx
            .executor()
            .execute(&changes, &graph, &mut snapshot, &fx.store, &fx.token)
            .await
            .expect_err("commit must fail");
        assert_eq!(err.class(), ErrorClass::Conflict);

        // Changes that reached the provider stay visible after the failed commit.
        let TopoformError::Apply(ApplyError::CheckpointFailed { report, .. }) = err else {
            panic!("expected checkpoint failure, got {err:?}");
        };
        assert!(!report.succeeded.is_empty());
        assert_eq!(report.succeeded.len() + report.cancelled.len(), 4);
        assert!(report.cancelled.contains(&String::from("c1")));
        assert_eq!(snapshot.bindings.len(), report.succeeded.len());
        assert_eq!(fx.sim.objects().await.len(), report.succeeded.len());
    }
}
