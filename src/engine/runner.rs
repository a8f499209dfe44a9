mod diagnostics;
mod retry;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::ThreadPool;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::{Context, Outputs, Pass};
use crate::core::{Dynamic, TaskKey};
use crate::deletion::Deletion;
use crate::engine::{Action, Delta, Node, TaskNode};
use crate::error::{RunError, TaskError, TaskFailure};
use crate::graph::TaskGraph;
use crate::lifecycle::Lifecycle;
use crate::options::RunOptions;
use crate::target::Target;

pub use diagnostics::{RunReport, Summary, TaskExecution, TaskOutcome};

/// Runs a [`TaskGraph`] against one [`Target`].
///
/// The engine borrows the cloud handle and the target for the duration of
/// a run and holds no state of its own between runs.
pub struct Engine<'a, C> {
    cloud: &'a C,
    target: &'a dyn Target<C>,
}

/// Sent back by a worker when a node is done.
struct Completion {
    index: NodeIndex,
    result: Result<TaskOutcome, TaskError>,
    start: Instant,
    duration: Duration,
}

#[derive(Default)]
struct RunState {
    outcomes: HashMap<NodeIndex, TaskOutcome>,
    execution_times: HashMap<NodeIndex, TaskExecution>,
    failures: Vec<TaskFailure>,
}

impl<'a, C> Engine<'a, C>
where
    C: Send + Sync,
{
    pub fn new(cloud: &'a C, target: &'a dyn Target<C>) -> Self {
        Self { cloud, target }
    }

    /// Runs every task in the graph, dependencies first, on a pool of
    /// `options.max_workers` threads, then lets the target finish.
    ///
    /// A failed task fails every task that depends on it, transitively,
    /// without running them. Unrelated tasks keep going, unless the error is
    /// fatal, in which case running tasks drain and nothing new starts. The
    /// error lists every failed task.
    pub fn run_tasks(
        &self,
        graph: &TaskGraph<C>,
        options: &RunOptions,
    ) -> Result<RunReport, RunError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_workers.max(1))
            .thread_name(|i| format!("convergent-{i}"))
            .build()?;

        tracing::info!(
            target_name = self.target.name(),
            tasks = graph.len(),
            workers = options.max_workers.max(1),
            "running tasks"
        );

        let outputs = Outputs::default();
        let mut state = RunState::default();

        let all = graph.graph.node_indices().collect();
        self.run_pass(&pool, graph, &outputs, &all, Pass::Main, options, &mut state)?;

        if state.failures.is_empty() && options.patch_soft_references {
            let patch = patch_set(graph, &state);
            if !patch.is_empty() {
                tracing::info!(tasks = patch.len(), "patching soft references");
                self.run_pass(&pool, graph, &outputs, &patch, Pass::Patch, options, &mut state)?;
            }
        }

        if !state.failures.is_empty() {
            let mut failures = state.failures;
            failures.sort_by(|a, b| a.key.cmp(&b.key));
            return Err(RunError::TasksFailed(failures));
        }

        self.target.finish(graph)?;

        let report = RunReport {
            outcomes: state
                .outcomes
                .into_iter()
                .map(|(index, outcome)| (graph.graph[index].key(), outcome))
                .collect(),
            execution_times: state
                .execution_times
                .into_iter()
                .map(|(index, exec)| (graph.graph[index].key(), exec))
                .collect(),
        };

        tracing::info!("run complete: {}", report.summary());
        Ok(report)
    }

    /// Executes `nodes_to_run` as a parallel topological walk: a node is
    /// spawned the moment its last dependency in the set completes.
    #[allow(clippy::too_many_arguments)]
    fn run_pass(
        &self,
        pool: &ThreadPool,
        graph: &TaskGraph<C>,
        outputs: &Outputs,
        nodes_to_run: &HashSet<NodeIndex>,
        pass: Pass,
        options: &RunOptions,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        let g = &graph.graph;

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in g.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        // A dependency only counts if it's also in the set of nodes to run.
        let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
            .iter()
            .map(|&i| {
                (
                    i,
                    g.neighbors_directed(i, Direction::Incoming)
                        .filter(|dep| nodes_to_run.contains(dep))
                        .count(),
                )
            })
            .collect();

        let total_tasks = nodes_to_run.len();
        if total_tasks == 0 {
            return Ok(());
        }

        let root_span = tracing::span!(Level::INFO, "running_tasks", pass = ?pass);
        root_span.pb_set_length(total_tasks as u64);
        if let Some(style) = crate::utils::get_style_run() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_message(match pass {
            Pass::Main => "Reconciling tasks...",
            Pass::Patch => "Patching soft references...",
        });
        let _enter = root_span.enter();

        let mut settled = HashSet::new();
        let mut completed_tasks = 0;
        let mut in_flight = 0;
        let mut stopped = false;

        pool.in_place_scope(|s| {
            let (result_sender, result_receiver) = channel::<Completion>();

            let spawn_task = |index: NodeIndex| {
                let node = &g[index];
                let sender = result_sender.clone();

                s.spawn(move |_| {
                    let start = Instant::now();
                    let result = self.execute(node, outputs, pass, options);
                    // The receiver outlives every worker.
                    let _ = sender.send(Completion {
                        index,
                        result,
                        start,
                        duration: start.elapsed(),
                    });
                });
            };

            // Seed in topological order so runs are reproducible with one worker.
            for &index in graph.order() {
                if nodes_to_run.contains(&index) && dependency_counts[&index] == 0 {
                    spawn_task(index);
                    in_flight += 1;
                }
            }

            while completed_tasks < total_tasks {
                if in_flight == 0 {
                    if stopped {
                        break;
                    }
                    let mut remaining: Vec<_> = nodes_to_run
                        .iter()
                        .filter(|i| !settled.contains(*i))
                        .map(|&i| g[i].key())
                        .collect();
                    remaining.sort();
                    return Err(RunError::Stalled { remaining });
                }

                let Ok(Completion {
                    index,
                    result,
                    start,
                    duration,
                }) = result_receiver.recv()
                else {
                    break;
                };

                in_flight -= 1;
                completed_tasks += 1;
                settled.insert(index);
                root_span.pb_inc(1);
                state
                    .execution_times
                    .insert(index, TaskExecution { start, duration });

                match result {
                    Ok(outcome) => {
                        record_outcome(state, index, outcome, pass);

                        for &dependant in dependents.get(&index).into_iter().flatten() {
                            if let Some(count) = dependency_counts.get_mut(&dependant) {
                                *count -= 1;
                                if *count == 0 && !stopped && !settled.contains(&dependant) {
                                    spawn_task(dependant);
                                    in_flight += 1;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        let key = g[index].key();
                        tracing::error!(task = %key, "{error}");

                        if error.is_fatal() && !stopped {
                            tracing::warn!("fatal error in {key}, no new tasks will be started");
                            stopped = true;
                        }

                        // Everything downstream fails without running.
                        let mut stack = vec![index];
                        while let Some(failed) = stack.pop() {
                            for &dependant in dependents.get(&failed).into_iter().flatten() {
                                if nodes_to_run.contains(&dependant) && settled.insert(dependant) {
                                    completed_tasks += 1;
                                    root_span.pb_inc(1);
                                    state.failures.push(TaskFailure {
                                        key: g[dependant].key(),
                                        error: TaskError::DependencyFailed(g[failed].key()),
                                    });
                                    stack.push(dependant);
                                }
                            }
                        }

                        state.failures.push(TaskFailure { key, error });
                    }
                }
            }

            Ok(())
        })?;

        if stopped {
            for &index in nodes_to_run {
                if !settled.contains(&index) {
                    state.failures.push(TaskFailure {
                        key: g[index].key(),
                        error: TaskError::Aborted,
                    });
                }
            }
        }

        Ok(())
    }

    /// Runs one node on the current worker thread, retrying transient errors
    /// and turning panics into errors.
    fn execute(
        &self,
        node: &Node<C>,
        outputs: &Outputs,
        pass: Pass,
        options: &RunOptions,
    ) -> Result<TaskOutcome, TaskError> {
        let key = node.key();

        let span = tracing::span!(Level::INFO, "task", task = %key);
        if let Some(style) = crate::utils::get_style_task() {
            span.pb_set_style(&style);
        }
        span.pb_set_message(&format!("Running {}", node.label()));
        let _enter = span.enter();

        // Tasks only share the outputs table, which tolerates poisoning, so a
        // panicking task cannot leave anything half-written for the others.
        let result = catch_unwind(AssertUnwindSafe(|| {
            retry::with_retry(&key, options, || {
                let ctx = Context::new(
                    self.cloud,
                    &key,
                    self.target.name(),
                    self.target.check_existing(),
                    pass,
                    outputs,
                );
                match node {
                    Node::Task(task) => self.reconcile(&ctx, task, outputs),
                    Node::Delete(deletion) => self.delete(&ctx, deletion),
                }
            })
        }));

        match result {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };
                Err(TaskError::Panicked(msg))
            }
        }
    }

    /// One find, diff and render cycle under the task's lifecycle.
    fn reconcile(
        &self,
        ctx: &Context<'_, C>,
        node: &TaskNode<C>,
        outputs: &Outputs,
    ) -> Result<TaskOutcome, TaskError> {
        let task = node.task.as_ref();
        let key = ctx.key();
        let lifecycle = node.lifecycle;

        if lifecycle == Lifecycle::Ignore {
            tracing::debug!("lifecycle is Ignore, skipping");
            // Dependants may still need whatever the task declares.
            if let Ok(desired) = task.desired(ctx) {
                outputs.insert(key.clone(), desired);
            }
            return Ok(TaskOutcome::Skipped {
                reason: "lifecycle is Ignore".into(),
            });
        }

        let desired = task.desired(ctx)?;

        if !ctx.check_existing() && !lifecycle.allows_mutation() {
            tracing::debug!("target does not look up existing resources, skipping {lifecycle} task");
            outputs.insert(key.clone(), desired);
            return Ok(TaskOutcome::Skipped {
                reason: format!("{lifecycle} is not checked by the {} target", ctx.target()),
            });
        }

        let actual = if ctx.check_existing() {
            match task.find(ctx) {
                Ok(actual) => actual,
                Err(err)
                    if err.is_access_denied()
                        && lifecycle == Lifecycle::WarnIfInsufficientAccess =>
                {
                    return Ok(self.skip_denied(key, err, desired, outputs));
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        let delta = Delta::compute(
            key.clone(),
            task.to_value(&desired)?,
            actual.as_ref().map(|a| task.to_value(a)).transpose()?,
        );

        match lifecycle {
            Lifecycle::ExistsAndValidates => {
                let Some(actual) = actual else {
                    return Err(TaskError::RequiredResourceMissing(key.clone()));
                };
                if !delta.is_noop() {
                    return Err(TaskError::terminal(anyhow::anyhow!(
                        "lifecycle is ExistsAndValidates, but fields differ: {}",
                        delta.changed_fields().join(", ")
                    )));
                }
                outputs.insert(key.clone(), actual);
                Ok(TaskOutcome::Unchanged)
            }
            Lifecycle::ExistsAndWarnIfChanges => {
                let (output, outcome) = match actual {
                    None => {
                        let message = String::from("resource does not exist");
                        tracing::warn!(task = %key, "{message}, lifecycle forbids creating it");
                        (desired, TaskOutcome::Warned { message })
                    }
                    Some(actual) if !delta.is_noop() => {
                        let message =
                            format!("fields differ: {}", delta.changed_fields().join(", "));
                        tracing::warn!(task = %key, "{message}, lifecycle forbids changing them");
                        (actual, TaskOutcome::Warned { message })
                    }
                    Some(actual) => (actual, TaskOutcome::Unchanged),
                };
                outputs.insert(key.clone(), output);
                Ok(outcome)
            }
            _ => self.render(ctx, node, lifecycle, desired, actual, delta, outputs),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render(
        &self,
        ctx: &Context<'_, C>,
        node: &TaskNode<C>,
        lifecycle: Lifecycle,
        desired: Dynamic,
        actual: Option<Dynamic>,
        delta: Delta,
        outputs: &Outputs,
    ) -> Result<TaskOutcome, TaskError> {
        let task = node.task.as_ref();
        let key = ctx.key();

        if delta.is_noop() {
            tracing::debug!("no changes");
            outputs.insert(key.clone(), actual.unwrap_or(desired));
            return Ok(TaskOutcome::Unchanged);
        }

        task.check_changes(&desired, actual.as_ref(), &delta)?;

        tracing::debug!(action = ?delta.action, fields = ?delta.changed_fields(), "rendering");
        let rendered = match self
            .target
            .render(ctx, task, &desired, actual.as_ref(), &delta)
        {
            Ok(rendered) => rendered,
            Err(err)
                if err.is_access_denied() && lifecycle == Lifecycle::WarnIfInsufficientAccess =>
            {
                return Ok(self.skip_denied(key, err, actual.unwrap_or(desired), outputs));
            }
            Err(err) => return Err(err),
        };

        outputs.insert(key.clone(), rendered.or(actual).unwrap_or(desired));

        Ok(match delta.action {
            Action::Create => TaskOutcome::Created,
            Action::Update => TaskOutcome::Updated {
                fields: delta.changed_fields(),
            },
            Action::NoChange => TaskOutcome::Unchanged,
        })
    }

    fn delete(&self, ctx: &Context<'_, C>, deletion: &Deletion<C>) -> Result<TaskOutcome, TaskError> {
        if !ctx.check_existing() || !deletion.lifecycle().allows_mutation() {
            return Ok(TaskOutcome::Skipped {
                reason: "deletion is not applicable".into(),
            });
        }

        match self.target.delete(ctx, deletion) {
            Ok(()) => {
                tracing::info!(id = %deletion.resource().id, "deleted {}", deletion.key());
                Ok(TaskOutcome::Deleted)
            }
            Err(err)
                if err.is_access_denied()
                    && deletion.lifecycle() == Lifecycle::WarnIfInsufficientAccess =>
            {
                tracing::warn!(resource = %deletion.key(), "{err}, not deleting");
                Ok(TaskOutcome::Skipped {
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn skip_denied(
        &self,
        key: &TaskKey,
        err: TaskError,
        output: Dynamic,
        outputs: &Outputs,
    ) -> TaskOutcome {
        tracing::warn!(task = %key, "{err}, skipping");
        outputs.insert(key.clone(), output);
        TaskOutcome::Skipped {
            reason: err.to_string(),
        }
    }
}

/// Tasks that hold a soft reference and may render, after the main pass.
fn patch_set<C>(graph: &TaskGraph<C>, state: &RunState) -> HashSet<NodeIndex> {
    graph
        .soft_indices()
        .iter()
        .map(|&(dependant, _)| dependant)
        .filter(|index| graph.graph[*index].lifecycle().allows_mutation())
        .filter(|index| {
            !matches!(
                state.outcomes.get(index),
                None | Some(TaskOutcome::Skipped { .. })
            )
        })
        .collect()
}

/// A patch pass only overrides the main pass outcome with a change, and never
/// hides a creation.
fn record_outcome(state: &mut RunState, index: NodeIndex, outcome: TaskOutcome, pass: Pass) {
    if pass == Pass::Patch {
        match state.outcomes.get(&index) {
            Some(TaskOutcome::Created) => return,
            Some(_) if !outcome.is_change() => return,
            _ => {}
        }
    }
    state.outcomes.insert(index, outcome);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::blueprint::TaskMap;
    use crate::lifecycle::LifecycleOverrides;
    use crate::target::DirectTarget;
    use crate::testing::{
        Failure, FakeCloud, Instance, Mutation, SecurityGroup, Subnet, Vpc, mutation_keys,
    };

    fn options() -> RunOptions {
        RunOptions::default()
            .with_max_workers(4)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    fn run(cloud: &FakeCloud, map: TaskMap<FakeCloud>) -> Result<RunReport, RunError> {
        run_with(cloud, map, &options())
    }

    fn run_with(
        cloud: &FakeCloud,
        map: TaskMap<FakeCloud>,
        options: &RunOptions,
    ) -> Result<RunReport, RunError> {
        let graph = TaskGraph::build(map).unwrap();
        Engine::new(cloud, &DirectTarget).run_tasks(&graph, options)
    }

    fn stack() -> TaskMap<FakeCloud> {
        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
        map.add(Subnet::new("a", "10.0.1.0/24", "main")).unwrap();
        map.add(Instance::new("web", "a")).unwrap();
        map
    }

    fn key(kind: &'static str, name: &str) -> TaskKey {
        TaskKey::new(kind, name)
    }

    #[test]
    fn creates_a_fresh_stack_in_dependency_order() {
        let cloud = FakeCloud::default();
        let report = run(&cloud, stack()).unwrap();

        assert_eq!(
            cloud.mutations(),
            [
                Mutation::Create(key("vpc", "main")),
                Mutation::Create(key("subnet", "a")),
                Mutation::Create(key("instance", "web")),
            ]
        );
        assert_eq!(report.summary().created, 3);

        // The subnet was created with the id the VPC got from the cloud.
        let subnet = cloud.stored::<Subnet>(&key("subnet", "a")).unwrap();
        let vpc = cloud.stored::<Vpc>(&key("vpc", "main")).unwrap();
        assert_eq!(subnet.vpc_id, vpc.id);
        assert!(vpc.id.is_some());
    }

    #[test]
    fn second_run_changes_nothing() {
        let cloud = FakeCloud::default();
        run(&cloud, stack()).unwrap();
        let first = cloud.mutations().len();

        let report = run(&cloud, stack()).unwrap();
        assert_eq!(cloud.mutations().len(), first);
        assert_eq!(report.summary().changes(), 0);
        assert_eq!(report.summary().unchanged, 3);
    }

    #[test]
    fn second_run_keeps_soft_referenced_rules() {
        let groups = || {
            let mut map = TaskMap::new();
            map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
            map.add(SecurityGroup::new("masters", "main").allow_from("nodes"))
                .unwrap();
            map.add(SecurityGroup::new("nodes", "main").allow_from("masters"))
                .unwrap();
            map
        };
        // One worker, so a group always runs before its peer in the main pass.
        let options = options().with_max_workers(1);

        let cloud = FakeCloud::default();
        run_with(&cloud, groups(), &options).unwrap();
        let first = cloud.mutations().len();

        let report = run_with(&cloud, groups(), &options).unwrap();
        let second = cloud.mutations().split_off(first);
        assert!(second.is_empty(), "unexpected mutations: {second:?}");
        assert_eq!(report.summary().changes(), 0);

        let masters = cloud.stored::<SecurityGroup>(&key("security_group", "masters")).unwrap();
        let nodes = cloud.stored::<SecurityGroup>(&key("security_group", "nodes")).unwrap();
        assert_eq!(masters.peer_ids, Some(vec![nodes.id.unwrap()]));
    }

    #[test]
    fn updates_only_differing_fields() {
        let cloud = FakeCloud::default();
        run(&cloud, stack()).unwrap();

        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
        map.add(Subnet::new("a", "10.0.1.0/24", "main")).unwrap();
        map.add(Instance::new("web", "a").with_instance_type("m5.large"))
            .unwrap();
        let report = run(&cloud, map).unwrap();

        assert_eq!(
            report.outcome(&key("instance", "web")),
            Some(&TaskOutcome::Updated {
                fields: vec!["instance_type".into()]
            })
        );
        assert_eq!(
            cloud.mutations().last(),
            Some(&Mutation::Update(
                key("instance", "web"),
                vec!["instance_type".into()]
            ))
        );
    }

    #[test]
    fn failures_propagate_to_dependants_only() {
        let cloud = FakeCloud::default();
        cloud.fail(key("subnet", "a"), Failure::Terminal);

        let mut map = stack();
        map.add(Subnet::new("b", "10.0.2.0/24", "main")).unwrap();
        map.add(Instance::new("db", "b")).unwrap();

        let err = run(&cloud, map).unwrap_err();
        let failed: Vec<_> = err.failures().iter().map(|f| f.key.to_string()).collect();
        assert_eq!(failed, ["instance/web", "subnet/a"]);

        match &err.failures()[0].error {
            TaskError::DependencyFailed(dependency) => assert_eq!(*dependency, key("subnet", "a")),
            other => panic!("unexpected error {other}"),
        }

        // The dependant was never rendered; the sibling branch went through.
        let touched = mutation_keys(&cloud.mutations());
        assert!(!touched.contains(&key("instance", "web")));
        assert!(touched.contains(&key("instance", "db")));
    }

    #[test]
    fn fatal_errors_stop_new_work() {
        let cloud = FakeCloud::default();
        cloud.fail(key("vpc", "main"), Failure::Fatal);
        cloud.fail(key("vpc", "other"), Failure::Slow(Duration::from_millis(100)));

        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
        map.add(Subnet::new("a", "10.0.1.0/24", "main")).unwrap();
        map.add(Vpc::new("other", "10.1.0.0/16")).unwrap();
        map.add(Subnet::new("b", "10.1.1.0/24", "other")).unwrap();

        let err = run(&cloud, map).unwrap_err();
        let failures: BTreeMap<_, _> = err
            .failures()
            .iter()
            .map(|f| (f.key.to_string(), &f.error))
            .collect();

        assert_eq!(failures.len(), 3);
        assert!(matches!(failures["vpc/main"], TaskError::Fatal(_)));
        assert!(matches!(failures["subnet/a"], TaskError::DependencyFailed(_)));
        assert!(matches!(failures["subnet/b"], TaskError::Aborted));

        // The slow sibling was already running and was allowed to finish.
        assert_eq!(cloud.mutations(), [Mutation::Create(key("vpc", "other"))]);
    }

    #[test]
    fn transient_errors_are_retried() {
        let cloud = FakeCloud::default();
        cloud.fail(key("vpc", "main"), Failure::Transient { times: 2 });

        let report = run(&cloud, stack()).unwrap();
        assert_eq!(report.summary().created, 3);
    }

    #[test]
    fn exhausted_retries_fail_the_task() {
        let cloud = FakeCloud::default();
        cloud.fail(key("vpc", "main"), Failure::Transient { times: u32::MAX });

        let options = options().with_max_task_duration(Duration::from_millis(10));
        let err = run_with(&cloud, stack(), &options).unwrap_err();

        let vpc = err
            .failures()
            .iter()
            .find(|f| f.key == key("vpc", "main"))
            .unwrap();
        assert!(matches!(vpc.error, TaskError::RetriesExhausted { .. }));
        assert_eq!(err.failures().len(), 3);
    }

    #[test]
    fn panics_become_task_errors() {
        let cloud = FakeCloud::default();
        cloud.fail(key("subnet", "a"), Failure::Panic);

        let err = run(&cloud, stack()).unwrap_err();
        let subnet = err
            .failures()
            .iter()
            .find(|f| f.key == key("subnet", "a"))
            .unwrap();
        assert!(matches!(subnet.error, TaskError::Panicked(_)));
    }

    #[test]
    fn worker_count_does_not_change_the_result() {
        fn many() -> TaskMap<FakeCloud> {
            let mut map = TaskMap::new();
            for v in 0..3 {
                map.add(Vpc::new(format!("v{v}"), format!("10.{v}.0.0/16")))
                    .unwrap();
                for s in 0..4 {
                    let subnet = format!("v{v}-s{s}");
                    map.add(Subnet::new(&subnet, format!("10.{v}.{s}.0/24"), format!("v{v}")))
                        .unwrap();
                    map.add(Instance::new(format!("{subnet}-i"), &subnet)).unwrap();
                }
            }
            map
        }

        let serial = FakeCloud::default();
        run_with(&serial, many(), &options().with_max_workers(1)).unwrap();

        let parallel = FakeCloud::default();
        run_with(&parallel, many(), &options().with_max_workers(8)).unwrap();

        let sorted = |cloud: &FakeCloud| {
            let mut mutations = cloud.mutations();
            mutations.sort();
            mutations
        };
        assert_eq!(sorted(&serial).len(), 27);
        assert_eq!(sorted(&serial), sorted(&parallel));
        assert_eq!(serial.keys(), parallel.keys());
    }

    #[test]
    fn ignored_tasks_are_neither_found_nor_rendered() {
        let cloud = FakeCloud::default();
        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16").with_lifecycle(Lifecycle::Ignore))
            .unwrap();
        map.add(Subnet::new("a", "10.0.1.0/24", "main")).unwrap();

        let report = run(&cloud, map).unwrap();
        assert!(matches!(
            report.outcome(&key("vpc", "main")),
            Some(TaskOutcome::Skipped { .. })
        ));
        assert_eq!(cloud.finds(&key("vpc", "main")), 0);
        assert_eq!(cloud.mutations(), [Mutation::Create(key("subnet", "a"))]);
    }

    #[test]
    fn missing_required_resource_is_fatal() {
        let cloud = FakeCloud::default();
        let mut map = stack();
        map.apply_lifecycle_overrides(
            &LifecycleOverrides::new().with("vpc", Lifecycle::ExistsAndValidates),
        );

        let err = run(&cloud, map).unwrap_err();
        assert!(err.failures().iter().any(|f| {
            f.key == key("vpc", "main") && matches!(f.error, TaskError::RequiredResourceMissing(_))
        }));
        assert!(cloud.mutations().is_empty());
    }

    #[test]
    fn validated_resources_must_match() {
        let cloud = FakeCloud::default();
        cloud.seed(Vpc::new("main", "10.9.0.0/16").with_id("vpc-1"));

        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16").with_lifecycle(Lifecycle::ExistsAndValidates))
            .unwrap();

        let err = run(&cloud, map).unwrap_err();
        assert!(matches!(err.failures()[0].error, TaskError::Terminal(_)));
        assert!(cloud.mutations().is_empty());
    }

    #[test]
    fn immutable_fields_are_rejected_before_rendering() {
        let cloud = FakeCloud::default();
        cloud.seed(Vpc::new("main", "10.9.0.0/16").with_id("vpc-1"));

        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();

        let err = run(&cloud, map).unwrap_err();
        assert!(matches!(err.failures()[0].error, TaskError::Terminal(_)));
        assert!(cloud.mutations().is_empty());
    }

    #[test]
    fn warn_if_changes_never_mutates() {
        let cloud = FakeCloud::default();
        cloud.seed(Vpc::new("main", "10.9.0.0/16").with_id("vpc-1"));

        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16").with_lifecycle(Lifecycle::ExistsAndWarnIfChanges))
            .unwrap();
        map.add(Subnet::new("a", "10.9.1.0/24", "main")).unwrap();

        let report = run(&cloud, map).unwrap();
        assert!(matches!(
            report.outcome(&key("vpc", "main")),
            Some(TaskOutcome::Warned { .. })
        ));
        assert_eq!(cloud.mutations(), [Mutation::Create(key("subnet", "a"))]);

        // Dependants see the existing resource.
        let subnet = cloud.stored::<Subnet>(&key("subnet", "a")).unwrap();
        assert_eq!(subnet.vpc_id.as_deref(), Some("vpc-1"));
    }

    #[test]
    fn access_denied_is_a_warning_when_allowed() {
        let cloud = FakeCloud::default();
        cloud.fail(key("vpc", "main"), Failure::AccessDenied);

        let mut map = TaskMap::new();
        map.add(
            Vpc::new("main", "10.0.0.0/16").with_lifecycle(Lifecycle::WarnIfInsufficientAccess),
        )
        .unwrap();
        let report = run(&cloud, map).unwrap();
        assert!(matches!(
            report.outcome(&key("vpc", "main")),
            Some(TaskOutcome::Skipped { .. })
        ));

        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
        let err = run(&cloud, map).unwrap_err();
        assert!(err.failures()[0].error.is_access_denied());
    }

    #[test]
    fn soft_references_are_patched_in_a_second_pass() {
        let cloud = FakeCloud::default();
        let mut map = TaskMap::new();
        map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
        map.add(SecurityGroup::new("masters", "main").allow_from("nodes"))
            .unwrap();
        map.add(SecurityGroup::new("nodes", "main").allow_from("masters"))
            .unwrap();

        let report = run(&cloud, map).unwrap();
        let masters = cloud.stored::<SecurityGroup>(&key("security_group", "masters")).unwrap();
        let nodes = cloud.stored::<SecurityGroup>(&key("security_group", "nodes")).unwrap();

        assert_eq!(masters.peer_ids, Some(vec![nodes.id.clone().unwrap()]));
        assert_eq!(nodes.peer_ids, Some(vec![masters.id.clone().unwrap()]));

        // Created in the main pass; the patch does not hide that.
        assert_eq!(
            report.outcome(&key("security_group", "masters")),
            Some(&TaskOutcome::Created)
        );
    }

    #[test]
    fn mermaid_shows_outcomes_and_edges() {
        let cloud = FakeCloud::default();
        let graph = TaskGraph::build(stack()).unwrap();
        let report = Engine::new(&cloud, &DirectTarget)
            .run_tasks(&graph, &options())
            .unwrap();

        let mermaid = report.render_mermaid(&graph);
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("vpc/main\\ncreated"));
        assert!(mermaid.contains("fill:#90EE90"));
        assert_eq!(mermaid.matches(" --> ").count(), 2);
    }

    #[test]
    fn deletions_run_after_the_tasks_that_stop_using_them() {
        let cloud = FakeCloud::default();
        cloud.seed(Vpc::new("main", "10.0.0.0/16").with_id("vpc-1"));
        cloud.seed(
            Subnet::new("a", "10.0.1.0/24", "main")
                .with_id("subnet-1")
                .with_vpc_id("vpc-1"),
        );
        cloud.seed(
            Subnet::new("b", "10.0.2.0/24", "main")
                .with_id("subnet-2")
                .with_vpc_id("vpc-1"),
        );
        cloud.seed(Instance::new("web", "b").with_id("i-1").with_subnet_id("subnet-2"));

        let mut map = stack();
        cloud.register_inventories(&mut map);
        map.find_deletions(&cloud, &LifecycleOverrides::new()).unwrap();

        let report = run(&cloud, map).unwrap();
        assert_eq!(report.outcome(&key("subnet", "b")), Some(&TaskOutcome::Deleted));
        assert_eq!(
            cloud.mutations(),
            [
                Mutation::Update(key("instance", "web"), vec!["subnet".into(), "subnet_id".into()]),
                Mutation::Delete(key("subnet", "b")),
            ]
        );
        assert!(cloud.stored::<Vpc>(&key("vpc", "main")).is_some());
    }

    #[test]
    fn orphaned_dependants_are_deleted_before_their_dependencies() {
        for workers in [1, 4] {
            let cloud = FakeCloud::default();
            cloud.seed(Vpc::new("main", "10.0.0.0/16").with_id("vpc-1"));
            cloud.seed(Subnet::new("b", "10.0.2.0/24", "main").with_id("subnet-2"));
            cloud.seed(Instance::new("web", "b").with_id("i-1"));
            cloud.seed(Instance::new("db", "b").with_id("i-2"));

            let mut map = TaskMap::new();
            map.add(Vpc::new("main", "10.0.0.0/16")).unwrap();
            cloud.register_inventories(&mut map);
            assert_eq!(
                map.find_deletions(&cloud, &LifecycleOverrides::new()).unwrap(),
                3
            );

            run_with(&cloud, map, &options().with_max_workers(workers)).unwrap();

            let mutations = cloud.mutations();
            assert_eq!(mutations.len(), 3);
            let position = |m: Mutation| mutations.iter().position(|x| *x == m).unwrap();
            let subnet = position(Mutation::Delete(key("subnet", "b")));
            assert!(position(Mutation::Delete(key("instance", "web"))) < subnet);
            assert!(position(Mutation::Delete(key("instance", "db"))) < subnet);
            assert_eq!(cloud.keys(), [key("vpc", "main")]);
        }
    }
}
