use std::collections::HashSet;
use std::time::{Duration, Instant};

use petgraph::graph::{EdgeReference, NodeIndex};
use petgraph::visit::{Dfs, EdgeFiltered};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Edge, FailurePolicy, Schedule, TaskResult};
use crate::project::Project;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(Option<String>),
    /// Not run because an earlier task failed.
    Skipped,
}

/// What happened to every task of a schedule, in execution order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<(String, TaskOutcome)>,
    pub executions: Vec<(String, TaskExecution)>,
    pub success: bool,
}

impl RunReport {
    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == task)
            .map(|(_, outcome)| outcome)
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|(name, outcome)| {
            matches!(outcome, TaskOutcome::Failed(_)).then_some(name.as_str())
        })
    }
}

/// Runs the scheduled tasks strictly in order, one at a time.
///
/// Each task runs against the project it belongs to, looked up by id in
/// `projects`. A task whose project is missing fails. Failures are recorded,
/// never raised; `policy` decides which of the remaining tasks are skipped.
pub fn run(schedule: &Schedule, projects: &[Project], policy: FailurePolicy) -> RunReport {
    let total = schedule.len();
    let mut report = RunReport {
        success: true,
        ..RunReport::default()
    };

    if total == 0 {
        return report;
    }

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(&crate::utils::get_style_run());
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let mut doomed: HashSet<NodeIndex> = HashSet::new();
    let mut aborted = false;

    for (position, task) in schedule.tasks().iter().enumerate() {
        let node = NodeIndex::new(position);

        if aborted || doomed.contains(&node) {
            tracing::info!(task = %task.name, "skipped");
            report.outcomes.push((task.name.clone(), TaskOutcome::Skipped));
            root_span.pb_inc(1);
            continue;
        }

        let span = tracing::span!(Level::INFO, "task", name = %task.name, project = %task.project);
        let _task = span.enter();

        let start = Instant::now();
        let result = match projects.iter().find(|project| project.id == task.project) {
            Some(project) => task.execute(project),
            None => TaskResult::failed(format!("Unknown project '{}'", task.project)),
        };
        let duration = start.elapsed();

        report
            .executions
            .push((task.name.clone(), TaskExecution { start, duration }));

        if result.success {
            tracing::debug!(task = %task.name, ?duration, "succeeded");
            report.outcomes.push((task.name.clone(), TaskOutcome::Succeeded));
        } else {
            tracing::error!(
                task = %task.name,
                reason = result.message.as_deref().unwrap_or_default(),
                "failed"
            );
            report.success = false;
            report
                .outcomes
                .push((task.name.clone(), TaskOutcome::Failed(result.message)));

            match policy {
                FailurePolicy::ShortCircuit => aborted = true,
                FailurePolicy::SkipDependents => doomed.extend(dependents(schedule, node)),
            }
        }

        root_span.pb_inc(1);
    }

    report
}

/// Every task reachable from `node` through mandatory edges.
fn dependents(schedule: &Schedule, node: NodeIndex) -> Vec<NodeIndex> {
    let mandatory =
        EdgeFiltered::from_fn(schedule.graph(), |edge: EdgeReference<'_, Edge>| {
            edge.weight().is_mandatory()
        });

    let mut found = Vec::new();
    let mut dfs = Dfs::new(&mandatory, node);
    while let Some(next) = dfs.next(&mandatory) {
        if next != node {
            found.push(next);
        }
    }
    found
}
