//! Named build steps and the rules that order them.
//!
//! A [`Task`] declares four ordering relations by name:
//!
//! * `depends_on`: hard prerequisites, pulled into the run and required to
//!   succeed first.
//! * `reverse_depends_on`: the same edge declared from the other side. The
//!   task makes itself a prerequisite of the named tasks, which lets a plugin
//!   splice a step in front of `compile` without `compile` knowing about it.
//! * `run_after`: soft ordering, honoured only when both tasks are scheduled.
//! * `always_run_after`: soft ordering whose edge is always materialized in
//!   the graph; it still never pulls a task into the run.
//!
//! [`schedule`] expands the requested names through the two mandatory
//! relations, orders the result and rejects cycles. [`run`] executes the
//! order one task at a time.

mod graph;
mod runner;

use std::fmt::Debug;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::Context;
use crate::error::GraphError;
use crate::plugin::ClasspathEntry;
use crate::project::{Dependency, Project, ProjectId, Scope};
use crate::services::CompilerAction;

pub use crate::engine::graph::{Edge, Schedule, schedule};
pub use crate::engine::runner::{RunReport, TaskExecution, TaskOutcome, run};

/// Name of the task plugins hook their code generation in front of.
pub const COMPILE: &str = "compile";

/// Pass/fail result of a task action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub success: bool,
    pub message: Option<String>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// What happens to the rest of a run after a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Every task after the failed one is skipped.
    #[default]
    ShortCircuit,
    /// Only tasks that depend on the failed one, directly or transitively,
    /// are skipped. Independent branches keep running.
    SkipDependents,
}

type TaskAction = Arc<dyn Fn(&Project) -> TaskResult + Send + Sync>;

#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub description: String,
    pub group: String,
    pub project: ProjectId,
    /// Name of the plugin that contributed the task, if any.
    pub plugin: Option<String>,
    pub depends_on: Vec<String>,
    pub reverse_depends_on: Vec<String>,
    pub run_after: Vec<String>,
    pub always_run_after: Vec<String>,
    action: TaskAction,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, project: ProjectId, action: F) -> Self
    where
        F: Fn(&Project) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            group: String::from("build"),
            project,
            plugin: None,
            depends_on: Vec::new(),
            reverse_depends_on: Vec::new(),
            run_after: Vec::new(),
            always_run_after: Vec::new(),
            action: Arc::new(action),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn depends_on(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn reverse_depends_on(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.reverse_depends_on
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn run_after(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.run_after.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn always_run_after(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.always_run_after
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Runs the action. A panicking action is reported as a failed result.
    pub fn execute(&self, project: &Project) -> TaskResult {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.action)(project))) {
            Ok(result) => result,
            Err(panic) => TaskResult::failed(format!(
                "Task panicked: {}",
                crate::utils::panic_message(panic.as_ref())
            )),
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("project", &self.project)
            .field("depends_on", &self.depends_on)
            .field("reverse_depends_on", &self.reverse_depends_on)
            .field("run_after", &self.run_after)
            .field("always_run_after", &self.always_run_after)
            .finish_non_exhaustive()
    }
}

/// Merges the tasks contributed by plugins for `project` into `tasks`,
/// schedules `requested` and runs the result with the configured failure
/// policy.
pub fn build(
    ctx: &Context,
    project: &Project,
    tasks: Vec<Task>,
    requested: &[&str],
) -> Result<RunReport, GraphError> {
    let mut all: Vec<Arc<Task>> = tasks.into_iter().map(Arc::new).collect();
    all.extend(ctx.registry.tasks_for(project).into_iter().map(Arc::new));

    let schedule = schedule(requested, &all)?;
    tracing::debug!(project = %project.name, "task graph:\n{schedule}");

    Ok(run(
        &schedule,
        std::slice::from_ref(project),
        ctx.config.failure_policy,
    ))
}

/// The `compile` task of `project`.
///
/// Compiles every file found under the project's own source roots and the
/// ones plugins contribute. The suffixes present in the project's sources
/// select the compiler flags plugins add, so a Java-only contributor stays
/// silent for a Kotlin-only project.
pub fn compile_task(ctx: &Arc<Context>, project: &Project) -> Task {
    let ctx = ctx.clone();
    Task::new(COMPILE, project.id.clone(), move |project| compile(&ctx, project))
        .description("Compile the sources")
}

fn compile(ctx: &Context, project: &Project) -> TaskResult {
    let suffixes = project.source_suffixes();
    if suffixes.is_empty() {
        tracing::info!(project = %project.name, "no sources, nothing to compile");
        return TaskResult::ok();
    }

    let flags = ctx.registry.compiler_flags(project, &[], &suffixes);
    let mut dirs = project.source_directories.clone();
    dirs.extend(ctx.registry.source_directories(project));
    let wanted: Vec<&str> = suffixes.iter().map(String::as_str).collect();
    let source_files = project.find_source_files(&dirs, &wanted);

    let dependencies = match classpath(ctx, project) {
        Ok(dependencies) => dependencies,
        Err(e) => return TaskResult::failed(format!("compile: {e:#}")),
    };

    let action = CompilerAction {
        directory: project.directory.clone(),
        dependencies,
        source_files,
        suffixes,
        output_directory: project.join(&project.build_directory).join("classes"),
        flags,
        force_recompile: false,
    };

    tracing::info!(
        project = %project.name,
        compiler = ctx.services.compiler.name(),
        files = action.source_files.len(),
        "compiling"
    );
    match ctx.services.compiler.invoke(project, &action).failure {
        None => TaskResult::ok(),
        Some(message) => TaskResult::failed(message),
    }
}

/// Compile and provided dependencies, then plugin classpath entries.
fn classpath(ctx: &Context, project: &Project) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let resolver = &ctx.services.artifact_resolver;
    let mut paths = Vec::new();

    for scope in [Scope::Compile, Scope::Provided] {
        for dep in project.dependencies_in(scope) {
            paths.push(resolver.resolve(dep)?);
        }
    }

    for entry in ctx.registry.classpath_entries(project) {
        match entry {
            ClasspathEntry::File(path) => paths.push(path),
            ClasspathEntry::Artifact(id) => {
                paths.push(resolver.resolve(&Dependency::new(id, Scope::Compile))?)
            }
        }
    }

    Ok(paths)
}
