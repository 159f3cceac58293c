//! Starts the daemon with in-memory services.
//!
//! Reads `kiln.json` from the working directory when present. Every build
//! file compiles to the same two projects; artifacts resolve into a
//! Maven-style layout under `~/.m2/repository` without touching the network.

use std::sync::Arc;

use camino::Utf8PathBuf;
use kiln::engine::{build, compile_task};
use kiln::plugin::apt::{self, AptPlugin, KaptConfig};
use kiln::services::{
    ArtifactResolver, BuildFile, BuildFileCompiler, BuildScriptInfo, BuildSources, Compiler,
    CompilerAction, CompilerResult, DependenciesData, DependencyData, DependencyService,
    ProgressListener, ProjectData, ProjectFinder,
};
use kiln::{
    BuildEvent, Config, Context, Daemon, Dependency, EventBus, Project, Registry, Scope, Services,
    Task, TaskResult,
};

fn projects(root: &Utf8PathBuf) -> Vec<Project> {
    let core = Project::new("core", root.join("core"))
        .depends_on("com.beust:jcommander:1.48", Scope::Compile)
        .depends_on("org.testng:testng:6.9.10", Scope::TestCompile);

    let mut app = Project::new("app", root.join("app"))
        .depends_on("com.google.dagger:dagger:2.8", Scope::Compile)
        .depends_on("javax.annotation:jsr250-api:1.0", Scope::Provided);
    apt::kapt(&mut app, KaptConfig::default());
    apt::apt_dependency(&mut app, "com.google.dagger:dagger-compiler:2.8");

    vec![core, app]
}

struct Sample;

impl ProjectFinder for Sample {
    fn init_for_build_sources(&self, sources: &BuildSources) -> anyhow::Result<Vec<Project>> {
        Ok(projects(&sources.path().to_owned()))
    }
}

impl BuildFileCompiler for Sample {
    fn compile(
        &self,
        files: &[BuildFile],
        on_unit: &mut dyn FnMut(BuildScriptInfo),
    ) -> anyhow::Result<()> {
        for file in files {
            let root = file
                .path
                .ancestors()
                .nth(3)
                .map(ToOwned::to_owned)
                .unwrap_or_default();
            on_unit(BuildScriptInfo {
                build_file: file.path.clone(),
                projects: projects(&root),
            });
        }
        Ok(())
    }
}

struct MavenLayout {
    root: Utf8PathBuf,
}

impl ArtifactResolver for MavenLayout {
    fn resolve(&self, dependency: &Dependency) -> anyhow::Result<Utf8PathBuf> {
        let parts: Vec<&str> = dependency.id.split(':').collect();
        let &[group, artifact, version] = parts.as_slice() else {
            anyhow::bail!("Malformed artifact id '{}'", dependency.id);
        };
        Ok(self
            .root
            .join(group.replace('.', "/"))
            .join(artifact)
            .join(version)
            .join(format!("{artifact}-{version}.jar")))
    }
}

/// Pretends to download every dependency, announcing each on the bus.
struct Downloads {
    events: EventBus,
    resolver: MavenLayout,
}

impl DependencyService for Downloads {
    fn dependencies_data_for(
        &self,
        sources: &BuildSources,
        progress: &dyn ProgressListener,
        _use_graph: bool,
    ) -> anyhow::Result<DependenciesData> {
        let projects = projects(&sources.path().to_owned());
        let total = projects.len();
        let mut result = Vec::new();

        for (i, project) in projects.into_iter().enumerate() {
            let percent = ((i + 1) * 100 / total) as i32;
            progress.on_progress(Some(percent), Some(&format!("Resolving {}", project.name)));

            let mut dependencies = Vec::new();
            for dep in &project.dependencies {
                let path = self.resolver.resolve(dep)?;
                self.events.publish(&BuildEvent::ArtifactDownloaded {
                    artifact_id: dep.id.clone(),
                });
                dependencies.push(DependencyData {
                    id: dep.id.clone(),
                    scope: dep.scope,
                    path,
                });
            }
            result.push(ProjectData {
                name: project.name,
                dependencies,
            });
        }

        Ok(DependenciesData {
            projects: result,
            error_message: None,
        })
    }
}

struct Echo;

impl Compiler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn invoke(&self, project: &Project, action: &CompilerAction) -> CompilerResult {
        tracing::info!(
            project = %project.name,
            files = action.source_files.len(),
            flags = ?action.flags,
            "would compile into {}",
            action.output_directory
        );
        CompilerResult::ok()
    }
}

fn main() -> anyhow::Result<()> {
    kiln::init_logging()?;

    let config = match Config::load("kiln.json") {
        Ok(config) => config,
        Err(kiln::ConfigError::Read(..)) => Config::default(),
        Err(e) => return Err(e.into()),
    };

    let home = std::env::var("HOME").unwrap_or_else(|_| String::from("."));
    let repository = Utf8PathBuf::from(home).join(".m2/repository");
    let events = EventBus::default();

    let services = Services::default()
        .project_finder(Sample)
        .build_file_compiler(Sample)
        .artifact_resolver(MavenLayout {
            root: repository.clone(),
        })
        .dependency_data(Downloads {
            events: events.clone(),
            resolver: MavenLayout { root: repository },
        })
        .compiler(Echo);

    let mut registry = Registry::new();
    registry.register_all(Arc::new(AptPlugin::new(&services)));

    let ctx = Context::with_events(config, registry, services, events);

    // one local build, so the task graph shows up in the log
    let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
    let mut app = projects(&cwd.join("sample")).remove(1);
    ctx.registry.apply_all(&mut app);

    let tasks = vec![
        Task::new("clean", app.id.clone(), |_| TaskResult::ok()),
        compile_task(&ctx, &app),
        Task::new("assemble", app.id.clone(), |_| TaskResult::ok()).depends_on(["compile"]),
    ];
    let report = build(&ctx, &app, tasks, &["clean", "assemble"])?;
    tracing::info!(success = report.success, "sample build finished");

    Daemon::start(ctx)?;
    Ok(())
}
