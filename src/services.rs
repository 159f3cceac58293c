//! Interfaces of the services the core consumes but does not implement:
//! build-file compilation, project discovery, artifact resolution,
//! dependency computation and compiler invocation.
//!
//! A [`Services`] bundle is part of the [`Context`](crate::Context). Any
//! service left unset reports a descriptive error when used.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::project::{Dependency, Project, Scope};

/// Identifies which build configuration an operation works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSources {
    /// A project root; the build file is found underneath it.
    ProjectRoot(Utf8PathBuf),
    /// A build file given directly.
    BuildFile(Utf8PathBuf),
}

impl BuildSources {
    /// Picks the project root over the build file. Returns `None` when
    /// neither is present.
    pub fn resolve(project_root: Option<&str>, build_file: Option<&str>) -> Option<Self> {
        match (project_root, build_file) {
            (Some(root), _) => Some(BuildSources::ProjectRoot(root.into())),
            (None, Some(file)) => Some(BuildSources::BuildFile(file.into())),
            (None, None) => None,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        match self {
            BuildSources::ProjectRoot(path) | BuildSources::BuildFile(path) => path,
        }
    }
}

/// One build file handed to the build-file compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFile {
    pub path: Utf8PathBuf,
    /// Who asked for the compilation, for logging.
    pub reason: String,
}

impl BuildFile {
    pub fn new(path: impl Into<Utf8PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result of compiling one build unit.
#[derive(Debug, Clone)]
pub struct BuildScriptInfo {
    pub build_file: Utf8PathBuf,
    pub projects: Vec<Project>,
}

/// A dependency with its resolved location on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyData {
    pub id: String,
    pub scope: Scope,
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectData {
    pub name: String,
    pub dependencies: Vec<DependencyData>,
}

/// Dependency information for every project of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependenciesData {
    pub projects: Vec<ProjectData>,
    pub error_message: Option<String>,
}

impl DependenciesData {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            projects: Vec::new(),
            error_message: Some(message.into()),
        }
    }
}

/// Receives progress reports from a long computation.
pub trait ProgressListener: Sync {
    fn on_progress(&self, progress: Option<i32>, message: Option<&str>);
}

impl<F> ProgressListener for F
where
    F: Fn(Option<i32>, Option<&str>) + Sync,
{
    fn on_progress(&self, progress: Option<i32>, message: Option<&str>) {
        self(progress, message)
    }
}

pub trait ProjectFinder: Send + Sync {
    /// Loads and initializes every project described by the build sources.
    fn init_for_build_sources(&self, sources: &BuildSources) -> anyhow::Result<Vec<Project>>;
}

pub trait BuildFileCompiler: Send + Sync {
    /// Compiles the build files, handing each compiled unit to `on_unit` as
    /// soon as it is ready.
    fn compile(
        &self,
        files: &[BuildFile],
        on_unit: &mut dyn FnMut(BuildScriptInfo),
    ) -> anyhow::Result<()>;
}

pub trait ArtifactResolver: Send + Sync {
    /// Location of the artifact, downloading it first if needed.
    fn resolve(&self, dependency: &Dependency) -> anyhow::Result<Utf8PathBuf>;
}

pub trait DependencyService: Send + Sync {
    fn dependencies_data_for(
        &self,
        sources: &BuildSources,
        progress: &dyn ProgressListener,
        use_graph: bool,
    ) -> anyhow::Result<DependenciesData>;

    /// Releases whatever state the last computation left behind. Called once
    /// per request after [`dependencies_data_for`](Self::dependencies_data_for),
    /// whatever its outcome.
    fn clean_up(&self) {}
}

/// Everything the compiler needs to compile one set of sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerAction {
    pub directory: Utf8PathBuf,
    pub dependencies: Vec<Utf8PathBuf>,
    pub source_files: Vec<Utf8PathBuf>,
    pub suffixes: Vec<String>,
    pub output_directory: Utf8PathBuf,
    pub flags: Vec<String>,
    pub force_recompile: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerResult {
    pub failure: Option<String>,
}

impl CompilerResult {
    pub fn ok() -> Self {
        Self { failure: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

pub trait Compiler: Send + Sync {
    /// Name of the compiler, e.g. `kotlinc`.
    fn name(&self) -> &str;
    fn invoke(&self, project: &Project, action: &CompilerAction) -> CompilerResult;
}

/// Stand-in for services that were not provided.
struct Unconfigured(&'static str);

impl Unconfigured {
    fn error(&self) -> anyhow::Error {
        anyhow::anyhow!("No {} service configured", self.0)
    }
}

impl ProjectFinder for Unconfigured {
    fn init_for_build_sources(&self, _: &BuildSources) -> anyhow::Result<Vec<Project>> {
        Err(self.error())
    }
}

impl BuildFileCompiler for Unconfigured {
    fn compile(&self, _: &[BuildFile], _: &mut dyn FnMut(BuildScriptInfo)) -> anyhow::Result<()> {
        Err(self.error())
    }
}

impl ArtifactResolver for Unconfigured {
    fn resolve(&self, _: &Dependency) -> anyhow::Result<Utf8PathBuf> {
        Err(self.error())
    }
}

impl DependencyService for Unconfigured {
    fn dependencies_data_for(
        &self,
        _: &BuildSources,
        _: &dyn ProgressListener,
        _: bool,
    ) -> anyhow::Result<DependenciesData> {
        Err(self.error())
    }
}

impl Compiler for Unconfigured {
    fn name(&self) -> &str {
        self.0
    }

    fn invoke(&self, _: &Project, _: &CompilerAction) -> CompilerResult {
        CompilerResult::failed(self.error().to_string())
    }
}

#[derive(Clone)]
pub struct Services {
    pub project_finder: Arc<dyn ProjectFinder>,
    pub build_file_compiler: Arc<dyn BuildFileCompiler>,
    pub artifact_resolver: Arc<dyn ArtifactResolver>,
    pub dependency_data: Arc<dyn DependencyService>,
    pub compiler: Arc<dyn Compiler>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            project_finder: Arc::new(Unconfigured("project finder")),
            build_file_compiler: Arc::new(Unconfigured("build file compiler")),
            artifact_resolver: Arc::new(Unconfigured("artifact resolver")),
            dependency_data: Arc::new(Unconfigured("dependency data")),
            compiler: Arc::new(Unconfigured("compiler")),
        }
    }
}

impl Services {
    pub fn project_finder(mut self, service: impl ProjectFinder + 'static) -> Self {
        self.project_finder = Arc::new(service);
        self
    }

    pub fn build_file_compiler(mut self, service: impl BuildFileCompiler + 'static) -> Self {
        self.build_file_compiler = Arc::new(service);
        self
    }

    pub fn artifact_resolver(mut self, service: impl ArtifactResolver + 'static) -> Self {
        self.artifact_resolver = Arc::new(service);
        self
    }

    pub fn dependency_data(mut self, service: impl DependencyService + 'static) -> Self {
        self.dependency_data = Arc::new(service);
        self
    }

    pub fn compiler(mut self, service: impl Compiler + 'static) -> Self {
        self.compiler = Arc::new(service);
        self
    }
}
