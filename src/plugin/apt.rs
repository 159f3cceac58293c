//! Annotation processing for Java (`apt`) and Kotlin (`kapt`).
//!
//! A project opts in through [`apt`] / [`kapt`], which attach an
//! [`AptConfig`] / [`KaptConfig`] to it, and declares processors with
//! [`apt_dependency`]. Everything generated lands below
//! `<build directory>/<output dir>`.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::engine::{Task, TaskResult};
use crate::plugin::{
    ClasspathContributor, ClasspathEntry, CompilerFlagContributor, Plugin,
    SourceDirectoryContributor, TaskContributor,
};
use crate::project::{Dependency, Project, Scope};
use crate::services::{ArtifactResolver, Compiler, CompilerAction, Services};

pub const PLUGIN_NAME: &str = "apt";

const ANNOTATION_PROCESSING: &str = "org.jetbrains.kotlin:kotlin-annotation-processing:1.1.1";
const KAPT_PLUGIN_ID: &str = "org.jetbrains.kotlin.kapt3";
const DEFAULT_OUTPUT_DIR: &str = "generated/source/apt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptConfig {
    pub output_dir: Utf8PathBuf,
}

impl Default for AptConfig {
    fn default() -> Self {
        Self {
            output_dir: DEFAULT_OUTPUT_DIR.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KaptConfig {
    pub output_dir: Utf8PathBuf,
}

impl Default for KaptConfig {
    fn default() -> Self {
        Self {
            output_dir: DEFAULT_OUTPUT_DIR.into(),
        }
    }
}

/// Annotation processors declared for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AptDependencies(pub Vec<String>);

pub fn apt(project: &mut Project, config: AptConfig) {
    project.configure(config);
}

pub fn kapt(project: &mut Project, config: KaptConfig) {
    project.configure(config);
}

pub fn apt_dependency(project: &mut Project, id: impl Into<String>) {
    let mut deps = project
        .config::<AptDependencies>()
        .cloned()
        .unwrap_or_default();
    deps.0.push(id.into());
    project.configure(deps);
}

fn generated(project: &Project, output_dir: &Utf8Path) -> Utf8PathBuf {
    project.join(&project.build_directory).join(output_dir)
}

fn generated_sources(project: &Project, output_dir: &Utf8Path) -> Utf8PathBuf {
    generated(project, output_dir).join("sources")
}

fn generated_stubs(project: &Project, output_dir: &Utf8Path) -> Utf8PathBuf {
    generated(project, output_dir).join("stubs")
}

fn generated_classes(project: &Project, output_dir: &Utf8Path) -> Utf8PathBuf {
    generated(project, output_dir).join("classes")
}

/// Handles both `apt` and `kapt`. The compiler and the artifact resolver are
/// handed in at construction.
pub struct AptPlugin {
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn ArtifactResolver>,
}

impl AptPlugin {
    pub fn new(services: &Services) -> Self {
        Self {
            compiler: services.compiler.clone(),
            resolver: services.artifact_resolver.clone(),
        }
    }
}

impl Plugin for AptPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    /// Clears whatever a previous build generated.
    fn apply(&self, project: &mut Project) {
        let mut dirs: Vec<&Utf8Path> = Vec::new();
        if let Some(config) = project.config::<AptConfig>() {
            dirs.push(&config.output_dir);
        }
        if let Some(config) = project.config::<KaptConfig>()
            && !dirs.contains(&config.output_dir.as_path())
        {
            dirs.push(&config.output_dir);
        }

        for dir in dirs {
            let path = generated(project, dir);
            tracing::debug!(project = %project.name, "Deleting {path}");
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(project = %project.name, "Couldn't delete {path}: {e}"),
            }
        }
    }

    fn classpath(&self) -> Option<&dyn ClasspathContributor> {
        Some(self)
    }

    fn source_directories(&self) -> Option<&dyn SourceDirectoryContributor> {
        Some(self)
    }

    fn compiler_flags(&self) -> Option<&dyn CompilerFlagContributor> {
        Some(self)
    }

    fn tasks(&self) -> Option<&dyn TaskContributor> {
        Some(self)
    }
}

impl ClasspathContributor for AptPlugin {
    /// Classes compiled by `compileKapt`.
    fn classpath_entries_for(&self, project: &Project) -> Vec<ClasspathEntry> {
        project
            .config::<KaptConfig>()
            .map(|config| ClasspathEntry::File(generated_classes(project, &config.output_dir)))
            .into_iter()
            .collect()
    }
}

impl SourceDirectoryContributor for AptPlugin {
    fn source_directories_for(&self, project: &Project) -> Vec<Utf8PathBuf> {
        let apt = project.config::<AptConfig>().map(|c| &c.output_dir);
        let kapt = project.config::<KaptConfig>().map(|c| &c.output_dir);

        apt.into_iter()
            .chain(kapt)
            .map(|dir| generated(project, dir))
            .collect()
    }
}

impl CompilerFlagContributor for AptPlugin {
    /// Points `javac` at the generated sources directory. Only applies to
    /// Java compilation of a project with declared processors.
    fn flags_for(&self, project: &Project, _: &[String], suffixes: &[String]) -> Vec<String> {
        if !suffixes.iter().any(|s| s == "java") {
            return Vec::new();
        }

        let has_processors = project
            .config::<AptDependencies>()
            .is_some_and(|deps| !deps.0.is_empty());

        let flags = match project.config::<AptConfig>() {
            Some(config) if has_processors => vec![
                String::from("-s"),
                generated_sources(project, &config.output_dir).to_string(),
            ],
            _ => Vec::new(),
        };

        tracing::debug!(project = %project.name, "New flags from apt: {}", flags.join(" "));
        flags
    }
}

impl TaskContributor for AptPlugin {
    fn tasks_for(&self, project: &Project) -> Vec<Task> {
        if project.config::<KaptConfig>().is_none() {
            return Vec::new();
        }

        let kapt = Kapt {
            compiler: self.compiler.clone(),
            resolver: self.resolver.clone(),
        };
        let run = kapt.clone();

        vec![
            Task::new("runKapt", project.id.clone(), move |p| run.run(p))
                .description("Run kapt")
                .group("annotations")
                .reverse_depends_on(["compile"])
                .run_after(["clean"]),
            Task::new("compileKapt", project.id.clone(), move |p| kapt.compile(p))
                .description("Compile the sources generated by kapt")
                .group("annotations")
                .depends_on(["runKapt"])
                .reverse_depends_on(["compile"]),
        ]
    }
}

/// Actions behind the two kapt tasks.
#[derive(Clone)]
struct Kapt {
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn ArtifactResolver>,
}

impl Kapt {
    fn processor(&self) -> anyhow::Result<Utf8PathBuf> {
        self.resolver
            .resolve(&Dependency::new(ANNOTATION_PROCESSING, Scope::Compile))
    }

    /// Jars the processors need: the project's compile dependencies plus the
    /// declared processors.
    fn processor_classpath(&self, project: &Project) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let declared = project
            .config::<AptDependencies>()
            .map(|deps| deps.0.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|id| Dependency::new(id.as_str(), Scope::Compile));

        project
            .dependencies_in(Scope::Compile)
            .cloned()
            .chain(declared)
            .map(|dep| self.resolver.resolve(&dep))
            .collect()
    }

    fn run(&self, project: &Project) -> TaskResult {
        let Some(config) = project.config::<KaptConfig>() else {
            return TaskResult::ok();
        };

        match self.try_run(project, &config.output_dir) {
            Ok(result) => result,
            Err(e) => TaskResult::failed(format!("runKapt: {e:#}")),
        }
    }

    fn try_run(&self, project: &Project, output_dir: &Utf8Path) -> anyhow::Result<TaskResult> {
        let sources = generated_sources(project, output_dir);
        std::fs::create_dir_all(&sources)?;

        let processor = self.processor()?;
        let classpath = self.processor_classpath(project)?;

        let verbose = tracing::enabled!(tracing::Level::DEBUG);
        let mut options = vec![
            format!("sources={sources}"),
            format!("classes={}", generated_classes(project, output_dir)),
            format!("stubs={}", generated_stubs(project, output_dir)),
            format!("verbose={verbose}"),
            String::from("aptOnly=true"),
        ];
        options.extend(classpath.iter().map(|jar| format!("apclasspath={jar}")));

        let options: Vec<_> = options
            .into_iter()
            .map(|option| format!("plugin:{KAPT_PLUGIN_ID}:{option}"))
            .collect();
        tracing::debug!(project = %project.name, "  {}", options.join("\n  "));

        let mut flags = vec![
            String::from("-Xplugin"),
            processor.to_string(),
            String::from("-P"),
            options.join(","),
        ];
        flags.extend(["-language-version", "1.1", "-api-version", "1.1"].map(String::from));

        let mut dependencies = vec![processor];
        dependencies.extend(classpath);

        let action = CompilerAction {
            directory: project.directory.clone(),
            dependencies,
            source_files: project.find_source_files(&project.source_directories, &["kt"]),
            suffixes: vec![String::from("kt")],
            output_directory: generated(project, output_dir),
            flags,
            force_recompile: true,
        };

        Ok(self.invoke(project, &action))
    }

    fn compile(&self, project: &Project) -> TaskResult {
        let Some(config) = project.config::<KaptConfig>() else {
            return TaskResult::ok();
        };

        let processor = match self.processor() {
            Ok(processor) => processor,
            Err(e) => return TaskResult::failed(format!("compileKapt: {e:#}")),
        };

        let dirs = [
            generated_stubs(project, &config.output_dir),
            generated_sources(project, &config.output_dir),
        ];

        let action = CompilerAction {
            directory: project.directory.clone(),
            dependencies: vec![processor],
            source_files: project.find_source_files(&dirs, &["kt"]),
            suffixes: vec![String::from("kt")],
            output_directory: generated_classes(project, &config.output_dir),
            flags: Vec::new(),
            force_recompile: true,
        };

        self.invoke(project, &action)
    }

    fn invoke(&self, project: &Project, action: &CompilerAction) -> TaskResult {
        tracing::info!(
            project = %project.name,
            compiler = self.compiler.name(),
            files = action.source_files.len(),
            "compiling"
        );
        let result = self.compiler.invoke(project, action);
        match result.failure {
            None => TaskResult::ok(),
            Some(message) => TaskResult::failed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::schedule;
    use crate::plugin::Registry;
    use crate::services::CompilerResult;

    #[derive(Default)]
    struct Recorder {
        actions: Mutex<Vec<CompilerAction>>,
        fail: bool,
    }

    impl Compiler for Arc<Recorder> {
        fn name(&self) -> &str {
            "kotlinc"
        }

        fn invoke(&self, _: &Project, action: &CompilerAction) -> CompilerResult {
            self.actions.lock().unwrap().push(action.clone());
            if self.fail {
                CompilerResult::failed("e: unresolved reference")
            } else {
                CompilerResult::ok()
            }
        }
    }

    struct Repo;

    impl ArtifactResolver for Repo {
        fn resolve(&self, dependency: &Dependency) -> anyhow::Result<Utf8PathBuf> {
            if dependency.id.contains("missing") {
                anyhow::bail!("Couldn't resolve {}", dependency.id);
            }
            Ok(Utf8PathBuf::from("/repo").join(format!("{}.jar", dependency.id.replace(':', "-"))))
        }
    }

    fn plugin(recorder: &Arc<Recorder>) -> AptPlugin {
        let services = Services::default()
            .compiler(recorder.clone())
            .artifact_resolver(Repo);
        AptPlugin::new(&services)
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_unconfigured_project_gets_nothing() {
        let apt = plugin(&Arc::default());
        let project = Project::new("app", "/tmp/app");
        let java = vec![String::from("java")];

        assert!(apt.classpath_entries_for(&project).is_empty());
        assert!(apt.source_directories_for(&project).is_empty());
        assert!(apt.flags_for(&project, &[], &java).is_empty());
        assert!(apt.tasks_for(&project).is_empty());
    }

    #[test]
    fn test_java_flags_need_config_and_processors() {
        let apt = plugin(&Arc::default());
        let mut project = Project::new("app", "/tmp/app");
        let java = vec![String::from("java")];
        let kotlin = vec![String::from("kt")];

        super::apt(&mut project, AptConfig::default());
        assert!(apt.flags_for(&project, &[], &java).is_empty());

        apt_dependency(&mut project, "com.google.dagger:dagger-compiler:2.8");
        assert_eq!(
            apt.flags_for(&project, &[], &java),
            ["-s", "/tmp/app/kobaltBuild/generated/source/apt/sources"]
        );
        assert!(apt.flags_for(&project, &[], &kotlin).is_empty());
    }

    #[test]
    fn test_source_directories_and_classpath() {
        let apt = plugin(&Arc::default());
        let mut project = Project::new("app", "/tmp/app");
        super::apt(&mut project, AptConfig::default());
        super::kapt(
            &mut project,
            KaptConfig {
                output_dir: "generated/kapt".into(),
            },
        );

        assert_eq!(
            apt.source_directories_for(&project),
            [
                Utf8PathBuf::from("/tmp/app/kobaltBuild/generated/source/apt"),
                Utf8PathBuf::from("/tmp/app/kobaltBuild/generated/kapt"),
            ]
        );
        assert_eq!(
            apt.classpath_entries_for(&project),
            [ClasspathEntry::File(
                "/tmp/app/kobaltBuild/generated/kapt/classes".into()
            )]
        );
    }

    #[test]
    fn test_apply_deletes_generated_output() {
        let (_dir, root) = tempdir();
        let stale = root.join("kobaltBuild/generated/source/apt/sources/Old.java");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "class Old {}").unwrap();

        let mut project = Project::new("app", root.clone());
        super::apt(&mut project, AptConfig::default());
        super::kapt(&mut project, KaptConfig::default());

        plugin(&Arc::default()).apply(&mut project);

        assert!(!root.join("kobaltBuild/generated/source/apt").exists());
    }

    #[test]
    fn test_kapt_tasks_run_before_compile() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.register_all(Arc::new(plugin(&recorder)));

        let mut project = Project::new("app", "/tmp/app");
        super::kapt(&mut project, KaptConfig::default());

        let mut tasks: Vec<_> = registry.tasks_for(&project).into_iter().map(Arc::new).collect();
        tasks.push(Arc::new(Task::new("clean", project.id.clone(), |_| TaskResult::ok())));
        tasks.push(Arc::new(Task::new("compile", project.id.clone(), |_| TaskResult::ok())));

        let order = schedule(&["clean", "compile"], &tasks).unwrap();
        assert_eq!(order.names(), ["clean", "runKapt", "compileKapt", "compile"]);
        assert!(tasks.iter().take(2).all(|t| t.plugin.as_deref() == Some(PLUGIN_NAME)));
    }

    #[test]
    fn test_run_kapt_invokes_compiler() {
        let (_dir, root) = tempdir();
        std::fs::create_dir_all(root.join("src/main/kotlin")).unwrap();
        std::fs::write(root.join("src/main/kotlin/Main.kt"), "fun main() {}").unwrap();

        let recorder = Arc::new(Recorder::default());
        let apt = plugin(&recorder);

        let mut project = Project::new("app", root.clone()).depends_on("a:a:1", Scope::Compile);
        super::kapt(&mut project, KaptConfig::default());
        apt_dependency(&mut project, "p:p:1");

        let tasks = apt.tasks_for(&project);
        let result = tasks[0].execute(&project);
        assert!(result.success, "{result:?}");

        let generated = root.join("kobaltBuild/generated/source/apt");
        assert!(generated.join("sources").is_dir());

        let actions = recorder.actions.lock().unwrap();
        let action = &actions[0];
        assert_eq!(action.source_files, [root.join("src/main/kotlin/Main.kt")]);
        assert_eq!(action.output_directory, generated);
        assert!(action.force_recompile);
        assert_eq!(action.flags[0], "-Xplugin");
        assert_eq!(
            action.flags[1],
            "/repo/org.jetbrains.kotlin-kotlin-annotation-processing-1.1.1.jar"
        );
        let options = &action.flags[3];
        assert!(options.contains("plugin:org.jetbrains.kotlin.kapt3:aptOnly=true"));
        assert!(options.contains("plugin:org.jetbrains.kotlin.kapt3:apclasspath=/repo/a-a-1.jar"));
        assert!(options.contains("plugin:org.jetbrains.kotlin.kapt3:apclasspath=/repo/p-p-1.jar"));
    }

    #[test]
    fn test_kapt_failures_become_task_failures() {
        let (_dir, root) = tempdir();
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let apt = plugin(&recorder);

        let mut project = Project::new("app", root);
        super::kapt(&mut project, KaptConfig::default());

        let tasks = apt.tasks_for(&project);
        let result = tasks[1].execute(&project);
        assert_eq!(result.message.as_deref(), Some("e: unresolved reference"));

        apt_dependency(&mut project, "missing:proc:1");
        let result = tasks[0].execute(&project);
        assert!(!result.success);
        assert_eq!(
            result.message.as_deref(),
            Some("runKapt: Couldn't resolve missing:proc:1")
        );
    }
}
