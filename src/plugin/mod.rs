//! Plugins and the capabilities they contribute.
//!
//! A plugin is registered once per capability it provides. The core never
//! asks a plugin directly; it asks the [`Registry`] for every contribution of
//! one kind and folds the answers together. Contributors are pure queries:
//! a project a plugin was not configured for simply gets nothing back.

pub mod apt;

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::engine::{Task, TaskResult};
use crate::error::RegistryError;
use crate::project::Project;

/// The kinds of contribution a plugin can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Classpath,
    SourceDirectory,
    CompilerFlag,
    Task,
    Assembly,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Classpath,
        Capability::SourceDirectory,
        Capability::CompilerFlag,
        Capability::Task,
        Capability::Assembly,
    ];
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Capability::Classpath => "classpath",
            Capability::SourceDirectory => "source-directory",
            Capability::CompilerFlag => "compiler-flag",
            Capability::Task => "task",
            Capability::Assembly => "assembly",
        })
    }
}

/// One entry on a compile classpath.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClasspathEntry {
    /// A directory or jar already on disk.
    File(Utf8PathBuf),
    /// An artifact id to be resolved, e.g. `com.google.dagger:dagger:2.8`.
    Artifact(String),
}

pub trait ClasspathContributor: Send + Sync {
    fn classpath_entries_for(&self, project: &Project) -> Vec<ClasspathEntry>;
}

pub trait SourceDirectoryContributor: Send + Sync {
    fn source_directories_for(&self, project: &Project) -> Vec<Utf8PathBuf>;
}

pub trait CompilerFlagContributor: Send + Sync {
    /// Flags to append when compiling files with `suffixes`. `current` holds
    /// the flags collected so far, from the build file and earlier plugins.
    fn flags_for(&self, project: &Project, current: &[String], suffixes: &[String]) -> Vec<String>;
}

pub trait TaskContributor: Send + Sync {
    fn tasks_for(&self, project: &Project) -> Vec<Task>;
}

pub trait AssemblyContributor: Send + Sync {
    fn assemble(&self, project: &Project) -> TaskResult;
}

/// A named bundle of capabilities.
///
/// Every capability accessor defaults to `None`. A plugin overrides the
/// ones it implements and registers itself for those kinds.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per project before any capability is queried. Plugins
    /// attach their per-project state here through [`Project::configure`].
    fn apply(&self, _project: &mut Project) {}

    fn classpath(&self) -> Option<&dyn ClasspathContributor> {
        None
    }

    fn source_directories(&self) -> Option<&dyn SourceDirectoryContributor> {
        None
    }

    fn compiler_flags(&self) -> Option<&dyn CompilerFlagContributor> {
        None
    }

    fn tasks(&self) -> Option<&dyn TaskContributor> {
        None
    }

    fn assembly(&self) -> Option<&dyn AssemblyContributor> {
        None
    }

    fn provides(&self, kind: Capability) -> bool {
        match kind {
            Capability::Classpath => self.classpath().is_some(),
            Capability::SourceDirectory => self.source_directories().is_some(),
            Capability::CompilerFlag => self.compiler_flags().is_some(),
            Capability::Task => self.tasks().is_some(),
            Capability::Assembly => self.assembly().is_some(),
        }
    }
}

/// The point in the build at which capabilities are queried.
#[derive(Debug, Clone, Copy, Default)]
pub enum Phase<'a> {
    /// Project configuration, before any task runs.
    #[default]
    Configure,
    /// Compilation of files with `suffixes`, given the flags collected so far.
    Compile {
        flags: &'a [String],
        suffixes: &'a [String],
    },
    Assemble,
}

/// What a single plugin answered to a query.
#[derive(Debug)]
pub enum Contribution {
    Classpath(Vec<ClasspathEntry>),
    SourceDirectories(Vec<Utf8PathBuf>),
    CompilerFlags(Vec<String>),
    Tasks(Vec<Task>),
    Assembly(TaskResult),
}

/// All registered plugins, indexed by the capabilities they were registered
/// for. Registration order is preserved and is the order of contributions.
#[derive(Default)]
pub struct Registry {
    plugins: Vec<Arc<dyn Plugin>>,
    by_kind: HashMap<Capability, Vec<usize>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` as a contributor of `kind`. Registering the same
    /// plugin for the same kind twice has no effect.
    pub fn register(
        &mut self,
        plugin: Arc<dyn Plugin>,
        kind: Capability,
    ) -> Result<(), RegistryError> {
        if !plugin.provides(kind) {
            return Err(RegistryError::Unsupported {
                plugin: plugin.name().to_string(),
                kind,
            });
        }

        let index = match self.plugins.iter().position(|p| Arc::ptr_eq(p, &plugin)) {
            Some(index) => index,
            None => {
                self.plugins.push(plugin);
                self.plugins.len() - 1
            }
        };

        let slots = self.by_kind.entry(kind).or_default();
        if !slots.contains(&index) {
            slots.push(index);
            tracing::debug!(plugin = self.plugins[index].name(), %kind, "registered");
        }

        Ok(())
    }

    /// Registers `plugin` for every capability it provides and returns them.
    pub fn register_all(&mut self, plugin: Arc<dyn Plugin>) -> Vec<Capability> {
        let kinds: Vec<_> = Capability::ALL
            .into_iter()
            .filter(|kind| plugin.provides(*kind))
            .collect();

        for kind in &kinds {
            // provides() was just checked, registration can't fail
            let _ = self.register(plugin.clone(), *kind);
        }

        kinds
    }

    /// Plugins registered for `kind`, in registration order.
    pub fn plugins(&self, kind: Capability) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .map(|index| &self.plugins[*index])
    }

    /// Lets every registered plugin configure `project`, once each.
    pub fn apply_all(&self, project: &mut Project) {
        for plugin in &self.plugins {
            tracing::trace!(plugin = plugin.name(), project = %project.name, "apply");
            plugin.apply(project);
        }
    }

    /// Asks every contributor of `kind` about `project` and returns their
    /// answers in registration order.
    pub fn query(
        &self,
        kind: Capability,
        project: &Project,
        phase: Phase<'_>,
    ) -> Vec<Contribution> {
        let (flags, suffixes) = match phase {
            Phase::Compile { flags, suffixes } => (flags, suffixes),
            Phase::Configure | Phase::Assemble => (&[][..], &[][..]),
        };

        self.plugins(kind)
            .filter_map(|plugin| match kind {
                Capability::Classpath => plugin
                    .classpath()
                    .map(|c| Contribution::Classpath(c.classpath_entries_for(project))),
                Capability::SourceDirectory => plugin
                    .source_directories()
                    .map(|c| Contribution::SourceDirectories(c.source_directories_for(project))),
                Capability::CompilerFlag => plugin
                    .compiler_flags()
                    .map(|c| Contribution::CompilerFlags(c.flags_for(project, flags, suffixes))),
                Capability::Task => plugin.tasks().map(|c| {
                    let tasks = c
                        .tasks_for(project)
                        .into_iter()
                        .map(|task| task.plugin(plugin.name()))
                        .collect();
                    Contribution::Tasks(tasks)
                }),
                Capability::Assembly => plugin
                    .assembly()
                    .map(|c| Contribution::Assembly(c.assemble(project))),
            })
            .collect()
    }

    /// Classpath entries from every contributor, first occurrence wins.
    pub fn classpath_entries(&self, project: &Project) -> Vec<ClasspathEntry> {
        let mut seen = HashSet::new();
        self.query(Capability::Classpath, project, Phase::Configure)
            .into_iter()
            .flat_map(|c| match c {
                Contribution::Classpath(entries) => entries,
                _ => Vec::new(),
            })
            .filter(|entry| seen.insert(entry.clone()))
            .collect()
    }

    /// Extra source roots from every contributor, first occurrence wins.
    pub fn source_directories(&self, project: &Project) -> Vec<Utf8PathBuf> {
        let mut seen = HashSet::new();
        self.query(Capability::SourceDirectory, project, Phase::Configure)
            .into_iter()
            .flat_map(|c| match c {
                Contribution::SourceDirectories(dirs) => dirs,
                _ => Vec::new(),
            })
            .filter(|dir| seen.insert(dir.clone()))
            .collect()
    }

    /// `current` followed by the flags of every contributor. Flags are not
    /// deduplicated since many of them take a separate value argument.
    pub fn compiler_flags(
        &self,
        project: &Project,
        current: &[String],
        suffixes: &[String],
    ) -> Vec<String> {
        let mut flags = current.to_vec();
        let phase = Phase::Compile {
            flags: current,
            suffixes,
        };

        for contribution in self.query(Capability::CompilerFlag, project, phase) {
            if let Contribution::CompilerFlags(extra) = contribution {
                flags.extend(extra);
            }
        }

        flags
    }

    /// Tasks contributed for `project`, tagged with the contributing plugin.
    pub fn tasks_for(&self, project: &Project) -> Vec<Task> {
        self.query(Capability::Task, project, Phase::Configure)
            .into_iter()
            .flat_map(|c| match c {
                Contribution::Tasks(tasks) => tasks,
                _ => Vec::new(),
            })
            .collect()
    }

    /// Runs every assembly contributor. The result fails if any of them did;
    /// failure messages are joined in registration order.
    pub fn assemble(&self, project: &Project) -> TaskResult {
        let mut messages = Vec::new();
        let mut success = true;

        for contribution in self.query(Capability::Assembly, project, Phase::Assemble) {
            if let Contribution::Assembly(result) = contribution {
                success &= result.success;
                messages.extend(result.message);
            }
        }

        TaskResult {
            success,
            message: (!messages.is_empty()).then(|| messages.join("\n")),
        }
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in Capability::ALL {
            let names: Vec<_> = self.plugins(kind).map(|p| p.name()).collect();
            if !names.is_empty() {
                map.entry(&kind, &names);
            }
        }
        map.finish()
    }
}
