//! The project record the rest of the core operates on.
//!
//! Plugins never keep their own maps of per-project state. Whatever a plugin
//! needs to remember about a project is attached to the [`Project`] itself
//! through [`Project::configure`], keyed by the Rust type of the value.

use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Debug, Display};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Dynamic;

/// Opaque identifier of a project, unique within one build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Arc<str>);

impl ProjectId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of a dependency's applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "compile")]
    Compile,
    #[serde(rename = "provided")]
    Provided,
    #[serde(rename = "runtime")]
    Runtime,
    #[serde(rename = "testCompile")]
    TestCompile,
    #[serde(rename = "testProvided")]
    TestProvided,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Compile,
        Scope::Provided,
        Scope::Runtime,
        Scope::TestCompile,
        Scope::TestProvided,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Compile => "compile",
            Scope::Provided => "provided",
            Scope::Runtime => "runtime",
            Scope::TestCompile => "testCompile",
            Scope::TestProvided => "testProvided",
        }
    }
}

/// A declared dependency of a project, e.g. `org.testng:testng:6.9.10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    pub scope: Scope,
}

impl Dependency {
    pub fn new(id: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: id.into(),
            scope,
        }
    }
}

/// Per-project plugin configuration, keyed by type.
#[derive(Clone, Default)]
pub struct Properties {
    map: HashMap<TypeId, (&'static str, Dynamic)>,
}

impl Properties {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<Dynamic> {
        self.map
            .insert(TypeId::of::<T>(), (type_name::<T>(), Arc::new(value)))
            .map(|(_, old)| old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Debug for Properties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.map.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        f.debug_set().entries(names).finish()
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Root directory of the project.
    pub directory: Utf8PathBuf,
    /// Build output directory, relative to `directory`.
    pub build_directory: Utf8PathBuf,
    /// Source roots, relative to `directory`.
    pub source_directories: Vec<Utf8PathBuf>,
    pub dependencies: Vec<Dependency>,
    pub properties: Properties,
}

impl Project {
    pub fn new(name: impl Into<String>, directory: impl Into<Utf8PathBuf>) -> Self {
        let name = name.into();
        Self {
            id: ProjectId::new(&name),
            name,
            directory: directory.into(),
            build_directory: Utf8PathBuf::from("kobaltBuild"),
            source_directories: vec![
                Utf8PathBuf::from("src/main/java"),
                Utf8PathBuf::from("src/main/kotlin"),
            ],
            dependencies: Vec::new(),
            properties: Properties::default(),
        }
    }

    pub fn with_id(mut self, id: ProjectId) -> Self {
        self.id = id;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>, scope: Scope) -> Self {
        self.dependencies.push(Dependency::new(id, scope));
        self
    }

    /// Attaches plugin configuration to this project, replacing any previous
    /// value of the same type.
    pub fn configure<T: Any + Send + Sync>(&mut self, config: T) -> &mut Self {
        self.properties.insert(config);
        self
    }

    pub fn config<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.properties.get::<T>()
    }

    pub fn dependencies_in(&self, scope: Scope) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(move |dep| dep.scope == scope)
    }

    /// Resolves a path relative to the project directory.
    pub fn join(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.directory.join(path)
    }

    /// Distinct file suffixes (without the dot) of all files found under the
    /// source directories, sorted.
    pub fn source_suffixes(&self) -> Vec<String> {
        let suffixes: BTreeSet<String> = self
            .source_directories
            .iter()
            .flat_map(|dir| files_under(&self.join(dir)))
            .filter_map(|path| path.extension().map(str::to_string))
            .collect();

        suffixes.into_iter().collect()
    }

    /// Files under `dirs` (relative to the project directory) whose suffix is
    /// one of `suffixes`.
    pub fn find_source_files(&self, dirs: &[Utf8PathBuf], suffixes: &[&str]) -> Vec<Utf8PathBuf> {
        dirs.iter()
            .flat_map(|dir| files_under(&self.join(dir)))
            .filter(|path| path.extension().is_some_and(|ext| suffixes.contains(&ext)))
            .collect()
    }
}

/// Every regular file below `dir`, sorted. Missing directories yield nothing.
fn files_under(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let pattern = dir.join("**").join("*");
    let paths = match glob::glob(pattern.as_str()) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(%pattern, "invalid source pattern: {e}");
            return Vec::new();
        }
    };

    let mut files: Vec<_> = paths
        .flatten()
        .filter(|path| path.is_file())
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn test_properties_keyed_by_type() {
        let mut project = Project::new("app", "/tmp/app");
        assert!(project.config::<Marker>().is_none());

        project.configure(Marker(1));
        project.configure(Marker(2));
        project.configure(String::from("other"));

        assert_eq!(project.config::<Marker>(), Some(&Marker(2)));
        assert_eq!(project.config::<String>().map(String::as_str), Some("other"));
        assert_eq!(project.properties.len(), 2);
    }

    #[test]
    fn test_properties_do_not_leak_between_projects() {
        let mut a = Project::new("a", "/tmp/a");
        let b = Project::new("a", "/tmp/other").with_id(ProjectId::new("other:a"));

        a.configure(Marker(7));

        assert!(b.config::<Marker>().is_none());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_project_id_is_a_plain_string_on_the_wire() {
        let id = ProjectId::new("org.example:app");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""org.example:app""#);

        let back: ProjectId = serde_json::from_str(r#""org.example:app""#).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.as_str(), "org.example:app");
    }

    #[test]
    fn test_scope_wire_names() {
        let json = serde_json::to_string(&Scope::ALL).unwrap();
        assert_eq!(
            json,
            r#"["compile","provided","runtime","testCompile","testProvided"]"#
        );
        for scope in Scope::ALL {
            assert_eq!(
                serde_json::to_string(&scope).unwrap(),
                format!("\"{}\"", scope.as_str())
            );
        }
    }

    #[test]
    fn test_dependencies_in_scope() {
        let project = Project::new("app", "/tmp/app")
            .depends_on("a:a:1", Scope::Compile)
            .depends_on("b:b:1", Scope::TestCompile)
            .depends_on("c:c:1", Scope::Compile);

        let ids: Vec<_> = project
            .dependencies_in(Scope::Compile)
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(ids, ["a:a:1", "c:c:1"]);
    }

    #[test]
    fn test_source_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        std::fs::create_dir_all(root.join("src/main/java/a")).unwrap();
        std::fs::create_dir_all(root.join("src/main/kotlin")).unwrap();
        std::fs::write(root.join("src/main/java/a/A.java"), "class A {}").unwrap();
        std::fs::write(root.join("src/main/java/B.java"), "class B {}").unwrap();
        std::fs::write(root.join("src/main/kotlin/C.kt"), "class C").unwrap();

        let project = Project::new("app", root.clone());
        assert_eq!(project.source_suffixes(), ["java", "kt"]);

        let java = project.find_source_files(&project.source_directories, &["java"]);
        assert_eq!(
            java,
            [root.join("src/main/java/B.java"), root.join("src/main/java/a/A.java")]
        );
    }

    #[test]
    fn test_source_suffixes_missing_dirs() {
        let project = Project::new("app", "/definitely/not/here");
        assert!(project.source_suffixes().is_empty());
    }
}
