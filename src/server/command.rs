//! Commands understood by the daemon socket.
//!
//! Every line a client sends is a JSON object with a `name`. The name picks a
//! handler from [`Commands`]; names nobody registered go to the fallback,
//! which echoes the command back unless the daemon is configured otherwise.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::Context;
use crate::error::CommandError;
use crate::project::{Project, Scope};
use crate::server::socket::Outbox;
use crate::services::{BuildFile, BuildScriptInfo, DependenciesData, DependencyData, ProjectData};

/// Reserved name that stops the daemon.
pub const QUIT: &str = "Quit";
pub const GET_DEPENDENCIES: &str = "GetDependencies";

/// One parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub name: String,
    /// The whole object as received, `name` included.
    pub object: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let object = match serde_json::from_str::<Value>(line)? {
            Value::Object(object) => object,
            _ => return Err(CommandError::NotAnObject(line.to_string())),
        };

        let name = match object.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => return Err(CommandError::MissingName(line.to_string())),
        };

        Ok(Self { name, object })
    }

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut object = Map::new();
        object.insert("name".into(), Value::String(name.clone()));
        Self { name, object }
    }

    pub fn is_quit(&self) -> bool {
        self.name == QUIT
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.object.get(key).and_then(Value::as_str)
    }

    /// Serialized form, one line without the terminator. Keys keep the
    /// order they were received in.
    pub fn to_line(&self) -> String {
        Value::Object(self.object.clone()).to_string()
    }
}

/// Result pushed back to the client for a command. `data` is itself a JSON
/// document, sent as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandData {
    pub command_name: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CommandData {
    pub fn new(command_name: impl Into<String>, data: &impl Serialize) -> Self {
        Self {
            command_name: command_name.into(),
            data: to_json(data),
            error_message: None,
        }
    }

    pub fn failed(command_name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            command_name: command_name.into(),
            data: to_json(&DependenciesData::failed(message.clone())),
            error_message: Some(message),
        }
    }

    pub fn to_line(&self) -> String {
        to_json(self)
    }
}

fn to_json(value: &impl Serialize) -> String {
    // plain structs of strings and options always serialize
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::error!("couldn't serialize outbound data: {e}");
        String::from("{}")
    })
}

/// A handler for one command name.
pub trait Command: Send + Sync {
    fn run(&self, envelope: &CommandEnvelope, ctx: &Arc<Context>, outbox: &Outbox);
}

/// Echoes the received command back: `{"response": "<received JSON>"}`.
pub struct Ping;

impl Command for Ping {
    fn run(&self, envelope: &CommandEnvelope, _: &Arc<Context>, outbox: &Outbox) {
        outbox.send_data(json!({ "response": envelope.to_line() }).to_string());
    }
}

/// Fallback used when echoing unknown commands is switched off.
pub struct Unknown;

impl Command for Unknown {
    fn run(&self, envelope: &CommandEnvelope, _: &Arc<Context>, outbox: &Outbox) {
        tracing::warn!(name = %envelope.name, "unknown command");
        let error = format!("Unknown command: {}", envelope.name);
        outbox.send_data(json!({ "error": error }).to_string());
    }
}

/// Compiles the build file named by `buildFile` and pushes the dependencies
/// of every project it declares, then `{"name": "Quit"}`.
///
/// The work happens on a background thread, so results may arrive after the
/// requesting client went away. They are then queued for the next one.
pub struct GetDependencies;

impl Command for GetDependencies {
    fn run(&self, envelope: &CommandEnvelope, ctx: &Arc<Context>, outbox: &Outbox) {
        let Some(build_file) = envelope.get_str("buildFile").map(Utf8PathBuf::from) else {
            outbox.send_data(
                CommandData::failed(GET_DEPENDENCIES, "buildFile wasn't passed in the command")
                    .to_line(),
            );
            outbox.send_data(CommandEnvelope::new(QUIT).to_line());
            return;
        };

        let ctx = ctx.clone();
        let worker = outbox.clone();
        let spawned = std::thread::Builder::new()
            .name("get-dependencies".into())
            .spawn(move || get_dependencies(&ctx, &worker, build_file));

        if let Err(e) = spawned {
            tracing::error!("couldn't start dependency resolution: {e}");
            outbox.send_data(CommandData::failed(GET_DEPENDENCIES, e.to_string()).to_line());
            outbox.send_data(CommandEnvelope::new(QUIT).to_line());
        }
    }
}

fn get_dependencies(ctx: &Context, outbox: &Outbox, build_file: Utf8PathBuf) {
    tracing::info!(%build_file, "resolving dependencies");
    let files = [BuildFile::new(build_file, "GetDependenciesCommand")];

    let compiled = std::panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.services.build_file_compiler.compile(&files, &mut |info: BuildScriptInfo| {
            if info.projects.is_empty() {
                return;
            }
            let data = match dependencies_of(ctx, &info.projects) {
                Ok(data) => CommandData::new(GET_DEPENDENCIES, &data),
                Err(e) => CommandData::failed(GET_DEPENDENCIES, format!("{e:#}")),
            };
            tracing::debug!(build_file = %info.build_file, "returning build script info");
            outbox.send_data(data.to_line());
        })
    }));

    let failure = match compiled {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(panic) => Some(format!(
            "Build file compilation panicked: {}",
            crate::utils::panic_message(panic.as_ref())
        )),
    };

    if let Some(message) = failure {
        tracing::error!("GetDependencies failed: {message}");
        outbox.send_data(CommandData::failed(GET_DEPENDENCIES, message).to_line());
    }

    outbox.send_data(CommandEnvelope::new(QUIT).to_line());
}

/// Per-project dependency lists, scope by scope, with resolved paths.
fn dependencies_of(ctx: &Context, projects: &[Project]) -> anyhow::Result<DependenciesData> {
    let resolver = &ctx.services.artifact_resolver;
    let mut result = Vec::with_capacity(projects.len());

    for project in projects {
        let mut dependencies = Vec::new();
        for scope in Scope::ALL {
            for dep in project.dependencies_in(scope) {
                dependencies.push(DependencyData {
                    id: dep.id.clone(),
                    scope,
                    path: resolver.resolve(dep)?,
                });
            }
        }
        result.push(ProjectData {
            name: project.name.clone(),
            dependencies,
        });
    }

    Ok(DependenciesData {
        projects: result,
        error_message: None,
    })
}

/// The command dispatch table.
pub struct Commands {
    table: HashMap<String, Arc<dyn Command>>,
    fallback: Arc<dyn Command>,
}

impl Commands {
    /// The built-in table. Unknown names are echoed back when
    /// `echo_unknown` is set and answered with an error otherwise.
    pub fn new(echo_unknown: bool) -> Self {
        let fallback: Arc<dyn Command> = if echo_unknown {
            Arc::new(Ping)
        } else {
            Arc::new(Unknown)
        };

        let mut commands = Self {
            table: HashMap::new(),
            fallback,
        };
        commands.register(GET_DEPENDENCIES, GetDependencies);
        commands
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        command: impl Command + 'static,
    ) -> &mut Self {
        self.table.insert(name.into(), Arc::new(command));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Runs the handler for `envelope`. A panicking handler is logged and
    /// does not take the connection down.
    pub fn dispatch(&self, envelope: &CommandEnvelope, ctx: &Arc<Context>, outbox: &Outbox) {
        let command = self.table.get(&envelope.name).unwrap_or(&self.fallback);
        let ran = std::panic::catch_unwind(AssertUnwindSafe(|| command.run(envelope, ctx, outbox)));

        if let Err(panic) = ran {
            tracing::error!(
                name = %envelope.name,
                "command panicked: {}",
                crate::utils::panic_message(panic.as_ref())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let envelope =
            CommandEnvelope::parse(r#"{"name":"GetDependencies","buildFile":"/p/Build.kt"}"#)
                .unwrap();

        assert_eq!(envelope.name, "GetDependencies");
        assert_eq!(envelope.get_str("buildFile"), Some("/p/Build.kt"));
        assert!(!envelope.is_quit());
        assert!(CommandEnvelope::parse(r#"{"name":"Quit"}"#).unwrap().is_quit());
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(matches!(
            CommandEnvelope::parse("{ nope"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            CommandEnvelope::parse("[1, 2]"),
            Err(CommandError::NotAnObject(_))
        ));

        let err = CommandEnvelope::parse(r#"{"name": 3}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Did not find a name in command: {"name": 3}"#
        );
    }

    #[test]
    fn test_quit_line() {
        assert_eq!(CommandEnvelope::new(QUIT).to_line(), r#"{"name":"Quit"}"#);
    }

    #[test]
    fn test_line_keeps_key_order() {
        let line = r#"{"name":"Zeta","buildFile":"/p/Build.kt","args":{"z":1,"a":2}}"#;
        assert_eq!(CommandEnvelope::parse(line).unwrap().to_line(), line);
    }

    #[test]
    fn test_command_data_wire_shape() {
        let ok = CommandData::new("GetDependencies", &json!({ "projects": [] }));
        assert_eq!(
            ok.to_line(),
            r#"{"commandName":"GetDependencies","data":"{\"projects\":[]}"}"#
        );

        let failed = CommandData::failed("GetDependencies", "boom");
        let value: Value = serde_json::from_str(&failed.to_line()).unwrap();
        assert_eq!(value["errorMessage"], "boom");

        let data: DependenciesData = serde_json::from_str(&failed.data).unwrap();
        assert!(data.projects.is_empty());
        assert_eq!(data.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_table_has_builtin_commands() {
        let commands = Commands::new(true);
        assert!(commands.contains(GET_DEPENDENCIES));
        assert!(!commands.contains(QUIT));
    }
}
