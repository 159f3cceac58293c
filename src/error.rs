use thiserror::Error;

use crate::plugin::Capability;

/// Errors raised while turning a set of task declarations into an execution
/// order. Both variants are configuration errors: they are reported before
/// any task action runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{task}' {relation} unknown task '{reference}'")]
    UnknownTask {
        task: String,
        relation: &'static str,
        reference: String,
    },

    #[error("Requested task '{0}' does not exist")]
    UnknownRequest(String),

    #[error("Task '{0}' is declared more than once")]
    Duplicate(String),

    #[error("Cycle detected between tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Plugin '{plugin}' does not implement the {kind} capability")]
    Unsupported {
        plugin: String,
        kind: Capability,
    },
}

/// Problems with a single line received on the command socket.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Couldn't parse command line as JSON.\n{0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Command is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("Did not find a name in command: {0}")]
    MissingName(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Couldn't bind {0}.\n{1}")]
    Bind(String, std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(camino::Utf8PathBuf, std::io::Error),

    #[error("Invalid config file '{0}'.\n{1}")]
    Parse(camino::Utf8PathBuf, serde_json::Error),
}
