//! The build daemon: a line-oriented command socket for tools that drive
//! builds, and WebSocket endpoints for IDEs.

mod command;
mod session;
mod socket;

use std::sync::Arc;

use console::style;

use crate::core::Context;
use crate::error::ServerError;

pub use crate::server::command::{
    Command, CommandData, CommandEnvelope, Commands, GET_DEPENDENCIES, GetDependencies, Ping, QUIT,
};
pub use crate::server::session::{
    DEPENDENCY_GRAPH_PATH, ECHO_PATH, GET_DEPENDENCIES_DATA, ProgressCommand, WebSocketCommand,
    WebSocketServer,
};
pub use crate::server::socket::{DaemonServer, Disconnect, Outbox, ServerState, StateHandle};

/// Both daemon endpoints, started together.
pub struct Daemon;

impl Daemon {
    /// Binds the command socket and the WebSocket port, serves WebSocket
    /// sessions in the background and the command socket on the calling
    /// thread. Returns once a client sends `Quit`.
    pub fn start(ctx: Arc<Context>) -> Result<(), ServerError> {
        let websocket = WebSocketServer::bind(ctx.clone())?;
        let server = DaemonServer::bind(ctx)?;

        eprintln!(
            "Running {} daemon, commands on {}, websocket on {}.",
            style("kiln").red(),
            style(server.local_addr()?).blue(),
            style(websocket.local_addr()?).blue(),
        );

        // the acceptor thread is not joined; it goes away with the process
        let _acceptor = websocket.spawn();
        server.run()
    }
}
