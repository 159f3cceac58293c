//! The daemon command socket: line-delimited JSON over TCP, one client at a
//! time.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};

use console::style;

use crate::core::Context;
use crate::error::{CommandError, ServerError};
use crate::server::command::{CommandEnvelope, Commands};

/// Lifecycle of the command socket.
///
/// A client going away leads straight back to `Listening`: the accept loop
/// resumes at once, so there is no separate disconnected state to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    ClientConnected,
    /// Quit was received. Nothing is accepted any more.
    Stopped,
}

/// How a client connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The client sent `Quit`.
    Quit,
    /// The client closed its end.
    Closed,
    /// Reading or writing failed, a timeout included.
    Broken(std::io::Error),
    /// The client sent a line that isn't a command.
    Rejected(CommandError),
}

#[derive(Default)]
struct OutboxState {
    writer: Option<TcpStream>,
    pending: VecDeque<String>,
}

/// Outbound side of the command socket.
///
/// Lines go straight to the connected client, or wait in a queue until the
/// next one connects. Cloning yields another handle to the same queue, which
/// is how background work keeps pushing after its client left.
#[derive(Clone, Default)]
pub struct Outbox {
    state: Arc<Mutex<OutboxState>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends one line to the client, or queues it when nobody is connected.
    /// A failed write counts as a disconnect and the line is queued.
    pub fn send_data(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.lock();

        if let Some(writer) = state.writer.as_mut() {
            match write_line(writer, &line) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("client write failed, queuing from now on: {e}");
                    state.writer = None;
                }
            }
        }

        tracing::debug!("Queuing {line}");
        state.pending.push_back(line);
    }

    pub fn is_connected(&self) -> bool {
        self.lock().writer.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Makes `writer` the current client after flushing the queue to it.
    /// The queue is drained under the same lock that installs the writer,
    /// so no line can slip between the two. On failure the lines not yet
    /// written stay queued and no client is installed.
    pub(crate) fn connect(&self, mut writer: TcpStream) -> std::io::Result<()> {
        let mut state = self.lock();

        if !state.pending.is_empty() {
            tracing::info!(size = state.pending.len(), "Emptying the queue");
        }

        while let Some(line) = state.pending.pop_front() {
            if let Err(e) = write_line(&mut writer, &line) {
                state.pending.push_front(line);
                return Err(e);
            }
        }

        state.writer = Some(writer);
        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        self.lock().writer = None;
    }
}

fn write_line(writer: &mut TcpStream, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// The command socket server.
pub struct DaemonServer {
    ctx: Arc<Context>,
    listener: TcpListener,
    outbox: Outbox,
    commands: Commands,
    state: Arc<Mutex<ServerState>>,
}

impl DaemonServer {
    /// Binds the configured host and port. Port `0` picks a free one.
    pub fn bind(ctx: Arc<Context>) -> Result<Self, ServerError> {
        let address = format!("{}:{}", ctx.config.host, ctx.config.port);
        let listener = TcpListener::bind(&address).map_err(|e| ServerError::Bind(address, e))?;
        let commands = Commands::new(ctx.config.echo_unknown_commands);

        Ok(Self {
            ctx,
            listener,
            outbox: Outbox::new(),
            commands,
            state: Arc::new(Mutex::new(ServerState::Listening)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for pushing lines to the current or next client.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Shared view of the server state, readable after `run` took `self`.
    pub fn state(&self) -> StateHandle {
        StateHandle(self.state.clone())
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Serves clients one after the other until one of them sends `Quit`.
    pub fn run(self) -> Result<(), ServerError> {
        let address = self.local_addr()?;
        tracing::info!("Listening to port {}", style(address.port()).cyan());

        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    continue;
                }
            };

            let peer = stream.peer_addr().ok();
            tracing::info!(peer = ?peer, "client connected");

            match self.serve(stream) {
                Disconnect::Quit => {
                    tracing::info!("Quitting");
                    break;
                }
                Disconnect::Closed => tracing::info!("Client disconnected, resetting"),
                Disconnect::Broken(e) => tracing::info!("Client disconnected, resetting: {e}"),
                Disconnect::Rejected(e) => tracing::error!("{e}"),
            }

            self.set_state(ServerState::Listening);
        }

        self.set_state(ServerState::Stopped);
        Ok(())
    }

    fn serve(&self, stream: TcpStream) -> Disconnect {
        let disconnect = self.read_loop(stream);
        self.outbox.disconnect();
        disconnect
    }

    fn read_loop(&self, stream: TcpStream) -> Disconnect {
        let setup = stream
            .set_read_timeout(self.ctx.config.read_timeout_duration())
            .and_then(|()| stream.set_write_timeout(self.ctx.config.write_timeout_duration()))
            .and_then(|()| stream.try_clone())
            .and_then(|writer| self.outbox.connect(writer));

        if let Err(e) = setup {
            return Disconnect::Broken(e);
        }
        self.set_state(ServerState::ClientConnected);

        for line in BufReader::new(stream).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Disconnect::Broken(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            tracing::debug!("Received from client {line}");
            let envelope = match CommandEnvelope::parse(&line) {
                Ok(envelope) => envelope,
                Err(e) => return Disconnect::Rejected(e),
            };

            if envelope.is_quit() {
                return Disconnect::Quit;
            }
            self.commands.dispatch(&envelope, &self.ctx, &self.outbox);
        }

        Disconnect::Closed
    }
}

/// Read access to a server's state from another thread.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<Mutex<ServerState>>);

impl StateHandle {
    pub fn get(&self) -> ServerState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
