//! WebSocket endpoints of the daemon.
//!
//! `/v1/getDependencyGraph?projectRoot=...` (or `buildFile=...`) streams
//! `Progress` envelopes while the dependency data is computed, then sends
//! one `GetDependenciesData` envelope and closes. `/v1/echo` answers every
//! text frame with `Response: <text>`.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::{StatusCode, Uri};
use tungstenite::{Message, WebSocket};

use crate::core::Context;
use crate::error::ServerError;
use crate::events::{BuildEvent, Subscription};
use crate::services::{BuildSources, DependenciesData, Services};

pub const DEPENDENCY_GRAPH_PATH: &str = "/v1/getDependencyGraph";
pub const ECHO_PATH: &str = "/v1/echo";

const PARAMETER_PROJECT_ROOT: &str = "projectRoot";
const PARAMETER_BUILD_FILE: &str = "buildFile";

/// Longest wait for a client to answer the closing handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Envelope sent over the WebSocket. `payload` is a JSON document encoded as
/// a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketCommand {
    pub command_name: String,
    pub payload: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCommand {
    pub progress: Option<i32>,
    pub message: Option<String>,
}

impl ProgressCommand {
    pub const NAME: &str = "Progress";
}

/// Name of the terminal envelope of a dependency graph request.
pub const GET_DEPENDENCIES_DATA: &str = "GetDependenciesData";

/// What a client asked for during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    /// Dependency graph request; `None` when neither parameter was given.
    DependencyGraph(Option<BuildSources>),
    Echo,
}

impl Route {
    fn from_uri(uri: &Uri) -> Option<Self> {
        match uri.path() {
            DEPENDENCY_GRAPH_PATH => {
                let query = uri.query().unwrap_or_default();
                Some(Route::DependencyGraph(build_sources(query)))
            }
            ECHO_PATH => Some(Route::Echo),
            _ => None,
        }
    }
}

/// Reads the first `projectRoot` and `buildFile` values of a query string.
fn build_sources(query: &str) -> Option<BuildSources> {
    let mut project_root = None;
    let mut build_file = None;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            PARAMETER_PROJECT_ROOT if project_root.is_none() => project_root = Some(value),
            PARAMETER_BUILD_FILE if build_file.is_none() => build_file = Some(value),
            _ => {}
        }
    }

    BuildSources::resolve(project_root.as_deref(), build_file.as_deref())
}

/// Accepts WebSocket clients, one thread per connection.
pub struct WebSocketServer {
    ctx: Arc<Context>,
    listener: TcpListener,
}

impl WebSocketServer {
    /// Binds the configured host and WebSocket port. Port `0` picks a free
    /// one.
    pub fn bind(ctx: Arc<Context>) -> Result<Self, ServerError> {
        let address = format!("{}:{}", ctx.config.host, ctx.config.websocket_port);
        let listener = TcpListener::bind(&address).map_err(|e| ServerError::Bind(address, e))?;
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop on its own thread. The loop ends only when the
    /// listener fails.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for stream in self.listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("websocket accept failed: {e}");
                        continue;
                    }
                };

                let ctx = self.ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("websocket-session".into())
                    .spawn(move || handle_connection(ctx, stream));

                if let Err(e) = spawned {
                    tracing::error!("couldn't start websocket session: {e}");
                }
            }
        })
    }
}

fn handle_connection(ctx: Arc<Context>, stream: TcpStream) {
    let timeouts = stream
        .set_read_timeout(ctx.config.read_timeout_duration())
        .and_then(|()| stream.set_write_timeout(ctx.config.write_timeout_duration()));
    if let Err(e) = timeouts {
        tracing::warn!("couldn't configure websocket stream: {e}");
        return;
    }

    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match Route::from_uri(request.uri()) {
            Some(found) => {
                route = Some(found);
                Ok(response)
            }
            None => {
                tracing::warn!(uri = %request.uri(), "no websocket endpoint");
                let body = format!("No endpoint at {}", request.uri().path());
                let mut refusal = ErrorResponse::new(Some(body));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    };

    let socket = match tungstenite::accept_hdr(stream, callback) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!("websocket handshake failed: {e}");
            return;
        }
    };

    match route {
        Some(Route::DependencyGraph(sources)) => {
            get_dependency_graph(&ctx, Session::new(socket), sources)
        }
        Some(Route::Echo) => echo(socket),
        None => {}
    }
}

/// One WebSocket connection. Clones share the connection, so the event
/// listener and the progress callback can both write to it.
#[derive(Clone)]
struct Session {
    socket: Arc<Mutex<WebSocket<TcpStream>>>,
    /// Set once a write failed. Later sends are dropped.
    gone: Arc<AtomicBool>,
}

impl Session {
    fn new(socket: WebSocket<TcpStream>) -> Self {
        Self {
            socket: Arc::new(Mutex::new(socket)),
            gone: Arc::new(AtomicBool::new(false)),
        }
    }

    fn send(&self, command_name: &str, payload: &impl Serialize, error_message: Option<String>) {
        if self.gone.load(Ordering::Relaxed) {
            return;
        }

        let command = WebSocketCommand {
            command_name: command_name.to_string(),
            payload: serde_json::to_string(payload).unwrap_or_default(),
            error_message,
        };
        let text = match serde_json::to_string(&command) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("couldn't serialize {command_name}: {e}");
                return;
            }
        };

        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = socket.send(Message::text(text)) {
            tracing::debug!("websocket client gone: {e}");
            self.gone.store(true, Ordering::Relaxed);
        }
    }

    fn progress(&self, progress: Option<i32>, message: Option<&str>) {
        let command = ProgressCommand {
            progress,
            message: message.map(str::to_string),
        };
        self.send(ProgressCommand::NAME, &command, None);
    }

    /// Starts the closing handshake and waits, at most [`CLOSE_GRACE`], for
    /// the client's answer.
    fn close(&self) {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if socket.close(None).is_err() {
            return;
        }

        let stream = socket.get_ref();
        let grace = match stream.read_timeout() {
            Ok(Some(timeout)) => timeout.min(CLOSE_GRACE),
            _ => CLOSE_GRACE,
        };
        if let Err(e) = stream.set_read_timeout(Some(grace)) {
            tracing::debug!("couldn't bound the closing handshake: {e}");
            return;
        }

        // reading drives the handshake; it ends with ConnectionClosed
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && socket.read().is_ok() {}
    }
}

/// Releases the per-request resources on every exit path: first the
/// collaborator's clean-up hook, then the event listener.
struct CleanUp<'a> {
    services: &'a Services,
    subscription: Option<Subscription>,
}

impl Drop for CleanUp<'_> {
    fn drop(&mut self) {
        let cleaned = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.services.dependency_data.clean_up();
        }));
        if let Err(panic) = cleaned {
            tracing::error!("clean up failed: {}", crate::utils::panic_message(panic.as_ref()));
        }
        drop(self.subscription.take());
    }
}

fn get_dependency_graph(ctx: &Context, session: Session, sources: Option<BuildSources>) {
    let data = match sources {
        Some(sources) => dependencies_data(ctx, &session, &sources),
        None => DependenciesData::failed("buildFile wasn't passed in the query parameter"),
    };

    session.send(GET_DEPENDENCIES_DATA, &data, data.error_message.clone());
    session.close();
}

fn dependencies_data(ctx: &Context, session: &Session, sources: &BuildSources) -> DependenciesData {
    tracing::info!(sources = %sources.path(), "computing dependency graph");

    let forward = session.clone();
    let subscription = ctx.events.subscribe(move |event| match event {
        BuildEvent::ArtifactDownloaded { artifact_id } => {
            forward.progress(None, Some(&format!("Downloaded {artifact_id}")));
        }
    });

    let _cleanup = CleanUp {
        services: &ctx.services,
        subscription: Some(subscription),
    };

    let computed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let projects = ctx.services.project_finder.init_for_build_sources(sources)?;
        tracing::debug!(projects = projects.len(), "projects initialized");

        let listener =
            |progress: Option<i32>, message: Option<&str>| session.progress(progress, message);
        ctx.services
            .dependency_data
            .dependencies_data_for(sources, &listener, true)
    }));

    match computed {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            tracing::error!("dependency graph failed: {e:#}");
            DependenciesData::failed(e.to_string())
        }
        Err(panic) => {
            let message = format!(
                "Dependency computation panicked: {}",
                crate::utils::panic_message(panic.as_ref())
            );
            tracing::error!("dependency graph failed: {message}");
            DependenciesData::failed(message)
        }
    }
}

fn echo(mut socket: WebSocket<TcpStream>) {
    loop {
        match socket.read() {
            Ok(Message::Text(text)) => {
                tracing::debug!("RECEIVED TEXT: {}", text.as_str());
                let reply = Message::text(format!("Response: {}", text.as_str()));
                if let Err(e) = socket.send(reply) {
                    tracing::debug!("echo client gone: {e}");
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => tracing::debug!(len = bytes.len(), "RECEIVED BINARY"),
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "echo session closed");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("echo session ended: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use tungstenite::stream::MaybeTlsStream;

    use super::*;
    use crate::core::Config;
    use crate::events::EventBus;
    use crate::plugin::Registry;
    use crate::project::{Project, Scope};
    use crate::services::{
        DependencyData, DependencyService, ProgressListener, ProjectData, ProjectFinder, Services,
    };

    #[derive(Clone, Copy)]
    enum Mode {
        Succeed,
        Fail,
        Panic,
    }

    /// Announces one download on the bus, reports progress twice and returns
    /// one project.
    struct Graph {
        events: EventBus,
        mode: Mode,
        calls: Arc<Mutex<Vec<&'static str>>>,
        /// Listeners still on the bus whenever `clean_up` ran.
        listeners_at_clean_up: Arc<Mutex<Vec<usize>>>,
    }

    impl DependencyService for Graph {
        fn dependencies_data_for(
            &self,
            sources: &BuildSources,
            progress: &dyn ProgressListener,
            use_graph: bool,
        ) -> anyhow::Result<DependenciesData> {
            assert!(use_graph);
            self.calls.lock().unwrap().push("compute");

            self.events.publish(&BuildEvent::ArtifactDownloaded {
                artifact_id: "com.beust:jcommander:1.48".into(),
            });
            progress.on_progress(Some(50), Some("resolving"));
            progress.on_progress(None, None);

            match self.mode {
                Mode::Succeed => Ok(DependenciesData {
                    projects: vec![ProjectData {
                        name: sources.path().to_string(),
                        dependencies: vec![DependencyData {
                            id: "com.beust:jcommander:1.48".into(),
                            scope: Scope::Compile,
                            path: "/m2/jcommander-1.48.jar".into(),
                        }],
                    }],
                    error_message: None,
                }),
                Mode::Fail => Err(anyhow!("Couldn't resolve org.nope:nope:1")),
                Mode::Panic => panic!("resolver crashed"),
            }
        }

        fn clean_up(&self) {
            self.calls.lock().unwrap().push("clean_up");
            self.listeners_at_clean_up
                .lock()
                .unwrap()
                .push(self.events.listener_count());
        }
    }

    struct Finder;

    impl ProjectFinder for Finder {
        fn init_for_build_sources(&self, sources: &BuildSources) -> anyhow::Result<Vec<Project>> {
            Ok(vec![Project::new("app", sources.path())])
        }
    }

    struct Fixture {
        ctx: Arc<Context>,
        addr: SocketAddr,
        calls: Arc<Mutex<Vec<&'static str>>>,
        listeners_at_clean_up: Arc<Mutex<Vec<usize>>>,
    }

    impl Fixture {
        /// The session's listener was still registered while the clean-up
        /// hook ran, and is gone now.
        fn assert_cleaned_up_in_order(&self) {
            assert_eq!(*self.calls.lock().unwrap(), ["compute", "clean_up"]);
            assert_eq!(*self.listeners_at_clean_up.lock().unwrap(), [1]);
            assert_eq!(self.ctx.events.listener_count(), 0);
        }
    }

    fn start(mode: Mode) -> Fixture {
        start_with(mode, Config::default())
    }

    fn start_with(mode: Mode, config: Config) -> Fixture {
        let events = EventBus::default();
        let calls = Arc::new(Mutex::new(vec![]));
        let listeners_at_clean_up = Arc::new(Mutex::new(vec![]));
        let services = Services::default().project_finder(Finder).dependency_data(Graph {
            events: events.clone(),
            mode,
            calls: calls.clone(),
            listeners_at_clean_up: listeners_at_clean_up.clone(),
        });

        let config = config.websocket_port(0);
        let ctx = Context::with_events(config, Registry::new(), services, events);
        let server = WebSocketServer::bind(ctx.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();

        Fixture {
            ctx,
            addr,
            calls,
            listeners_at_clean_up,
        }
    }

    type Client = WebSocket<MaybeTlsStream<TcpStream>>;

    fn connect(addr: SocketAddr, path: &str) -> Client {
        let (socket, _) = tungstenite::connect(format!("ws://{addr}{path}")).unwrap();
        socket
    }

    /// Every text frame until the server closes the connection.
    fn drain(mut client: Client) -> Vec<WebSocketCommand> {
        let mut received = vec![];
        loop {
            match client.read() {
                Ok(Message::Text(text)) => {
                    received.push(serde_json::from_str(text.as_str()).unwrap())
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        received
    }

    #[test]
    fn test_build_sources_from_query() {
        assert_eq!(
            build_sources("projectRoot=/p&buildFile=/p/kobalt/src/Build.kt"),
            Some(BuildSources::ProjectRoot("/p".into()))
        );
        assert_eq!(
            build_sources("buildFile=%2Fp%2Fkobalt%2Fsrc%2FBuild.kt&buildFile=/other"),
            Some(BuildSources::BuildFile("/p/kobalt/src/Build.kt".into()))
        );
        assert_eq!(build_sources("other=1"), None);
        assert_eq!(build_sources(""), None);
    }

    #[test]
    fn test_routes() {
        let uri: Uri = "/v1/getDependencyGraph?projectRoot=/p".parse().unwrap();
        assert_eq!(
            Route::from_uri(&uri),
            Some(Route::DependencyGraph(Some(BuildSources::ProjectRoot("/p".into()))))
        );

        let uri: Uri = "/v1/echo".parse().unwrap();
        assert_eq!(Route::from_uri(&uri), Some(Route::Echo));

        let uri: Uri = "/v2/whatever".parse().unwrap();
        assert_eq!(Route::from_uri(&uri), None);
    }

    #[test]
    fn test_missing_parameters_get_one_error_envelope() {
        let fixture = start(Mode::Succeed);
        let received = drain(connect(fixture.addr, DEPENDENCY_GRAPH_PATH));

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].command_name, GET_DEPENDENCIES_DATA);
        assert_eq!(
            received[0].error_message.as_deref(),
            Some("buildFile wasn't passed in the query parameter")
        );
        assert!(fixture.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_progress_then_terminal_envelope() {
        let fixture = start(Mode::Succeed);
        let received = drain(connect(
            fixture.addr,
            "/v1/getDependencyGraph?projectRoot=/p",
        ));

        let names: Vec<_> = received.iter().map(|c| c.command_name.as_str()).collect();
        assert_eq!(names, ["Progress", "Progress", "Progress", GET_DEPENDENCIES_DATA]);

        let download: ProgressCommand = serde_json::from_str(&received[0].payload).unwrap();
        assert_eq!(
            download,
            ProgressCommand {
                progress: None,
                message: Some("Downloaded com.beust:jcommander:1.48".into()),
            }
        );
        let half: ProgressCommand = serde_json::from_str(&received[1].payload).unwrap();
        assert_eq!(half.progress, Some(50));
        assert_eq!(received[2].payload, r#"{"progress":null,"message":null}"#);

        let last = &received[3];
        assert_eq!(last.error_message, None);
        let data: DependenciesData = serde_json::from_str(&last.payload).unwrap();
        assert_eq!(data.projects[0].name, "/p");
        assert_eq!(data.projects[0].dependencies[0].scope, Scope::Compile);

        fixture.assert_cleaned_up_in_order();
    }

    #[test]
    fn test_no_forwarding_after_close() {
        let fixture = start(Mode::Succeed);
        drain(connect(fixture.addr, "/v1/getDependencyGraph?buildFile=/p/Build.kt"));

        let forwarded = Arc::new(Mutex::new(0));
        let counter = forwarded.clone();
        let _counting = fixture.ctx.events.subscribe(move |_| *counter.lock().unwrap() += 1);

        fixture.ctx.events.publish(&BuildEvent::ArtifactDownloaded {
            artifact_id: "late:late:1".into(),
        });

        // only the counting listener saw it, the session's is gone
        assert_eq!(*forwarded.lock().unwrap(), 1);
        assert_eq!(fixture.ctx.events.listener_count(), 1);
    }

    #[test]
    fn test_failure_becomes_error_message_after_clean_up() {
        for (mode, expected) in [
            (Mode::Fail, "Couldn't resolve org.nope:nope:1"),
            (Mode::Panic, "Dependency computation panicked: resolver crashed"),
        ] {
            let fixture = start(mode);
            let received = drain(connect(fixture.addr, "/v1/getDependencyGraph?projectRoot=/p"));

            let last = received.last().unwrap();
            assert_eq!(last.command_name, GET_DEPENDENCIES_DATA);
            assert_eq!(last.error_message.as_deref(), Some(expected));
            let terminal = received
                .iter()
                .filter(|c| c.command_name == GET_DEPENDENCIES_DATA)
                .count();
            assert_eq!(terminal, 1);

            fixture.assert_cleaned_up_in_order();
        }
    }

    #[test]
    fn test_silent_client_released_after_close_grace() {
        let fixture = start_with(Mode::Succeed, Config::default().read_timeout(None));
        let mut client = connect(fixture.addr, "/v1/getDependencyGraph?projectRoot=/p");

        // read raw bytes so the close frame is never answered
        let MaybeTlsStream::Plain(stream) = client.get_mut() else {
            panic!("expected a plain stream");
        };
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => panic!("server kept the connection open: {e}"),
            }
        }

        assert!(started.elapsed() < Duration::from_secs(10));
        fixture.assert_cleaned_up_in_order();
    }

    #[test]
    fn test_echo_endpoint() {
        let fixture = start(Mode::Succeed);
        let mut client = connect(fixture.addr, ECHO_PATH);

        client.send(Message::text("hello")).unwrap();
        match client.read().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "Response: hello"),
            other => panic!("unexpected {other:?}"),
        }
        client.close(None).unwrap();
    }

    #[test]
    fn test_unknown_path_refused() {
        let fixture = start(Mode::Succeed);
        let err = tungstenite::connect(format!("ws://{}/v1/nothing", fixture.addr)).unwrap_err();

        match err {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
