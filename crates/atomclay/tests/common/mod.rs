//! Test utilities and common setup.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use atomclay::agent::{AgentClient, AgentConfig};
use atomclay::api::{self, AppState, ServerOptions};
use atomclay::logs::LogStreamConfig;
use atomclay::workspace::{WorkspaceConfig, WorkspaceManager};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Chunks streamed back by the stub agent for every successful run.
pub const RUN_CHUNKS: [&str; 2] = ["{\"event\":\"start\"}\n", "{\"event\":\"done\"}\n"];

/// The only chunk sent for a run with `newMessage: "crash mid-run"` before
/// the stub agent drops the stream.
pub const TRUNCATED_CHUNK: &str = "{\"event\":\"start\"}\n";

/// Base URL with nothing listening.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:9";

/// Requests observed by the stub agent.
#[derive(Clone, Default)]
pub struct StubCalls {
    pub sessions: Arc<AtomicUsize>,
    pub runs: Arc<AtomicUsize>,
    pub last_run: Arc<Mutex<Option<Value>>>,
}

impl StubCalls {
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

/// In-process stand-in for the agent server.
pub struct StubAgent {
    pub base_url: String,
    pub calls: StubCalls,
}

async fn stub_session(
    State(calls): State<StubCalls>,
    Path((_app, _user, session)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    calls.sessions.fetch_add(1, Ordering::SeqCst);

    if let Some(message) = body.get("message").and_then(Value::as_str) {
        return Json(json!({ "response": format!("echo: {message}") })).into_response();
    }
    if session == "s_exists" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Session already exists" })),
        )
            .into_response();
    }
    Json(json!({ "id": session })).into_response()
}

async fn stub_run(State(calls): State<StubCalls>, Json(body): Json<Value>) -> Response {
    calls.runs.fetch_add(1, Ordering::SeqCst);
    let message = body["newMessage"].as_str().unwrap_or_default().to_string();
    *calls.last_run.lock().await = Some(body);

    match message.as_str() {
        "fail" => (StatusCode::INTERNAL_SERVER_ERROR, "agent crashed").into_response(),
        "crash mid-run" => {
            let first = stream::iter([Ok::<_, io::Error>(TRUNCATED_CHUNK.to_string())]);
            let crash = stream::once(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Err(io::Error::other("agent died"))
            });
            ndjson(Body::from_stream(first.chain(crash)))
        }
        _ => {
            let chunks = RUN_CHUNKS.map(|chunk| Ok::<_, Infallible>(chunk.to_string()));
            ndjson(Body::from_stream(stream::iter(chunks)))
        }
    }
}

fn ndjson(body: Body) -> Response {
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(body)
        .unwrap()
}

/// Start the stub agent on an ephemeral port.
pub async fn spawn_stub_agent() -> StubAgent {
    let calls = StubCalls::default();
    let app = Router::new()
        .route(
            "/apps/{app}/users/{user}/sessions/{session}",
            post(stub_session),
        )
        .route("/run", post(stub_run))
        .with_state(calls.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubAgent {
        base_url: format!("http://{addr}"),
        calls,
    }
}

/// A router over a temporary project root.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub project: TempDir,
}

impl TestApp {
    pub fn workspace(&self) -> &WorkspaceManager {
        &self.state.workspace
    }
}

/// Create a test application talking to the agent at `agent_url`.
pub async fn test_app(agent_url: &str) -> TestApp {
    let project = TempDir::new().unwrap();
    let workspace = WorkspaceManager::new(WorkspaceConfig::under(project.path()));
    workspace.ensure_dirs().await.unwrap();

    let agent = AgentClient::new(AgentConfig {
        base_url: agent_url.to_string(),
        session_timeout: Duration::from_secs(2),
        ..AgentConfig::default()
    })
    .unwrap();

    let options = ServerOptions {
        logs: LogStreamConfig {
            wait_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        },
        ..ServerOptions::default()
    };

    let state = AppState::new(workspace, agent, options, CancellationToken::new());
    TestApp {
        router: api::create_router(state.clone()),
        state,
        project,
    }
}
