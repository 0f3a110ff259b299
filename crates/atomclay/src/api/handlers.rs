//! API request handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::logs::LogEvent;
use crate::session::Session;
use crate::structure;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Liveness message.
pub async fn root() -> Json<Value> {
    Json(json!({ "message": "AtomClay middleware is running" }))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Reset the workspace and open a fresh agent session.
#[instrument(skip(state))]
pub async fn create_session(State(state): State<AppState>) -> ApiResult<Json<Session>> {
    let session = Session::generate();
    state.sessions.begin_session(&session.session_id).await?;
    state
        .agent
        .create_session(&session.user_id, &session.session_id)
        .await?;

    info!(user_id = %session.user_id, session_id = %session.session_id, "Session created");
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub response: String,
}

/// Deliver one message to an agent session.
#[instrument(skip(state, request))]
pub async fn send_message(
    State(state): State<AppState>,
    request: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<Json<SendMessageResponse>> {
    let Json(request) = request?;
    let response = state
        .agent
        .send_message(&request.user_id, &request.session_id, &request.message)
        .await?;
    Ok(Json(SendMessageResponse { response }))
}

/// Latest structure artifact produced in the workspace.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStructureResponse {
    pub file_name: String,
    pub content: String,
    pub format: String,
    pub modified_at: DateTime<Utc>,
}

#[instrument(skip(state))]
pub async fn get_final_structure(
    State(state): State<AppState>,
) -> ApiResult<Json<FinalStructureResponse>> {
    let file = structure::latest(&state.workspace)
        .await?
        .ok_or_else(|| ApiError::not_found("No structure file found"))?;

    Ok(Json(FinalStructureResponse {
        file_name: file.file_name,
        content: file.content,
        format: file.format,
        modified_at: file.modified,
    }))
}

/// Tail the agent log as server-sent events.
#[instrument(skip(state))]
pub async fn logs_stream(
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state.log_tailer().stream().await?;
    let stream = events.map(|event| Ok(sse_event(event)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.options.keepalive)
            .text("keepalive"),
    ))
}

fn sse_event(event: LogEvent) -> Event {
    match event {
        LogEvent::Line(line) => Event::default().data(single_line(&line)),
        LogEvent::NoLogs => Event::default().comment("No logs found"),
        LogEvent::Error(message) => {
            Event::default().data(format!("Error reading log: {}", single_line(&message)))
        }
    }
}

/// Event data may not carry line breaks.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Replace the JSON settings file with the request body.
#[instrument(skip(state, settings))]
pub async fn set_config(
    State(state): State<AppState>,
    settings: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(settings) = settings?;
    state.workspace.save_settings(&settings).await?;
    Ok(Json(json!({ "message": "Config updated successfully" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    async fn rendered(event: LogEvent) -> String {
        let events = futures::stream::iter([Ok::<_, Infallible>(sse_event(event))]);
        let body = Sse::new(events).into_response().into_body();
        let bytes = axum::body::to_bytes(body, 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_sse_event_wire_format() {
        assert_eq!(
            rendered(LogEvent::Line("step 2".to_string())).await,
            "data: step 2\n\n"
        );
        assert_eq!(rendered(LogEvent::NoLogs).await, ": No logs found\n\n");
        assert_eq!(
            rendered(LogEvent::Error("disk gone\nfor good".to_string())).await,
            "data: Error reading log: disk gone for good\n\n"
        );
    }

    #[test]
    fn test_single_line_strips_breaks() {
        assert_eq!(single_line("a\rb\nc"), "a b c");
        assert_eq!(single_line("plain"), "plain");
    }
}
