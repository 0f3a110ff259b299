//! Streamed relay of agent runs.

use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::structure::{self, StructurePayload};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Forward a run request to the agent and relay its response as it arrives.
///
/// Everything that can fail cleanly happens before the response starts:
/// validation, the session check, persisting the uploaded structure and the
/// upstream status. Once relaying has begun, an upstream error truncates the
/// body.
#[instrument(skip(state, body))]
pub async fn run(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(mut body) = body?;
    let Some(request) = body.as_object_mut() else {
        return Err(ApiError::bad_request("request body must be a JSON object"));
    };

    let upload = take_structure(request)?;
    let user_id = required_str(request, "userId")?;
    let session_id = required_str(request, "sessionId")?;

    let transition = state.sessions.check_new_session(&session_id).await?;
    if transition.is_new() {
        info!(session_id = %session_id, "Workspace reset for new session");
    }

    if let Some(payload) = upload {
        structure::persist(&state.workspace, &payload).await?;
    }

    let provision = state.agent.ensure_session(&user_id, &session_id).await;
    debug!(?provision, "Agent session provisioned");

    let upstream = state.agent.run(&body).await?;
    relay(upstream)
}

/// Remove the `structure` field, which is for this service only.
fn take_structure(request: &mut Map<String, Value>) -> ApiResult<Option<StructurePayload>> {
    match request.remove("structure") {
        None | Some(Value::Null) => {
            debug!("No structure payload in request");
            Ok(None)
        }
        Some(raw) => {
            let payload: StructurePayload = serde_json::from_value(raw)
                .map_err(|e| ApiError::bad_request(format!("invalid structure payload: {e}")))?;
            debug!(file_name = ?payload.file_name, "Received structure payload");
            Ok(Some(payload))
        }
    }
}

/// A non-empty string id. Non-zero numbers are accepted in their decimal
/// form; any other value is rejected.
fn required_str(request: &Map<String, Value>, key: &str) -> ApiResult<String> {
    request
        .get(key)
        .and_then(|value| match value {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ApiError::bad_request("userId and sessionId are required"))
        .inspect_err(|_| warn!(field = key, "Run request rejected"))
}

fn relay(upstream: reqwest::Response) -> ApiResult<Response> {
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let stream = upstream.bytes_stream().inspect_err(|err| {
        warn!(error = %err, "Agent stream failed mid-relay, truncating response");
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| {
            error!("Failed to build relay response: {:?}", e);
            ApiError::internal("failed to build relay response")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_take_structure_strips_field() {
        let mut request = object(json!({
            "userId": "u",
            "structure": { "content": "DATA", "fileName": "a.cif", "atomCount": "2" },
        }));
        let payload = take_structure(&mut request).unwrap().unwrap();
        assert_eq!(payload.content.as_deref(), Some("DATA"));
        assert!(!request.contains_key("structure"));

        let mut request = object(json!({ "structure": null }));
        assert!(take_structure(&mut request).unwrap().is_none());

        let mut request = object(json!({ "structure": { "content": 5 } }));
        assert!(matches!(
            take_structure(&mut request),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_required_str() {
        let request = object(json!({
            "userId": "u_1",
            "sessionId": "",
            "n": 3,
            "zero": 0,
            "flag": true,
        }));
        assert_eq!(required_str(&request, "userId").unwrap(), "u_1");
        assert_eq!(required_str(&request, "n").unwrap(), "3");
        assert!(required_str(&request, "sessionId").is_err());
        assert!(required_str(&request, "zero").is_err());
        assert!(required_str(&request, "flag").is_err());
        assert!(required_str(&request, "missing").is_err());
    }
}
