//! Agent HTTP client.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::error::{AgentError, AgentResult};
use super::types::{MessageReply, MessageRequest, SessionProvision};

/// Connection settings for the agent server.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL (e.g., "http://localhost:8000").
    pub base_url: String,
    /// Application name in session URLs.
    pub app_name: String,
    /// Timeout of session creation and message calls. Runs are unbounded.
    pub session_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            app_name: "agentom".to_string(),
            session_timeout: Duration::from_secs(10),
        }
    }
}

/// Client for communicating with the agent server.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
    config: AgentConfig,
}

impl AgentClient {
    /// Create a new agent client.
    pub fn new(mut config: AgentConfig) -> AgentResult<Self> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn session_url(&self, user_id: &str, session_id: &str) -> String {
        format!(
            "{}/apps/{}/users/{}/sessions/{}",
            self.config.base_url,
            urlencoding::encode(&self.config.app_name),
            urlencoding::encode(user_id),
            urlencoding::encode(session_id),
        )
    }

    /// Create a session, failing on any non-success answer.
    pub async fn create_session(&self, user_id: &str, session_id: &str) -> AgentResult<()> {
        let url = self.session_url(user_id, session_id);
        let response = self
            .client
            .post(&url)
            .timeout(self.config.session_timeout)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| AgentError::connection(&url, e))?;

        Self::check_status(response).await?;
        info!(user_id, session_id, "Created agent session");
        Ok(())
    }

    /// Create a session if the agent does not know it yet.
    ///
    /// Never fails: the outcome is reported and logged.
    pub async fn ensure_session(&self, user_id: &str, session_id: &str) -> SessionProvision {
        match self.create_session(user_id, session_id).await {
            Ok(()) => SessionProvision::Created,
            Err(AgentError::Status { status, body })
                if status == StatusCode::CONFLICT
                    || (status == StatusCode::BAD_REQUEST && body.contains("already exists")) =>
            {
                debug!(session_id, "Agent session already exists");
                SessionProvision::AlreadyExists
            }
            Err(err) => {
                warn!(session_id, error = %err, "Could not provision agent session, continuing");
                SessionProvision::Unreachable
            }
        }
    }

    /// Deliver a single message to a session and return the agent's reply.
    pub async fn send_message(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> AgentResult<String> {
        let url = self.session_url(user_id, session_id);
        let response = self
            .client
            .post(&url)
            .timeout(self.config.session_timeout)
            .json(&MessageRequest { message })
            .send()
            .await
            .map_err(|e| AgentError::connection(&url, e))?;

        let reply: MessageReply = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::ParseError(e.to_string()))?;
        Ok(reply.into_text())
    }

    /// Start a run and return the response once its status is known.
    ///
    /// The body is not read: the caller relays it as it arrives. There is no
    /// overall timeout on runs.
    pub async fn run(&self, body: &Value) -> AgentResult<Response> {
        let url = format!("{}/run", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::connection(&url, e))?;

        Self::check_status(response).await
    }

    async fn check_status(response: Response) -> AgentResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Status { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_trims_base_url() {
        let client = AgentClient::new(AgentConfig {
            base_url: "http://localhost:8000/".to_string(),
            ..AgentConfig::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_session_url_escapes_segments() {
        let client = AgentClient::new(AgentConfig::default()).unwrap();
        assert_eq!(
            client.session_url("u_1", "s 2/x"),
            "http://localhost:8000/apps/agentom/users/u_1/sessions/s%202%2Fx"
        );
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_reported() {
        let client = AgentClient::new(AgentConfig {
            // Port 9 (discard) is closed on test machines.
            base_url: "http://127.0.0.1:9".to_string(),
            session_timeout: Duration::from_secs(2),
            ..AgentConfig::default()
        })
        .unwrap();

        assert_eq!(
            client.ensure_session("u", "s").await,
            SessionProvision::Unreachable
        );
        assert!(matches!(
            client.run(&json!({})).await,
            Err(AgentError::ConnectionFailed { .. })
        ));
    }
}
