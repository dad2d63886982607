//! Abstracts how the agent receives jobs and reports status back, behind
//! the [`Transport`] trait. The wire protocol itself (GraphQL-over-
//! websocket) is deliberately not part of this trait's contract;
//! [`WebSocketTransport`] is one concrete implementation, chosen because
//! it is what `agent-dispatch`'s reconnect supervisor actually drives,
//! not because the trait requires websockets.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection-level failures the reconnect supervisor should retry:
    /// network blips, the coordinator restarting, a timeout.
    #[error("transport error, retryable: {0}")]
    Transient(String),
    /// Failures retrying will never fix: bad credentials, protocol
    /// version mismatch.
    #[error("transport error, fatal: {0}")]
    Fatal(String),
}

/// A job dispatched to this agent, as received over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job: agent_types::JobSpec,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// A status update sent back to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    JobState {
        job_id: String,
        state: agent_types::JobState,
    },
    StepState {
        job_id: String,
        step_id: String,
        state: agent_types::StepState,
    },
    LogLines {
        job_id: String,
        step_id: String,
        lines: Vec<String>,
    },
}

/// Receives jobs and reports status, independent of the wire protocol in
/// use. `agent-dispatch` is generic over this trait so its reconnect loop
/// can be tested against a fake implementation with no network at all.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Waits for the next dispatched job. `Ok(None)` means the connection
    /// closed cleanly (the coordinator has nothing more for this agent
    /// right now); the dispatch loop treats that the same as a transient
    /// error and reconnects.
    async fn next_job(&mut self) -> Result<Option<JobEnvelope>, TransportError>;

    async fn send_status(&mut self, update: StatusUpdate) -> Result<(), TransportError>;
}

/// Websocket-backed [`Transport`]. Messages are JSON text frames; an
/// incoming frame that fails to parse as a [`JobEnvelope`] is treated as a
/// fatal protocol error rather than silently dropped, since a coordinator
/// and agent that disagree about message shape need a loud failure, not a
/// quiet stall.
pub struct WebSocketTransport {
    url: String,
    token: String,
    stream: Option<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token)
                .parse()
                .map_err(|_| TransportError::Fatal("invalid token header value".to_string()))?,
        );

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_job(&mut self) -> Result<Option<JobEnvelope>, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Transient("not connected".to_string()))?;

        loop {
            match stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Transient(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    let envelope: JobEnvelope = serde_json::from_str(&text)
                        .map_err(|e| TransportError::Fatal(e.to_string()))?;
                    return Ok(Some(envelope));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send_status(&mut self, update: StatusUpdate) -> Result<(), TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Transient("not connected".to_string()))?;
        let text = serde_json::to_string(&update).map_err(|e| TransportError::Fatal(e.to_string()))?;
        stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport {
        pending: Vec<JobEnvelope>,
        sent: Vec<StatusUpdate>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn next_job(&mut self) -> Result<Option<JobEnvelope>, TransportError> {
            Ok(self.pending.pop())
        }

        async fn send_status(&mut self, update: StatusUpdate) -> Result<(), TransportError> {
            self.sent.push(update);
            Ok(())
        }
    }

    fn envelope() -> JobEnvelope {
        JobEnvelope {
            job: agent_types::JobSpec {
                id: "j1".to_string(),
                name: "job".to_string(),
                steps: vec![],
                env: Default::default(),
            },
            variables: Default::default(),
        }
    }

    #[tokio::test]
    async fn fake_transport_round_trips_a_job() {
        let mut transport = FakeTransport {
            pending: vec![envelope()],
            sent: Vec::new(),
        };
        transport.connect().await.unwrap();
        let job = transport.next_job().await.unwrap().unwrap();
        assert_eq!(job.job.id, "j1");

        transport
            .send_status(StatusUpdate::JobState {
                job_id: "j1".to_string(),
                state: agent_types::JobState::Running,
            })
            .await
            .unwrap();
        assert_eq!(transport.sent.len(), 1);
    }
}
