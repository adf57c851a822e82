//! HTTP clients for the completion and transcription collaborators.

use std::path::Path;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Shown in the chat log when the assistant cannot answer.
pub const ASSIST_PLACEHOLDER: &str =
    "I'm sorry, I'm having trouble processing your request right now.";

#[derive(Debug, Error)]
pub enum AssistError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("collaborator returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("collaborator response carried no {0}")]
    Empty(&'static str),
    #[error("failed to read audio: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    message: &'a str,
    chat_history: &'a [ChatTurn],
}

#[derive(Debug, Default, Deserialize)]
struct CollaboratorReply {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn read_reply(response: reqwest::Response) -> Result<CollaboratorReply, AssistError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<CollaboratorReply>().await?);
    }
    let reply = response
        .json::<CollaboratorReply>()
        .await
        .unwrap_or_default();
    Err(AssistError::Status {
        status: status.as_u16(),
        message: reply.error.unwrap_or_else(|| status.to_string()),
    })
}

#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl CompletionClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub async fn complete(&self, message: &str, history: &[ChatTurn]) -> Result<String, AssistError> {
        debug!(target: "tandem::assist", turns = history.len(), "requesting completion");
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&CompletionRequest {
                message,
                chat_history: history,
            })
            .send()
            .await?;
        read_reply(response)
            .await?
            .response
            .ok_or(AssistError::Empty("response"))
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl TranscriptionClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String, AssistError> {
        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str("audio/wav")?;
        let form = Form::new().part("audio", part);
        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await?;
        read_reply(response)
            .await?
            .text
            .ok_or(AssistError::Empty("text"))
    }

    pub async fn transcribe_file(&self, path: &Path) -> Result<String, AssistError> {
        let audio = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());
        self.transcribe(audio, &name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn chat(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let message = body["message"].as_str().unwrap_or_default();
        if message.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Message is required" })),
            );
        }
        let turns = body["chatHistory"].as_array().map(Vec::len).unwrap_or(0);
        (
            StatusCode::OK,
            Json(json!({ "response": format!("{message} ({turns} turns)") })),
        )
    }

    async fn transcribe(mut form: Multipart) -> Json<Value> {
        while let Ok(Some(field)) = form.next_field().await {
            if field.name() == Some("audio") {
                let bytes = field.bytes().await.unwrap_or_default();
                return Json(json!({ "text": format!("{} bytes", bytes.len()) }));
            }
        }
        Json(json!({ "error": "No audio file provided" }))
    }

    async fn stub_server() -> Url {
        let app = Router::new()
            .route("/api/chat", post(chat))
            .route("/api/transcribe", post(transcribe));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[test_timeout::timeout]
    async fn completion_round_trip_and_error_payload() {
        let base = stub_server().await;
        let client = CompletionClient::new(base.join("api/chat").unwrap());
        let history = vec![ChatTurn {
            role: "user".into(),
            content: "hello".into(),
        }];
        assert_eq!(
            client.complete("hi", &history).await.unwrap(),
            "hi (1 turns)"
        );

        match client.complete("", &history).await {
            Err(AssistError::Status { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Message is required");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    async fn transcription_sends_audio_part() {
        let base = stub_server().await;
        let client = TranscriptionClient::new(base.join("api/transcribe").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.wav");
        std::fs::write(&path, vec![0u8; 44]).unwrap();
        assert_eq!(client.transcribe_file(&path).await.unwrap(), "44 bytes");
    }
}
