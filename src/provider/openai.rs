//! OpenAI Assistants (v2) provider implementation

use super::types::*;
use super::{AssistantProvider, ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection settings for the Assistants API
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub assistant_id: String,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

/// Assistants API client
pub struct OpenAiAssistantsProvider {
    client: Client,
    api_key: String,
    assistant_id: String,
    base_url: String,
}

impl OpenAiAssistantsProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::unknown(format!("Failed to create HTTP client: {e}")))?;

        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            api_key: config.api_key,
            assistant_id: config.assistant_id,
            base_url,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .header("content-type", "application/json")
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ProviderError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::network(format!("Request timeout: {e}"))
            } else if e.is_connect() {
                ProviderError::network(format!("Connection failed: {e}"))
            } else {
                ProviderError::unknown(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            let error = classify_error(status, &body);
            return Err(match retry_after {
                Some(after) => error.with_retry_after(after),
                None => error,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            ProviderError::unknown(format!("Failed to parse response: {e} - body: {body}"))
        })
    }

    async fn run_output(&self, thread: &ThreadHandle, run_id: &str) -> Result<String, ProviderError> {
        let list: MessageList = self
            .send(self.request(
                Method::GET,
                &format!("/threads/{thread}/messages?run_id={run_id}&order=asc"),
            ))
            .await?;

        Ok(list
            .data
            .iter()
            .filter(|m| m.role == "assistant")
            .flat_map(|m| m.content.iter())
            .filter_map(|part| match part {
                MessageContentPart::Text { text } => Some(text.value.as_str()),
                MessageContentPart::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

fn classify_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map_or_else(|_| body.to_string(), |e| e.error.message);

    let kind = ProviderErrorKind::from_status(status.as_u16());
    let message = match kind {
        ProviderErrorKind::Auth => format!("Authentication failed: {message}"),
        ProviderErrorKind::NotFound => format!("Not found: {message}"),
        ProviderErrorKind::RateLimit => format!("Rate limited: {message}"),
        ProviderErrorKind::InvalidRequest => format!("Invalid request: {message}"),
        ProviderErrorKind::ServerError => format!("Server error: {message}"),
        ProviderErrorKind::Network | ProviderErrorKind::Unknown => {
            format!("HTTP {status}: {message}")
        }
    };
    ProviderError::new(kind, message)
}

#[async_trait]
impl AssistantProvider for OpenAiAssistantsProvider {
    async fn create_thread(&self) -> Result<ThreadHandle, ProviderError> {
        let created: IdObject = self
            .send(
                self.request(Method::POST, "/threads")
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(ThreadHandle::new(created.id))
    }

    async fn delete_thread(&self, thread: &ThreadHandle) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .send(self.request(Method::DELETE, &format!("/threads/{thread}")))
            .await?;
        Ok(())
    }

    async fn append_message(&self, thread: &ThreadHandle, text: &str) -> Result<(), ProviderError> {
        let body = CreateMessageBody {
            role: "user",
            content: text,
        };
        let _: IdObject = self
            .send(
                self.request(Method::POST, &format!("/threads/{thread}/messages"))
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread: &ThreadHandle,
        request: &RunRequest,
    ) -> Result<String, ProviderError> {
        let body = CreateRunBody {
            assistant_id: &self.assistant_id,
            additional_instructions: request.additional_instructions.as_deref(),
            max_completion_tokens: request.max_output_tokens,
        };
        let run: IdObject = self
            .send(
                self.request(Method::POST, &format!("/threads/{thread}/runs"))
                    .json(&body),
            )
            .await?;
        Ok(run.id)
    }

    async fn poll_run(
        &self,
        thread: &ThreadHandle,
        run_id: &str,
    ) -> Result<RunSnapshot, ProviderError> {
        let run: RunObject = self
            .send(self.request(Method::GET, &format!("/threads/{thread}/runs/{run_id}")))
            .await?;

        let output = if run.status == RunStatus::Queued {
            String::new()
        } else {
            self.run_output(thread, run_id).await?
        };

        Ok(RunSnapshot {
            status: run.status,
            output,
            usage: run.usage.map(|u| RunUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            failure: run.last_error.map(|e| format!("{}: {}", e.code, e.message)),
        })
    }

    async fn cancel_run(&self, thread: &ThreadHandle, run_id: &str) -> Result<(), ProviderError> {
        let _: IdObject = self
            .send(self.request(
                Method::POST,
                &format!("/threads/{thread}/runs/{run_id}/cancel"),
            ))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "openai-assistants"
    }
}

// Assistants API types

#[derive(Debug, Serialize)]
struct CreateMessageBody<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunBody<'a> {
    assistant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: RunStatus,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    last_error: Option<ApiRunError>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiRunError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    content: Vec<MessageContentPart>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContentPart {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
