//! Upstream assistant provider abstraction
//!
//! Any provider that can hold a conversation thread, append a message, start a
//! generation run and report incremental output plus token usage fits behind
//! [`AssistantProvider`].

mod error;
mod openai;
mod types;

pub use error::{ProviderError, ProviderErrorKind};
pub use openai::{OpenAiAssistantsProvider, OpenAiConfig};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Capability interface of the upstream model service
#[async_trait]
pub trait AssistantProvider: Send + Sync {
    /// Allocate a fresh, empty conversation thread
    async fn create_thread(&self) -> Result<ThreadHandle, ProviderError>;

    /// Delete a conversation thread
    async fn delete_thread(&self, thread: &ThreadHandle) -> Result<(), ProviderError>;

    /// Attach a user message to the thread
    async fn append_message(&self, thread: &ThreadHandle, text: &str) -> Result<(), ProviderError>;

    /// Start a generation run, returning the run id
    async fn create_run(
        &self,
        thread: &ThreadHandle,
        request: &RunRequest,
    ) -> Result<String, ProviderError>;

    /// Observe the run's status and output so far
    async fn poll_run(&self, thread: &ThreadHandle, run_id: &str)
        -> Result<RunSnapshot, ProviderError>;

    /// Ask the provider to stop a run
    async fn cancel_run(&self, thread: &ThreadHandle, run_id: &str) -> Result<(), ProviderError>;

    /// Provider name for logs
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: AssistantProvider + ?Sized> AssistantProvider for Arc<T> {
    async fn create_thread(&self) -> Result<ThreadHandle, ProviderError> {
        (**self).create_thread().await
    }

    async fn delete_thread(&self, thread: &ThreadHandle) -> Result<(), ProviderError> {
        (**self).delete_thread(thread).await
    }

    async fn append_message(&self, thread: &ThreadHandle, text: &str) -> Result<(), ProviderError> {
        (**self).append_message(thread, text).await
    }

    async fn create_run(
        &self,
        thread: &ThreadHandle,
        request: &RunRequest,
    ) -> Result<String, ProviderError> {
        (**self).create_run(thread, request).await
    }

    async fn poll_run(
        &self,
        thread: &ThreadHandle,
        run_id: &str,
    ) -> Result<RunSnapshot, ProviderError> {
        (**self).poll_run(thread, run_id).await
    }

    async fn cancel_run(&self, thread: &ThreadHandle, run_id: &str) -> Result<(), ProviderError> {
        (**self).cancel_run(thread, run_id).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Logging wrapper for providers
pub struct LoggingProvider {
    inner: Arc<dyn AssistantProvider>,
    name: String,
}

impl LoggingProvider {
    pub fn new(inner: Arc<dyn AssistantProvider>) -> Self {
        let name = inner.name().to_string();
        Self { inner, name }
    }

    fn log_outcome<T>(&self, operation: &str, start: Instant, result: &Result<T, ProviderError>) {
        let duration = start.elapsed();
        match result {
            Ok(_) => {
                tracing::debug!(
                    provider = %self.name,
                    operation,
                    duration_ms = %duration.as_millis(),
                    "Provider call completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    provider = %self.name,
                    operation,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    retry_after_secs = e.retry_after.map(|d| d.as_secs()),
                    "Provider call failed"
                );
            }
        }
    }
}

#[async_trait]
impl AssistantProvider for LoggingProvider {
    async fn create_thread(&self) -> Result<ThreadHandle, ProviderError> {
        let start = Instant::now();
        let result = self.inner.create_thread().await;
        self.log_outcome("create_thread", start, &result);
        if let Ok(thread) = &result {
            tracing::info!(provider = %self.name, thread_id = %thread, "Thread created");
        }
        result
    }

    async fn delete_thread(&self, thread: &ThreadHandle) -> Result<(), ProviderError> {
        let start = Instant::now();
        let result = self.inner.delete_thread(thread).await;
        self.log_outcome("delete_thread", start, &result);
        result
    }

    async fn append_message(&self, thread: &ThreadHandle, text: &str) -> Result<(), ProviderError> {
        let start = Instant::now();
        let result = self.inner.append_message(thread, text).await;
        self.log_outcome("append_message", start, &result);
        result
    }

    async fn create_run(
        &self,
        thread: &ThreadHandle,
        request: &RunRequest,
    ) -> Result<String, ProviderError> {
        let start = Instant::now();
        let result = self.inner.create_run(thread, request).await;
        self.log_outcome("create_run", start, &result);
        if let Ok(run_id) = &result {
            tracing::info!(
                provider = %self.name,
                thread_id = %thread,
                run_id = %run_id,
                max_output_tokens = ?request.max_output_tokens,
                "Run started"
            );
        }
        result
    }

    async fn poll_run(
        &self,
        thread: &ThreadHandle,
        run_id: &str,
    ) -> Result<RunSnapshot, ProviderError> {
        let start = Instant::now();
        let result = self.inner.poll_run(thread, run_id).await;
        self.log_outcome("poll_run", start, &result);
        if let Ok(snapshot) = &result {
            if snapshot.status.is_terminal() {
                tracing::info!(
                    provider = %self.name,
                    run_id = %run_id,
                    status = ?snapshot.status,
                    input_tokens = snapshot.usage.map(|u| u.input_tokens),
                    output_tokens = snapshot.usage.map(|u| u.output_tokens),
                    "Run reached terminal status"
                );
            }
        }
        result
    }

    async fn cancel_run(&self, thread: &ThreadHandle, run_id: &str) -> Result<(), ProviderError> {
        let start = Instant::now();
        let result = self.inner.cancel_run(thread, run_id).await;
        self.log_outcome("cancel_run", start, &result);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}
