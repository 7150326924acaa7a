//! Caller → upstream thread resolution
//!
//! The stored mapping is the single source of truth for which upstream thread a
//! caller's next message goes to. Create-if-absent and reset run under a
//! per-caller lock so a caller never ends up with two live threads.

use crate::error::OrchestratorError;
use crate::keyed_lock::KeyedLocks;
use crate::provider::{AssistantProvider, ThreadHandle};
use crate::runtime::ThreadMapStore;

pub struct ThreadStore<S: ThreadMapStore, P: AssistantProvider> {
    store: S,
    provider: P,
    locks: KeyedLocks,
}

impl<S: ThreadMapStore, P: AssistantProvider> ThreadStore<S, P> {
    pub fn new(store: S, provider: P) -> Self {
        Self {
            store,
            provider,
            locks: KeyedLocks::new(),
        }
    }

    /// The caller's current thread, without creating one
    pub async fn current(&self, caller_id: &str) -> Result<Option<ThreadHandle>, OrchestratorError> {
        let mapping = self
            .store
            .get_thread(caller_id)
            .await
            .map_err(OrchestratorError::Storage)?;
        Ok(mapping.map(|m| ThreadHandle::new(m.thread_id)))
    }

    /// Existing thread for the caller, or a freshly created and persisted one
    pub async fn resolve_or_create(&self, caller_id: &str) -> Result<ThreadHandle, OrchestratorError> {
        let _guard = self.locks.lock(caller_id).await;

        if let Some(handle) = self.current(caller_id).await? {
            return Ok(handle);
        }

        let handle = self
            .provider
            .create_thread()
            .await
            .map_err(OrchestratorError::from)?;
        self.persist(caller_id, &handle).await?;

        tracing::info!(caller_id, thread_id = %handle, "Created thread for caller");
        Ok(handle)
    }

    /// Replace the caller's thread with a new, empty one.
    ///
    /// The new thread is created before the mapping changes, so a provider
    /// outage leaves the old mapping in place. Deleting the old thread upstream
    /// is best-effort.
    pub async fn reset(&self, caller_id: &str) -> Result<ThreadHandle, OrchestratorError> {
        let _guard = self.locks.lock(caller_id).await;

        let previous = self.current(caller_id).await?;
        let handle = self
            .provider
            .create_thread()
            .await
            .map_err(OrchestratorError::from)?;
        self.persist(caller_id, &handle).await?;

        if let Some(previous) = previous {
            if let Err(e) = self.provider.delete_thread(&previous).await {
                tracing::warn!(
                    caller_id,
                    thread_id = %previous,
                    error = %e,
                    "Failed to delete previous thread; continuing with new thread"
                );
            }
        }

        tracing::info!(caller_id, thread_id = %handle, "Reset thread for caller");
        Ok(handle)
    }

    /// Store the mapping; a thread that cannot be recorded is deleted upstream
    async fn persist(&self, caller_id: &str, handle: &ThreadHandle) -> Result<(), OrchestratorError> {
        let Err(e) = self.store.put_thread(caller_id, handle.as_str()).await else {
            return Ok(());
        };
        tracing::error!(caller_id, thread_id = %handle, error = %e, "Failed to store thread mapping");
        if let Err(delete_err) = self.provider.delete_thread(handle).await {
            tracing::warn!(
                caller_id,
                thread_id = %handle,
                error = %delete_err,
                "Failed to delete unrecorded thread"
            );
        }
        Err(OrchestratorError::Storage(e))
    }
}
