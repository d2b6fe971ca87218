//! Sandbox pool management.
//!
//! The pool keeps at most one long-lived sandbox per runtime. Sandboxes are created lazily on
//! first use, adopted from a previous server run when one is still around, revived when they are
//! found stopped or paused, and evicted and recreated when they disappear underneath the pool.
//!
//! Each runtime has its own async slot lock, so simultaneous first-use from several sessions
//! results in exactly one image pull and one sandbox while different runtimes never wait on each
//! other.

use std::{collections::BTreeMap, sync::Arc};

use getset::Getters;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    config::{Runtime, RuntimeRegistry, SandboxLimits},
    engine::{SandboxEngine, SandboxSpec, SandboxState},
    ExecboxError, ExecboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reference to the pooled sandbox of one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxHandle {
    /// Engine-assigned sandbox identity.
    id: String,

    /// The runtime this sandbox serves.
    runtime: String,

    /// The image the sandbox was created from.
    image: String,
}

/// Owns the per-runtime sandboxes.
pub struct SandboxPool {
    engine: Arc<dyn SandboxEngine>,
    registry: Arc<RuntimeRegistry>,
    limits: SandboxLimits,
    slots: BTreeMap<String, Mutex<Option<SandboxHandle>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxHandle {
    /// Creates a new handle.
    pub fn new(
        id: impl Into<String>,
        runtime: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            runtime: runtime.into(),
            image: image.into(),
        }
    }
}

impl SandboxPool {
    /// Creates an empty pool with one slot per registered runtime.
    pub fn new(
        engine: Arc<dyn SandboxEngine>,
        registry: Arc<RuntimeRegistry>,
        limits: SandboxLimits,
    ) -> Self {
        let slots = registry
            .ids()
            .map(|id| (id.to_string(), Mutex::new(None)))
            .collect();

        Self {
            engine,
            registry,
            limits,
            slots,
        }
    }

    /// The engine sandboxes are managed with.
    pub fn engine(&self) -> &Arc<dyn SandboxEngine> {
        &self.engine
    }

    /// The runtime registry the pool serves.
    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    /// Returns a running sandbox for `runtime_id`, creating it if needed.
    ///
    /// Repeated calls return the same sandbox for as long as it stays healthy. Fails with
    /// [`ExecboxError::UnsupportedRuntime`] before touching the engine when the runtime is unknown.
    pub async fn acquire(&self, runtime_id: &str) -> ExecboxResult<SandboxHandle> {
        let runtime = self.registry.get(runtime_id)?;
        let slot = self
            .slots
            .get(runtime_id)
            .ok_or_else(|| ExecboxError::UnsupportedRuntime(runtime_id.to_string()))?;

        let mut slot = slot.lock().await;

        if let Some(handle) = slot.as_ref() {
            match self.ensure_running(handle.get_id()).await {
                Ok(()) => return Ok(handle.clone()),
                Err(ExecboxError::SandboxNotFound(_)) => {
                    tracing::warn!(
                        "sandbox {} for {} disappeared, recreating",
                        handle.get_id(),
                        runtime_id
                    );
                    *slot = None;
                }
                Err(e) => {
                    tracing::warn!(
                        "sandbox {} for {} is unhealthy, evicting: {}",
                        handle.get_id(),
                        runtime_id,
                        e
                    );
                    *slot = None;
                    return Err(unavailable(runtime_id, e));
                }
            }
        }

        let handle = match self.discover(runtime).await? {
            Some(handle) => handle,
            None => self
                .create(runtime)
                .await
                .map_err(|e| unavailable(runtime_id, e))?,
        };

        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The sandboxes currently held by the pool.
    pub async fn snapshot(&self) -> Vec<SandboxHandle> {
        let mut handles = Vec::new();
        for slot in self.slots.values() {
            if let Some(handle) = slot.lock().await.as_ref() {
                handles.push(handle.clone());
            }
        }
        handles
    }

    /// Stops and removes every pooled sandbox. Only used when the server shuts down.
    pub async fn shutdown_all(&self) {
        for (runtime_id, slot) in &self.slots {
            let Some(handle) = slot.lock().await.take() else {
                continue;
            };

            tracing::info!("removing sandbox {} for {}", handle.get_id(), runtime_id);
            if let Err(e) = self.engine.remove_sandbox(handle.get_id()).await {
                tracing::warn!("failed to remove sandbox {}: {}", handle.get_id(), e);
            }
        }
    }

    /// Looks for a sandbox left over from an earlier run and brings it back up.
    async fn discover(&self, runtime: &Runtime) -> ExecboxResult<Option<SandboxHandle>> {
        let candidates = self
            .engine
            .list_sandboxes(runtime.get_id())
            .await
            .map_err(|e| unavailable(runtime.get_id(), e))?;

        for candidate in candidates {
            match self.ensure_running(&candidate.id).await {
                Ok(()) => {
                    tracing::info!(
                        "reusing existing sandbox {} for {}",
                        candidate.id,
                        runtime.get_id()
                    );
                    return Ok(Some(SandboxHandle::new(
                        candidate.id,
                        runtime.get_id(),
                        candidate.image,
                    )));
                }
                Err(e) => {
                    tracing::warn!("skipping sandbox {}: {}", candidate.id, e);
                }
            }
        }

        Ok(None)
    }

    async fn create(&self, runtime: &Runtime) -> ExecboxResult<SandboxHandle> {
        tracing::info!(
            "creating sandbox for {} from {}",
            runtime.get_id(),
            runtime.get_image()
        );

        self.engine.ensure_image(runtime.get_image()).await?;

        let spec = SandboxSpec {
            runtime: runtime.get_id().clone(),
            image: runtime.get_image().clone(),
            limits: self.limits,
        };
        let id = self.engine.create_sandbox(&spec).await?;
        self.engine.start_sandbox(&id).await?;

        tracing::info!("sandbox {} for {} is running", id, runtime.get_id());
        Ok(SandboxHandle::new(id, runtime.get_id(), runtime.get_image()))
    }

    async fn ensure_running(&self, sandbox_id: &str) -> ExecboxResult<()> {
        match self.engine.inspect_sandbox(sandbox_id).await? {
            SandboxState::Running => Ok(()),
            SandboxState::Paused => self.engine.unpause_sandbox(sandbox_id).await,
            SandboxState::Stopped | SandboxState::Starting => {
                self.engine.start_sandbox(sandbox_id).await
            }
            SandboxState::Absent => Err(ExecboxError::SandboxNotFound(sandbox_id.to_string())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn unavailable(runtime_id: &str, error: ExecboxError) -> ExecboxError {
    match error {
        e @ ExecboxError::SandboxUnavailable { .. } => e,
        e => ExecboxError::SandboxUnavailable {
            runtime: runtime_id.to_string(),
            reason: e.to_string(),
        },
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::MemoryEngine;

    fn pool_with(engine: &MemoryEngine) -> SandboxPool {
        SandboxPool::new(
            Arc::new(engine.clone()),
            Arc::new(RuntimeRegistry::default()),
            SandboxLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_healthy_sandbox() {
        let engine = MemoryEngine::new();
        let pool = pool_with(&engine);

        let first = pool.acquire("python").await.unwrap();
        let second = pool.acquire("python").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.get_image(), "python:3.10-slim");
        assert_eq!(engine.creations(), 1);
        assert_eq!(engine.pulls(), 1);
        assert_eq!(engine.state_of(first.get_id()), SandboxState::Running);
    }

    #[tokio::test]
    async fn test_unknown_runtime_touches_nothing() {
        let engine = MemoryEngine::new();
        let pool = pool_with(&engine);

        let err = pool.acquire("ruby").await.unwrap_err();
        assert!(matches!(err, ExecboxError::UnsupportedRuntime(id) if id == "ruby"));
        assert_eq!(engine.creations(), 0);
        assert_eq!(engine.pulls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_first_use_creates_one_sandbox() {
        let engine = MemoryEngine::new().with_create_delay(Duration::from_millis(20));
        let pool = Arc::new(pool_with(&engine));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire("javascript").await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().get_id().clone());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(engine.creations(), 1);
        assert_eq!(engine.pulls(), 1);
    }

    #[tokio::test]
    async fn test_runtimes_sharing_an_image_get_separate_sandboxes() {
        let engine = MemoryEngine::new();
        let pool = pool_with(&engine);

        let c = pool.acquire("c").await.unwrap();
        let cpp = pool.acquire("cpp").await.unwrap();

        assert_ne!(c.get_id(), cpp.get_id());
        assert_eq!(engine.creations(), 2);
        assert_eq!(engine.pulls(), 1);
    }

    #[tokio::test]
    async fn test_removed_sandbox_is_evicted_and_recreated() {
        let engine = MemoryEngine::new();
        let pool = pool_with(&engine);

        let first = pool.acquire("python").await.unwrap();
        engine.remove_externally(first.get_id());

        let second = pool.acquire("python").await.unwrap();
        assert_ne!(first.get_id(), second.get_id());
        assert_eq!(engine.creations(), 2);
        assert_eq!(pool.snapshot().await, vec![second]);
    }

    #[tokio::test]
    async fn test_stopped_and_paused_sandboxes_are_revived() {
        let engine = MemoryEngine::new();
        let pool = pool_with(&engine);

        let handle = pool.acquire("python").await.unwrap();

        engine.set_state(handle.get_id(), SandboxState::Stopped);
        assert_eq!(pool.acquire("python").await.unwrap(), handle);
        assert_eq!(engine.state_of(handle.get_id()), SandboxState::Running);

        engine.set_state(handle.get_id(), SandboxState::Paused);
        assert_eq!(pool.acquire("python").await.unwrap(), handle);
        assert_eq!(engine.state_of(handle.get_id()), SandboxState::Running);

        assert_eq!(engine.creations(), 1);
    }

    #[tokio::test]
    async fn test_existing_sandbox_is_adopted() {
        let engine = MemoryEngine::new();
        let existing = engine.insert_sandbox("c", "gcc:latest", SandboxState::Paused);
        let pool = pool_with(&engine);

        let handle = pool.acquire("c").await.unwrap();
        assert_eq!(handle.get_id(), &existing);
        assert_eq!(engine.state_of(&existing), SandboxState::Running);
        assert_eq!(engine.creations(), 0);

        // A `cpp` request must not adopt the `c` sandbox even though the image matches.
        let cpp = pool.acquire("cpp").await.unwrap();
        assert_ne!(cpp.get_id(), &existing);
    }

    #[tokio::test]
    async fn test_shutdown_all_removes_pooled_sandboxes() {
        let engine = MemoryEngine::new();
        let pool = pool_with(&engine);

        pool.acquire("python").await.unwrap();
        pool.acquire("javascript").await.unwrap();
        assert_eq!(pool.snapshot().await.len(), 2);

        pool.shutdown_all().await;
        assert!(pool.snapshot().await.is_empty());
        assert!(engine.sandboxes().is_empty());
    }
}
