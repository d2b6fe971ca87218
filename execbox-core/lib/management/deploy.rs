//! Deploying submitted code into a sandbox.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    config::Runtime,
    engine::SandboxEngine,
    management::SandboxHandle,
    utils::{execution_path, single_file_archive},
    ExecboxError, ExecboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Writes code into session-scoped directories of pooled sandboxes.
#[derive(Clone)]
pub struct CodeDeployer {
    engine: Arc<dyn SandboxEngine>,
    exec_root: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CodeDeployer {
    /// Creates a deployer that places executions under `exec_root`.
    pub fn new(engine: Arc<dyn SandboxEngine>, exec_root: impl Into<String>) -> Self {
        Self {
            engine,
            exec_root: exec_root.into(),
        }
    }

    /// The directory executions are placed under.
    pub fn exec_root(&self) -> &str {
        &self.exec_root
    }

    /// Deploys `code` as `main.<ext>` into the session's own directory and returns that directory.
    ///
    /// The directory is created and awaited before the archive is written. Any failure is
    /// reported as [`ExecboxError::DeploymentFailure`] and the caller must not execute.
    pub async fn deploy(
        &self,
        sandbox: &SandboxHandle,
        session_id: &str,
        runtime: &Runtime,
        code: &str,
    ) -> ExecboxResult<String> {
        let exec_path = execution_path(&self.exec_root, session_id)?;
        let failure = |reason: String| ExecboxError::DeploymentFailure {
            session_id: session_id.to_string(),
            reason,
        };

        self.engine
            .make_dir(sandbox.get_id(), &exec_path)
            .await
            .map_err(|e| failure(format!("creating {}: {}", exec_path, e)))?;

        let archive: Bytes = single_file_archive(&runtime.source_file_name(), code.as_bytes())
            .map_err(|e| failure(format!("packing code: {}", e)))?;

        self.engine
            .upload_archive(sandbox.get_id(), &exec_path, archive)
            .await
            .map_err(|e| failure(format!("writing code to {}: {}", exec_path, e)))?;

        tracing::debug!(
            "deployed {} for session {} into {}",
            runtime.source_file_name(),
            session_id,
            exec_path
        );
        Ok(exec_path)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RuntimeRegistry, SandboxLimits},
        engine::MemoryEngine,
        management::SandboxPool,
    };

    async fn setup() -> (MemoryEngine, CodeDeployer, SandboxHandle) {
        let engine = MemoryEngine::new();
        let pool = SandboxPool::new(
            Arc::new(engine.clone()),
            Arc::new(RuntimeRegistry::default()),
            SandboxLimits::default(),
        );
        let sandbox = pool.acquire("python").await.unwrap();
        let deployer = CodeDeployer::new(Arc::new(engine.clone()), "/code");
        (engine, deployer, sandbox)
    }

    #[tokio::test]
    async fn test_deploy_writes_code_verbatim() {
        let (engine, deployer, sandbox) = setup().await;
        let registry = RuntimeRegistry::default();
        let python = registry.get("python").unwrap();

        let path = deployer
            .deploy(&sandbox, "s1", python, "print('hi')\n")
            .await
            .unwrap();

        assert_eq!(path, "/code/s1");
        assert_eq!(
            engine.read_file(sandbox.get_id(), "/code/s1/main.py").as_deref(),
            Some("print('hi')\n")
        );
    }

    #[tokio::test]
    async fn test_concurrent_deployments_are_disjoint() {
        let (engine, deployer, sandbox) = setup().await;
        let registry = RuntimeRegistry::default();
        let python = registry.get("python").unwrap();

        let (a, b) = tokio::join!(
            deployer.deploy(&sandbox, "a", python, "print('a')"),
            deployer.deploy(&sandbox, "b", python, "print('b')"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a, b);
        assert_eq!(
            engine.read_file(sandbox.get_id(), "/code/a/main.py").as_deref(),
            Some("print('a')")
        );
        assert_eq!(
            engine.read_file(sandbox.get_id(), "/code/b/main.py").as_deref(),
            Some("print('b')")
        );
    }

    #[tokio::test]
    async fn test_upload_failure_is_deployment_failure() {
        let (engine, deployer, sandbox) = setup().await;
        let registry = RuntimeRegistry::default();
        engine.fail_uploads(true);

        let err = deployer
            .deploy(&sandbox, "s1", registry.get("python").unwrap(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecboxError::DeploymentFailure { session_id, .. } if session_id == "s1"));
    }

    #[tokio::test]
    async fn test_invalid_session_id_never_reaches_sandbox() {
        let (engine, deployer, sandbox) = setup().await;
        let registry = RuntimeRegistry::default();

        let err = deployer
            .deploy(&sandbox, "../etc", registry.get("python").unwrap(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecboxError::InvalidSessionId(_)));
        assert!(engine.dirs_under(sandbox.get_id(), "/").is_empty());
    }
}
