//! Execution session coordination.
//!
//! A session is one run of submitted code. The coordinator acquires the runtime's pooled sandbox,
//! deploys the code into the session's own directory, starts the attached process and tracks the
//! session until its event stream ends or it is stopped. Cleanup of a session (unregistering it
//! and removing its directory) happens on every terminal path.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::Serialize;
use tokio::sync::Notify;

use crate::{
    config::Runtime,
    engine::{ProcessStdin, SandboxEngine},
    management::{CodeDeployer, SandboxPool},
    stream::{demultiplex, ExecutionEvents},
    utils::{execution_path, validate_session_id},
    ExecboxError, ExecboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle state of an execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// The sandbox is being acquired or the code deployed.
    Deploying,

    /// The attached process is live.
    Running,

    /// The session was stopped and awaits cleanup.
    Stopped,
}

/// A snapshot of an active session.
#[derive(Debug, Clone, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// The session id.
    id: String,

    /// The runtime the session runs in.
    runtime: String,

    /// The sandbox hosting the session, once acquired.
    sandbox_id: Option<String>,

    /// The session's directory, once deployed.
    exec_path: Option<String>,

    /// Current state.
    state: SessionState,

    /// When the session was started.
    started_at: DateTime<Utc>,
}

/// A started execution: its stdin and its event stream.
pub struct AttachedExecution {
    /// The session id.
    pub session_id: String,

    /// The stdin of the running program.
    pub stdin: ProcessStdin,

    /// The program's events, ending with exactly one exit.
    pub events: ExecutionEvents,
}

/// Starts, tracks and stops execution sessions.
pub struct SessionCoordinator {
    pool: Arc<SandboxPool>,
    deployer: CodeDeployer,
    sessions: Arc<SessionTable>,
    next_token: AtomicU64,
}

/// Removes a session's directory and unregisters it.
pub struct SessionCleanup {
    sessions: Arc<SessionTable>,
    engine: Arc<dyn SandboxEngine>,
    session_id: String,
    sandbox_id: String,
    exec_path: String,
    process_id: String,
    token: u64,
    finished: AtomicBool,
}

/// Reserved session ids. Waiters are woken whenever an id is released.
struct SessionTable {
    entries: Mutex<HashMap<String, SessionEntry>>,
    released: Notify,
}

struct SessionEntry {
    token: u64,
    runtime: String,
    sandbox_id: Option<String>,
    exec_path: Option<String>,
    process_id: Option<String>,
    state: SessionState,
    started_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionCoordinator {
    /// Creates a coordinator that deploys executions under `exec_root`.
    pub fn new(pool: Arc<SandboxPool>, exec_root: impl Into<String>) -> Self {
        let deployer = CodeDeployer::new(Arc::clone(pool.engine()), exec_root);
        Self {
            pool,
            deployer,
            sessions: Arc::new(SessionTable {
                entries: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
            next_token: AtomicU64::new(1),
        }
    }

    /// The sandbox pool sessions run in.
    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    /// Starts `code` in the sandbox of `runtime_id` as session `session_id`.
    ///
    /// Unknown runtimes and invalid session ids are rejected before any sandbox is touched. A
    /// session id that is already active is rejected with [`ExecboxError::SessionAlreadyExists`].
    /// If the session is stopped before its process is live, the process is killed and the call
    /// fails with [`ExecboxError::SessionStopped`].
    pub async fn start(
        &self,
        session_id: &str,
        runtime_id: &str,
        code: &str,
    ) -> ExecboxResult<AttachedExecution> {
        let runtime = self.pool.registry().get(runtime_id)?.clone();
        validate_session_id(session_id)?;

        let token = self.reserve(session_id, runtime_id)?;
        tracing::info!("starting session {} ({})", session_id, runtime_id);

        let result = self.launch(session_id, &runtime, code, token).await;
        if let Err(e) = &result {
            tracing::warn!("session {} failed to start: {}", session_id, e);
            self.release(session_id, token);
        }

        result
    }

    /// Stops a session and kills its process. Returns `false` if the session was not active.
    ///
    /// The session id stays reserved until the session's directory is removed. A session still
    /// deploying is only marked here; [`SessionCoordinator::start`] kills its process as soon as
    /// it is live.
    pub async fn stop(&self, session_id: &str) -> bool {
        let target = {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(session_id) else {
                return false;
            };
            if entry.state == SessionState::Stopped {
                return false;
            }

            tracing::info!("stopping session {} ({})", session_id, entry.state);
            entry.state = SessionState::Stopped;
            match (&entry.sandbox_id, &entry.exec_path, &entry.process_id) {
                (Some(sandbox_id), Some(exec_path), Some(process_id)) => {
                    Some((sandbox_id.clone(), exec_path.clone(), process_id.clone()))
                }
                _ => None,
            }
        };

        if let Some((sandbox_id, exec_path, process_id)) = target {
            if let Err(e) = self
                .pool
                .engine()
                .terminate(&sandbox_id, &exec_path, &process_id)
                .await
            {
                tracing::warn!("failed to terminate session {}: {}", session_id, e);
            }
        }

        true
    }

    /// Whether `session_id` is active and not stopped.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|entry| entry.state != SessionState::Stopped)
    }

    /// The active sessions, oldest first. Stopped sessions awaiting cleanup are left out.
    pub fn active_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state != SessionState::Stopped)
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                runtime: entry.runtime.clone(),
                sandbox_id: entry.sandbox_id.clone(),
                exec_path: entry.exec_path.clone(),
                state: entry.state,
                started_at: entry.started_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Waits until `session_id` is no longer reserved, at most `timeout`. Returns whether it was
    /// released in time.
    pub async fn wait_released(&self, session_id: &str, timeout: Duration) -> bool {
        let released = async {
            loop {
                let notified = self.sessions.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.sessions.lock().contains_key(session_id) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, released).await.is_ok()
    }

    async fn launch(
        &self,
        session_id: &str,
        runtime: &Runtime,
        code: &str,
        token: u64,
    ) -> ExecboxResult<AttachedExecution> {
        let engine = Arc::clone(self.pool.engine());
        let sandbox = self.pool.acquire(runtime.get_id()).await?;
        self.update(session_id, token, |entry| {
            entry.sandbox_id = Some(sandbox.get_id().clone());
        });

        let exec_path = match self
            .deployer
            .deploy(&sandbox, session_id, runtime, code)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                let path = execution_path(self.deployer.exec_root(), session_id)?;
                remove_dir_quietly(engine.as_ref(), sandbox.get_id(), &path).await;
                return Err(e);
            }
        };

        let command = runtime.command_for(&exec_path);
        let process = match engine
            .spawn_attached(sandbox.get_id(), &exec_path, &command)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                remove_dir_quietly(engine.as_ref(), sandbox.get_id(), &exec_path).await;
                return Err(e);
            }
        };

        let cleanup = Arc::new(SessionCleanup {
            sessions: Arc::clone(&self.sessions),
            engine: Arc::clone(&engine),
            session_id: session_id.to_string(),
            sandbox_id: sandbox.get_id().clone(),
            exec_path: exec_path.clone(),
            process_id: process.id.clone(),
            token,
            finished: AtomicBool::new(false),
        });

        let live = self
            .update(session_id, token, |entry| {
                if entry.state == SessionState::Stopped {
                    return false;
                }
                entry.exec_path = Some(exec_path.clone());
                entry.process_id = Some(process.id.clone());
                entry.state = SessionState::Running;
                true
            })
            .unwrap_or(false);

        if !live {
            tracing::info!("session {} was stopped while deploying", session_id);
            if let Err(e) = engine
                .terminate(sandbox.get_id(), &exec_path, &process.id)
                .await
            {
                tracing::warn!("failed to terminate session {}: {}", session_id, e);
            }
            cleanup.run().await;
            return Err(ExecboxError::SessionStopped(session_id.to_string()));
        }

        tracing::info!(
            "session {} running in sandbox {} at {}",
            session_id,
            sandbox.get_id(),
            exec_path
        );

        Ok(AttachedExecution {
            session_id: session_id.to_string(),
            stdin: process.stdin,
            events: demultiplex(engine, process.output, cleanup),
        })
    }

    fn reserve(&self, session_id: &str, runtime_id: &str) -> ExecboxResult<u64> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session_id) {
            return Err(ExecboxError::SessionAlreadyExists(session_id.to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                token,
                runtime: runtime_id.to_string(),
                sandbox_id: None,
                exec_path: None,
                process_id: None,
                state: SessionState::Deploying,
                started_at: Utc::now(),
            },
        );
        Ok(token)
    }

    fn release(&self, session_id: &str, token: u64) {
        self.sessions.unregister(session_id, token);
    }

    /// Applies `f` to the session if it is still the one reserved with `token`.
    fn update<T>(
        &self,
        session_id: &str,
        token: u64,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Option<T> {
        match self.sessions.lock().get_mut(session_id) {
            Some(entry) if entry.token == token => Some(f(entry)),
            _ => None,
        }
    }
}

impl SessionCleanup {
    /// The session being cleaned up.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The sandbox hosting the session.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// The session's directory.
    pub fn exec_path(&self) -> &str {
        &self.exec_path
    }

    /// The session's attached process.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Removes the session's directory, then unregisters it. Calls after a completed run do
    /// nothing; a run that was cancelled midway can be repeated.
    pub async fn run(&self) {
        if self.is_finished() {
            return;
        }

        remove_dir_quietly(self.engine.as_ref(), &self.sandbox_id, &self.exec_path).await;
        self.sessions.unregister(&self.session_id, self.token);
        self.finished.store(true, Ordering::SeqCst);
        tracing::debug!("cleaned up session {}", self.session_id);
    }

    /// Whether a run has completed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Kills the process and cleans up in the background, unless cleanup already completed.
    pub fn run_detached(self: Arc<Self>) {
        if self.is_finished() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "no runtime to clean up session {}, leaving {} behind",
                self.session_id,
                self.exec_path
            );
            return;
        };

        handle.spawn(async move {
            if let Err(e) = self
                .engine
                .terminate(&self.sandbox_id, &self.exec_path, &self.process_id)
                .await
            {
                tracing::warn!("failed to terminate session {}: {}", self.session_id, e);
            }
            self.run().await;
        });
    }
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes the session only if it still carries `token`, so a newer session with a reused id
    /// is left alone.
    fn unregister(&self, session_id: &str, token: u64) {
        let removed = {
            let mut entries = self.lock();
            let owned = entries
                .get(session_id)
                .is_some_and(|entry| entry.token == token);
            if owned {
                entries.remove(session_id);
            }
            owned
        };

        if removed {
            self.released.notify_waiters();
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploying => write!(f, "deploying"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn remove_dir_quietly(engine: &dyn SandboxEngine, sandbox_id: &str, path: &str) {
    if let Err(e) = engine.remove_dir(sandbox_id, path).await {
        tracing::warn!("failed to remove {} in sandbox {}: {}", path, sandbox_id, e);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        config::{RuntimeRegistry, SandboxLimits},
        engine::MemoryEngine,
        stream::ExecutionEvent,
    };

    fn coordinator(engine: &MemoryEngine) -> Arc<SessionCoordinator> {
        let pool = SandboxPool::new(
            Arc::new(engine.clone()),
            Arc::new(RuntimeRegistry::default()),
            SandboxLimits::default(),
        );
        Arc::new(SessionCoordinator::new(Arc::new(pool), "/code"))
    }

    /// A program that echoes its source file, then greets whoever it reads from stdin.
    fn greeter() -> MemoryEngine {
        MemoryEngine::new().with_program(|mut process| async move {
            let source = process.source().unwrap_or_default().to_string();
            process.print(format!("source: {}\n", source));
            match process.read_line().await {
                Some(name) => {
                    process.print(format!("hi {}\n", name));
                    0
                }
                None => 2,
            }
        })
    }

    async fn stdout_of(events: ExecutionEvents) -> (String, i64) {
        let mut stdout = String::new();
        let mut code = None;
        let mut events = events;
        while let Some(event) = events.next().await {
            match event {
                ExecutionEvent::Output(bytes) => stdout.push_str(&String::from_utf8_lossy(&bytes)),
                ExecutionEvent::Error(_) => {}
                ExecutionEvent::Exit(c) => {
                    assert!(code.is_none(), "more than one exit");
                    code = Some(c);
                }
            }
        }
        (stdout, code.unwrap())
    }

    #[tokio::test]
    async fn test_start_runs_code_with_stdin() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let mut execution = coordinator
            .start("s1", "python", "name = input()")
            .await
            .unwrap();
        assert!(coordinator.is_active("s1"));
        assert_eq!(coordinator.active_sessions()[0].get_state(), &SessionState::Running);

        execution.stdin.write_all(b"bob\n").await.unwrap();
        execution.stdin.flush().await.unwrap();

        let (stdout, code) = stdout_of(execution.events).await;
        assert_eq!(stdout, "source: name = input()\nhi bob\n");
        assert_eq!(code, 0);
        assert!(!coordinator.is_active("s1"));
    }

    #[tokio::test]
    async fn test_unsupported_runtime_has_no_side_effects() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let err = coordinator.start("s1", "ruby", "puts 1").await.err().unwrap();
        assert!(matches!(err, ExecboxError::UnsupportedRuntime(_)));
        assert_eq!(err.to_string(), "Unsupported language: ruby");
        assert!(engine.sandboxes().is_empty());
        assert!(coordinator.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_see_each_other() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let mut a = coordinator.start("a", "python", "print('a')").await.unwrap();
        let mut b = coordinator.start("b", "python", "print('b')").await.unwrap();

        let sessions = coordinator.active_sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].get_sandbox_id(), sessions[1].get_sandbox_id());
        assert_ne!(sessions[0].get_exec_path(), sessions[1].get_exec_path());

        a.stdin.write_all(b"x\n").await.unwrap();
        b.stdin.write_all(b"y\n").await.unwrap();

        let ((out_a, _), (out_b, _)) = tokio::join!(stdout_of(a.events), stdout_of(b.events));
        assert_eq!(out_a, "source: print('a')\nhi x\n");
        assert_eq!(out_b, "source: print('b')\nhi y\n");
        assert_eq!(engine.creations(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_session_id_is_rejected() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let _first = coordinator.start("same", "python", "x").await.unwrap();
        let err = coordinator.start("same", "python", "y").await.err().unwrap();
        assert!(matches!(err, ExecboxError::SessionAlreadyExists(id) if id == "same"));
        assert_eq!(coordinator.active_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_deployment_failure_does_not_register() {
        let engine = greeter();
        engine.fail_uploads(true);
        let coordinator = coordinator(&engine);

        let err = coordinator.start("s1", "python", "x").await.err().unwrap();
        assert!(matches!(err, ExecboxError::DeploymentFailure { .. }));
        assert!(coordinator.active_sessions().is_empty());
        assert_eq!(engine.running_processes(), 0);

        let sandbox = &engine.sandboxes()[0].id;
        assert!(engine.dirs_under(sandbox, "/code").is_empty());
    }

    #[tokio::test]
    async fn test_stop_kills_process_and_cleans_up() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let execution = coordinator.start("s1", "python", "x").await.unwrap();
        assert_eq!(engine.running_processes(), 1);

        assert!(coordinator.stop("s1").await);
        assert!(!coordinator.is_active("s1"));
        assert!(!coordinator.stop("s1").await);

        let (_, code) = stdout_of(execution.events).await;
        assert_eq!(code, crate::engine::KILLED_EXIT_CODE);
        assert_eq!(engine.running_processes(), 0);

        let sandbox = &engine.sandboxes()[0].id;
        assert!(engine.dirs_under(sandbox, "/code").is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_deploying_kills_the_late_process() {
        let engine = greeter().with_create_delay(Duration::from_millis(50));
        let coordinator = coordinator(&engine);

        let starting = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.start("s1", "python", "x").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            coordinator.active_sessions()[0].get_state(),
            &SessionState::Deploying
        );
        assert!(coordinator.stop("s1").await);

        let err = starting.await.unwrap().err().unwrap();
        assert!(matches!(err, ExecboxError::SessionStopped(_)));
        assert_eq!(engine.running_processes(), 0);
        assert!(coordinator.active_sessions().is_empty());

        let sandbox = &engine.sandboxes()[0].id;
        assert!(engine.dirs_under(sandbox, "/code").is_empty());
    }

    #[tokio::test]
    async fn test_session_id_can_be_reused_after_exit() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let first = coordinator.start("again", "python", "x").await.unwrap();
        drop(first.stdin);
        let (_, code) = stdout_of(first.events).await;
        assert_eq!(code, 2);

        let second = coordinator.start("again", "python", "y").await.unwrap();
        drop(second.stdin);
        stdout_of(second.events).await;
    }

    #[tokio::test]
    async fn test_invalid_session_id_is_rejected() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let err = coordinator.start("../x", "python", "x").await.err().unwrap();
        assert!(matches!(err, ExecboxError::InvalidSessionId(_)));
        assert!(engine.sandboxes().is_empty());
    }

    #[tokio::test]
    async fn test_commands_run_in_the_session_directory() {
        let engine = MemoryEngine::new().with_program(|process| async move {
            let files: Vec<_> = process.files.keys().cloned().collect();
            process.print(format!(
                "{}\n{}\n{}\n",
                process.command,
                process.workdir,
                files.join(",")
            ));
            0
        });
        let coordinator = coordinator(&engine);

        let cases = [
            ("python", "py-1", "python -u /code/py-1/main.py", "main.py"),
            ("javascript", "js-1", "node /code/js-1/main.js", "main.js"),
            (
                "c",
                "c-1",
                "gcc /code/c-1/main.c -o /code/c-1/main && /code/c-1/main",
                "main.c",
            ),
            (
                "cpp",
                "cpp-1",
                "g++ /code/cpp-1/main.cpp -o /code/cpp-1/main && /code/cpp-1/main",
                "main.cpp",
            ),
        ];

        for (runtime, id, command, file) in cases {
            let execution = coordinator.start(id, runtime, "code").await.unwrap();
            let (stdout, code) = stdout_of(execution.events).await;
            assert_eq!(code, 0);
            assert_eq!(stdout, format!("{}\n/code/{}\n{}\n", command, id, file));
        }
    }

    #[tokio::test]
    async fn test_wait_released_follows_cleanup_of_stopped_session() {
        let engine = greeter();
        let coordinator = coordinator(&engine);

        let first = coordinator.start("dup", "python", "x").await.unwrap();
        assert!(!coordinator.wait_released("dup", Duration::from_millis(20)).await);

        assert!(coordinator.stop("dup").await);
        assert!(matches!(
            coordinator.start("dup", "python", "y").await,
            Err(ExecboxError::SessionAlreadyExists(_))
        ));

        let draining = tokio::spawn(stdout_of(first.events));
        assert!(coordinator.wait_released("dup", Duration::from_secs(5)).await);
        draining.await.unwrap();

        let second = coordinator.start("dup", "python", "y").await.unwrap();
        drop(second.stdin);
        let (stdout, _) = stdout_of(second.events).await;
        assert!(stdout.starts_with("source: y\n"));
    }
}
