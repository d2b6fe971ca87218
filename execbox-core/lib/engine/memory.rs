//! An in-memory [`SandboxEngine`] for tests.
//!
//! Sandboxes are plain records, directories and files live in maps, and processes are scripted
//! with a [`FakeProgram`] that reads real stdin and writes real output chunks.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io::Read,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, BufReader, DuplexStream},
    sync::mpsc,
    task::AbortHandle,
};

use crate::{
    engine::{
        AttachedProcess, ProcessOutput, SandboxEngine, SandboxSpec, SandboxState, SandboxSummary,
    },
    utils::is_within,
    ExecboxError, ExecboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Exit code reported for processes killed by [`SandboxEngine::terminate`].
pub const KILLED_EXIT_CODE: i64 = 137;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Script run for every attached process. Resolves to the exit code.
pub type FakeProgram = Arc<dyn Fn(FakeProcess) -> BoxFuture<'static, i64> + Send + Sync>;

/// The view a [`FakeProgram`] has of its process.
pub struct FakeProcess {
    /// The command the process was started with.
    pub command: String,

    /// The working directory of the process.
    pub workdir: String,

    /// Files under the working directory, keyed by their path relative to it.
    pub files: BTreeMap<String, String>,

    stdin: BufReader<DuplexStream>,
    output: mpsc::UnboundedSender<ExecboxResult<ProcessOutput>>,
}

/// An in-memory sandbox engine.
#[derive(Clone)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
    program: FakeProgram,
    create_delay: Duration,
    remove_delay: Duration,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    images: BTreeSet<String>,
    pulls: usize,
    creations: usize,
    fail_uploads: bool,
    lose_exit_codes: bool,
    sandboxes: BTreeMap<String, MemorySandbox>,
    processes: HashMap<String, MemoryProcess>,
}

struct MemorySandbox {
    runtime: String,
    image: String,
    state: SandboxState,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

struct MemoryProcess {
    exit_code: Option<i64>,
    abort: Option<AbortHandle>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeProcess {
    /// The contents of the deployed `main.*` source file, if any.
    pub fn source(&self) -> Option<&str> {
        self.files
            .iter()
            .find(|(name, _)| name.starts_with("main."))
            .map(|(_, contents)| contents.as_str())
    }

    /// Writes to stdout.
    pub fn print(&self, text: impl Into<String>) {
        let _ = self
            .output
            .send(Ok(ProcessOutput::Stdout(Bytes::from(text.into()))));
    }

    /// Writes raw bytes to stdout.
    pub fn print_bytes(&self, bytes: &'static [u8]) {
        let _ = self
            .output
            .send(Ok(ProcessOutput::Stdout(Bytes::from_static(bytes))));
    }

    /// Writes to stderr.
    pub fn eprint(&self, text: impl Into<String>) {
        let _ = self
            .output
            .send(Ok(ProcessOutput::Stderr(Bytes::from(text.into()))));
    }

    /// Makes the output stream fail with an engine error.
    pub fn fail_stream(&self, reason: impl Into<String>) {
        let _ = self.output.send(Err(ExecboxError::Engine(reason.into())));
    }

    /// Reads one line from stdin without its newline. `None` at end of input.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches('\n').to_string()),
        }
    }
}

impl MemoryEngine {
    /// Creates an engine whose processes exit immediately with code 0.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            program: Arc::new(|_| async { 0 }.boxed()),
            create_delay: Duration::ZERO,
            remove_delay: Duration::ZERO,
        }
    }

    /// Sets the script every attached process runs.
    pub fn with_program<F, Fut>(mut self, program: F) -> Self
    where
        F: Fn(FakeProcess) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = i64> + Send + 'static,
    {
        self.program = Arc::new(move |process| program(process).boxed());
        self
    }

    /// Makes sandbox creation take `delay`, widening first-use races in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Makes directory removal take `delay`, so tests can interrupt cleanup.
    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = delay;
        self
    }

    /// Adds an existing sandbox, as if left over from an earlier server run.
    pub fn insert_sandbox(&self, runtime: &str, image: &str, state: SandboxState) -> String {
        let mut guard = self.lock();
        let id = guard.allocate_id("sandbox");
        guard.images.insert(image.to_string());
        guard.sandboxes.insert(
            id.clone(),
            MemorySandbox::new(runtime.to_string(), image.to_string(), state),
        );
        id
    }

    /// Removes a sandbox behind the pool's back.
    pub fn remove_externally(&self, sandbox_id: &str) {
        self.lock().sandboxes.remove(sandbox_id);
    }

    /// Forces the state of a sandbox.
    pub fn set_state(&self, sandbox_id: &str, state: SandboxState) {
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.state = state;
        }
    }

    /// Makes every following archive upload fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    /// Makes exit code queries fail, as if the engine forgot finished processes.
    pub fn lose_exit_codes(&self, lose: bool) {
        self.lock().lose_exit_codes = lose;
    }

    /// Number of sandboxes created so far.
    pub fn creations(&self) -> usize {
        self.lock().creations
    }

    /// Number of image pulls so far.
    pub fn pulls(&self) -> usize {
        self.lock().pulls
    }

    /// All existing sandboxes.
    pub fn sandboxes(&self) -> Vec<SandboxSummary> {
        self.lock()
            .sandboxes
            .iter()
            .map(|(id, sandbox)| sandbox.summary(id))
            .collect()
    }

    /// The current state of a sandbox, `Absent` if it does not exist.
    pub fn state_of(&self, sandbox_id: &str) -> SandboxState {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map(|sandbox| sandbox.state)
            .unwrap_or(SandboxState::Absent)
    }

    /// Directories that exist below `root` in a sandbox.
    pub fn dirs_under(&self, sandbox_id: &str, root: &str) -> Vec<String> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map(|sandbox| {
                sandbox
                    .dirs
                    .iter()
                    .filter(|dir| is_within(dir, root) && dir.as_str() != root)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reads a file from a sandbox.
    pub fn read_file(&self, sandbox_id: &str, path: &str) -> Option<String> {
        self.lock()
            .sandboxes
            .get(sandbox_id)?
            .files
            .get(path)
            .map(|contents| String::from_utf8_lossy(contents).into_owned())
    }

    /// Number of processes that have not exited yet.
    pub fn running_processes(&self) -> usize {
        self.lock()
            .processes
            .values()
            .filter(|process| process.exit_code.is_none())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_sandbox<T>(
        &self,
        sandbox_id: &str,
        f: impl FnOnce(&mut MemorySandbox) -> ExecboxResult<T>,
    ) -> ExecboxResult<T> {
        let mut guard = self.lock();
        let sandbox = guard
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ExecboxError::SandboxNotFound(sandbox_id.to_string()))?;
        f(sandbox)
    }
}

impl MemoryState {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }
}

impl MemorySandbox {
    fn new(runtime: String, image: String, state: SandboxState) -> Self {
        Self {
            runtime,
            image,
            state,
            dirs: BTreeSet::from(["/".to_string()]),
            files: BTreeMap::new(),
        }
    }

    fn summary(&self, id: &str) -> SandboxSummary {
        SandboxSummary {
            id: id.to_string(),
            image: self.image.clone(),
            state: self.state,
        }
    }

    fn require_running(&self) -> ExecboxResult<()> {
        if self.state == SandboxState::Running {
            Ok(())
        } else {
            Err(ExecboxError::Engine(format!(
                "sandbox is {}, not running",
                self.state
            )))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxEngine for MemoryEngine {
    async fn list_sandboxes(&self, runtime_id: &str) -> ExecboxResult<Vec<SandboxSummary>> {
        Ok(self
            .lock()
            .sandboxes
            .iter()
            .filter(|(_, sandbox)| sandbox.runtime == runtime_id)
            .map(|(id, sandbox)| sandbox.summary(id))
            .collect())
    }

    async fn inspect_sandbox(&self, sandbox_id: &str) -> ExecboxResult<SandboxState> {
        self.with_sandbox(sandbox_id, |sandbox| Ok(sandbox.state))
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()> {
        self.with_sandbox(sandbox_id, |sandbox| {
            sandbox.state = SandboxState::Running;
            Ok(())
        })
    }

    async fn unpause_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()> {
        self.with_sandbox(sandbox_id, |sandbox| match sandbox.state {
            SandboxState::Paused => {
                sandbox.state = SandboxState::Running;
                Ok(())
            }
            other => Err(ExecboxError::Engine(format!(
                "cannot unpause a sandbox that is {}",
                other
            ))),
        })
    }

    async fn ensure_image(&self, image: &str) -> ExecboxResult<()> {
        let mut guard = self.lock();
        if guard.images.insert(image.to_string()) {
            guard.pulls += 1;
        }
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ExecboxResult<String> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let mut guard = self.lock();
        if !guard.images.contains(&spec.image) {
            return Err(ExecboxError::Engine(format!("no such image: {}", spec.image)));
        }

        let id = guard.allocate_id("sandbox");
        guard.creations += 1;
        guard.sandboxes.insert(
            id.clone(),
            MemorySandbox::new(spec.runtime.clone(), spec.image.clone(), SandboxState::Stopped),
        );
        Ok(id)
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()> {
        self.lock()
            .sandboxes
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| ExecboxError::SandboxNotFound(sandbox_id.to_string()))
    }

    async fn make_dir(&self, sandbox_id: &str, path: &str) -> ExecboxResult<()> {
        self.with_sandbox(sandbox_id, |sandbox| {
            sandbox.require_running()?;
            let mut current = String::new();
            for component in path.split('/').filter(|c| !c.is_empty()) {
                current.push('/');
                current.push_str(component);
                sandbox.dirs.insert(current.clone());
            }
            Ok(())
        })
    }

    async fn remove_dir(&self, sandbox_id: &str, path: &str) -> ExecboxResult<()> {
        if !self.remove_delay.is_zero() {
            tokio::time::sleep(self.remove_delay).await;
        }
        self.with_sandbox(sandbox_id, |sandbox| {
            sandbox.require_running()?;
            sandbox.dirs.retain(|dir| !is_within(dir, path));
            sandbox.files.retain(|file, _| !is_within(file, path));
            Ok(())
        })
    }

    async fn upload_archive(
        &self,
        sandbox_id: &str,
        path: &str,
        archive: Bytes,
    ) -> ExecboxResult<()> {
        if self.lock().fail_uploads {
            return Err(ExecboxError::Engine("archive upload rejected".to_string()));
        }

        let mut entries = Vec::new();
        let mut reader = tar::Archive::new(&archive[..]);
        for entry in reader.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            entries.push((name, contents));
        }

        self.with_sandbox(sandbox_id, |sandbox| {
            sandbox.require_running()?;
            if !sandbox.dirs.contains(path) {
                return Err(ExecboxError::Engine(format!(
                    "could not find the file {} in container",
                    path
                )));
            }
            for (name, contents) in entries {
                sandbox
                    .files
                    .insert(format!("{}/{}", path.trim_end_matches('/'), name), contents);
            }
            Ok(())
        })
    }

    async fn spawn_attached(
        &self,
        sandbox_id: &str,
        workdir: &str,
        command: &str,
    ) -> ExecboxResult<AttachedProcess> {
        let files = self.with_sandbox(sandbox_id, |sandbox| {
            sandbox.require_running()?;
            Ok(sandbox
                .files
                .iter()
                .filter(|(path, _)| is_within(path, workdir))
                .map(|(path, contents)| {
                    let relative = path[workdir.len()..].trim_start_matches('/').to_string();
                    (relative, String::from_utf8_lossy(contents).into_owned())
                })
                .collect::<BTreeMap<_, _>>())
        })?;

        let (stdin_writer, stdin_reader) = tokio::io::duplex(4096);
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let keep_open = output_tx.clone();

        let process = FakeProcess {
            command: command.to_string(),
            workdir: workdir.to_string(),
            files,
            stdin: BufReader::new(stdin_reader),
            output: output_tx,
        };

        let process_id = {
            let mut guard = self.lock();
            let id = guard.allocate_id("exec");
            guard.processes.insert(
                id.clone(),
                MemoryProcess {
                    exit_code: None,
                    abort: None,
                },
            );
            id
        };

        let run = (self.program)(process);
        let state = Arc::clone(&self.state);
        let id = process_id.clone();
        let task = tokio::spawn(async move {
            let code = run.await;
            if let Ok(mut guard) = state.lock() {
                if let Some(process) = guard.processes.get_mut(&id) {
                    process.exit_code.get_or_insert(code);
                }
            }
            drop(keep_open);
        });

        if let Some(process) = self.lock().processes.get_mut(&process_id) {
            process.abort = Some(task.abort_handle());
        }

        let output = async_stream::stream! {
            while let Some(chunk) = output_rx.recv().await {
                yield chunk;
            }
        }
        .boxed();

        Ok(AttachedProcess {
            id: process_id,
            output,
            stdin: Box::pin(stdin_writer),
        })
    }

    async fn process_exit_code(&self, process_id: &str) -> ExecboxResult<Option<i64>> {
        let guard = self.lock();
        if guard.lose_exit_codes {
            return Err(ExecboxError::Engine(format!(
                "no such exec instance: {}",
                process_id
            )));
        }

        guard
            .processes
            .get(process_id)
            .map(|process| process.exit_code)
            .ok_or_else(|| ExecboxError::Engine(format!("no such exec instance: {}", process_id)))
    }

    async fn terminate(
        &self,
        _sandbox_id: &str,
        _workdir: &str,
        process_id: &str,
    ) -> ExecboxResult<()> {
        let mut guard = self.lock();
        if let Some(process) = guard.processes.get_mut(process_id) {
            if process.exit_code.is_none() {
                process.exit_code = Some(KILLED_EXIT_CODE);
                if let Some(abort) = process.abort.take() {
                    abort.abort();
                }
            }
        }
        Ok(())
    }
}
