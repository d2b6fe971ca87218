//! Demultiplexing an attached process into execution events.
//!
//! An attached process yields interleaved stdout and stderr chunks and then simply ends. The
//! demultiplexer turns that into a lazy sequence of [`ExecutionEvent`]s that always finishes with
//! exactly one [`ExecutionEvent::Exit`], after the session has been cleaned up.

use std::{pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::{
    engine::{ProcessOutput, ProcessOutputStream, SandboxEngine},
    management::SessionCleanup,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The exit code reported when the real one cannot be determined.
pub const UNKNOWN_EXIT_CODE: i64 = 1;

/// How many times the exit code is queried after the output ends.
const EXIT_CODE_ATTEMPTS: usize = 40;

/// Delay between exit code queries.
const EXIT_CODE_INTERVAL: Duration = Duration::from_millis(25);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One event of a running execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// Bytes the program wrote to stdout.
    Output(Bytes),

    /// Bytes the program wrote to stderr, or a description of a stream failure.
    Error(Bytes),

    /// The program finished with this exit code. Always the last event.
    Exit(i64),
}

/// The events of one execution.
pub type ExecutionEvents = Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>;

/// Runs the session cleanup in the background if the event stream is dropped before its end.
struct CleanupGuard(Arc<SessionCleanup>);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Turns the output of an attached process into execution events.
///
/// Output and error chunks keep the order the engine delivered them in. When the output ends,
/// or fails, the exit code is fetched from the engine, the session is cleaned up and a single
/// [`ExecutionEvent::Exit`] is yielded.
pub fn demultiplex(
    engine: Arc<dyn SandboxEngine>,
    mut output: ProcessOutputStream,
    cleanup: Arc<SessionCleanup>,
) -> ExecutionEvents {
    Box::pin(async_stream::stream! {
        let guard = CleanupGuard(Arc::clone(&cleanup));

        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(ProcessOutput::Stdout(bytes)) => yield ExecutionEvent::Output(bytes),
                Ok(ProcessOutput::Stderr(bytes)) => yield ExecutionEvent::Error(bytes),
                Err(e) => {
                    tracing::warn!(
                        "output stream of session {} failed: {}",
                        cleanup.session_id(),
                        e
                    );
                    yield ExecutionEvent::Error(Bytes::from(format!("{}\n", e)));

                    if let Err(e) = engine
                        .terminate(
                            cleanup.sandbox_id(),
                            cleanup.exec_path(),
                            cleanup.process_id(),
                        )
                        .await
                    {
                        tracing::warn!(
                            "failed to terminate session {}: {}",
                            cleanup.session_id(),
                            e
                        );
                    }
                    break;
                }
            }
        }
        drop(output);

        let code = exit_code(engine.as_ref(), cleanup.process_id()).await;
        cleanup.run().await;
        drop(guard);

        tracing::info!("session {} exited with code {}", cleanup.session_id(), code);
        yield ExecutionEvent::Exit(code);
    })
}

/// Fetches the exit code of a finished process, allowing the engine a moment to record it.
async fn exit_code(engine: &dyn SandboxEngine, process_id: &str) -> i64 {
    for _ in 0..EXIT_CODE_ATTEMPTS {
        match engine.process_exit_code(process_id).await {
            Ok(Some(code)) => return code,
            Ok(None) => tokio::time::sleep(EXIT_CODE_INTERVAL).await,
            Err(e) => {
                tracing::warn!("could not read exit code of {}: {}", process_id, e);
                return UNKNOWN_EXIT_CODE;
            }
        }
    }

    tracing::warn!("process {} did not report an exit code", process_id);
    UNKNOWN_EXIT_CODE
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        Arc::clone(&self.0).run_detached();
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::{RuntimeRegistry, SandboxLimits},
        engine::MemoryEngine,
        management::{SandboxPool, SessionCoordinator},
    };

    fn coordinator(engine: &MemoryEngine) -> SessionCoordinator {
        let pool = SandboxPool::new(
            Arc::new(engine.clone()),
            Arc::new(RuntimeRegistry::default()),
            SandboxLimits::default(),
        );
        SessionCoordinator::new(Arc::new(pool), "/code")
    }

    async fn collect(events: ExecutionEvents) -> Vec<ExecutionEvent> {
        events.collect().await
    }

    #[tokio::test]
    async fn test_output_and_error_keep_their_order() {
        let engine = MemoryEngine::new().with_program(|process| async move {
            process.print("one\n");
            process.eprint("warning\n");
            process.print("two\n");
            3
        });
        let coordinator = coordinator(&engine);

        let execution = coordinator.start("s1", "python", "x").await.unwrap();
        let events = collect(execution.events).await;

        assert_eq!(
            events,
            vec![
                ExecutionEvent::Output(Bytes::from("one\n")),
                ExecutionEvent::Error(Bytes::from("warning\n")),
                ExecutionEvent::Output(Bytes::from("two\n")),
                ExecutionEvent::Exit(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_successful_program_exits_with_zero() {
        let engine = MemoryEngine::new().with_program(|process| async move {
            process.print("done\n");
            0
        });
        let coordinator = coordinator(&engine);

        let execution = coordinator.start("s1", "javascript", "x").await.unwrap();
        let events = collect(execution.events).await;
        assert_eq!(events.last(), Some(&ExecutionEvent::Exit(0)));
    }

    #[tokio::test]
    async fn test_unknown_exit_code_is_reported_as_one() {
        let engine = MemoryEngine::new().with_program(|process| async move {
            process.print("bye\n");
            0
        });
        engine.lose_exit_codes(true);
        let coordinator = coordinator(&engine);

        let execution = coordinator.start("s1", "python", "x").await.unwrap();
        let events = collect(execution.events).await;

        let exits: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, ExecutionEvent::Exit(_)))
            .collect();
        assert_eq!(exits, vec![&ExecutionEvent::Exit(UNKNOWN_EXIT_CODE)]);
    }

    #[tokio::test]
    async fn test_stream_failure_still_exits_once_and_cleans_up() {
        let engine = MemoryEngine::new().with_program(|mut process| async move {
            process.print("partial\n");
            process.fail_stream("connection reset");
            process.read_line().await;
            0
        });
        let coordinator = coordinator(&engine);

        let execution = coordinator.start("s1", "python", "x").await.unwrap();
        let events = collect(execution.events).await;

        assert_eq!(events[0], ExecutionEvent::Output(Bytes::from("partial\n")));
        assert!(matches!(&events[1], ExecutionEvent::Error(_)));
        assert!(matches!(events[2], ExecutionEvent::Exit(_)));
        assert_eq!(events.len(), 3);

        assert!(coordinator.active_sessions().is_empty());
        assert_eq!(engine.running_processes(), 0);
        let sandbox = &engine.sandboxes()[0].id;
        assert!(engine.dirs_under(sandbox, "/code").is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_happens_before_exit() {
        let engine = MemoryEngine::new();
        let coordinator = coordinator(&engine);

        let mut events = coordinator.start("s1", "python", "x").await.unwrap().events;
        while let Some(event) = events.next().await {
            if let ExecutionEvent::Exit(_) = event {
                assert!(coordinator.active_sessions().is_empty());
                let sandbox = &engine.sandboxes()[0].id;
                assert!(engine.dirs_under(sandbox, "/code").is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_still_cleans_up() {
        let engine = MemoryEngine::new().with_program(|process| async move {
            process.print("tick\n");
            0
        });
        let coordinator = coordinator(&engine);

        let mut events = coordinator.start("s1", "python", "x").await.unwrap().events;
        assert!(events.next().await.is_some());
        drop(events);

        for _ in 0..50 {
            if coordinator.active_sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(coordinator.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stream_dropped_during_cleanup_still_cleans_up() {
        let engine = MemoryEngine::new()
            .with_remove_delay(Duration::from_millis(50))
            .with_program(|process| async move {
                process.print("tick\n");
                0
            });
        let coordinator = coordinator(&engine);

        let mut events = coordinator.start("s1", "python", "x").await.unwrap().events;
        assert!(matches!(events.next().await, Some(ExecutionEvent::Output(_))));
        // Polls into the slow directory removal, then abandons it.
        let pending = tokio::time::timeout(Duration::from_millis(10), events.next()).await;
        assert!(pending.is_err());
        drop(events);

        for _ in 0..100 {
            if coordinator.active_sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(coordinator.active_sessions().is_empty());
        let sandbox = &engine.sandboxes()[0].id;
        assert!(engine.dirs_under(sandbox, "/code").is_empty());
    }
}
