//! Default values shared across the execbox crates.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default port the execution server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 3000;

/// The default host the execution server binds to.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// The path of the WebSocket endpoint used for executions.
pub const EXECUTE_WS_PATH: &str = "/ws/execute";

/// The directory inside a sandbox under which every execution gets its own path.
pub const DEFAULT_EXEC_ROOT: &str = "/code";

/// The default memory ceiling of a sandbox in MiB.
pub const DEFAULT_SANDBOX_MEMORY_MIB: u32 = 512;

/// The default CPU share of a sandbox, in percent of one CPU.
pub const DEFAULT_SANDBOX_CPU_PERCENT: u32 = 50;

/// The default wall-clock limit of a single execution in seconds.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 600;

/// The delay between client reconnect attempts in seconds.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 3;

/// The label attached to every sandbox the pool creates. Its value is the runtime id.
pub const SANDBOX_RUNTIME_LABEL: &str = "execbox.runtime";

/// The base name of the source file deployed into an execution path.
pub const SOURCE_FILE_STEM: &str = "main";

/// The placeholder substituted with the execution path in command templates.
pub const PATH_PLACEHOLDER: &str = "{path}";
