//! Configuration of the execbox server.
//!
//! Network settings come from the command line, everything about sandboxes and executions from
//! the environment (see [`execbox_utils::env`]).

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use execbox_core::config::{RuntimeRegistry, SandboxLimits};
use execbox_utils::{
    env::{self, get_env_flag, get_env_or},
    DEFAULT_EXECUTION_TIMEOUT_SECS, DEFAULT_EXEC_ROOT, DEFAULT_SANDBOX_CPU_PERCENT,
    DEFAULT_SANDBOX_MEMORY_MIB,
};
use getset::Getters;

use crate::{transport::TransportSettings, ServerError, ServerResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Server settings assembled from arguments and environment variables.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ServerConfig {
    /// Address to listen on
    addr: SocketAddr,

    /// Whether the server runs in development mode
    dev_mode: bool,

    /// Directory inside sandboxes that holds execution paths
    exec_root: String,

    /// Resource limits of every sandbox
    limits: SandboxLimits,

    /// Wall-clock limit of one execution, `None` when disabled
    execution_timeout: Option<Duration>,

    /// Whether heuristic `input_required` hints follow each output chunk
    input_hints: bool,

    /// Image replacements keyed by runtime id
    image_overrides: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerConfig {
    /// Creates a configuration with default sandbox settings.
    pub fn new(host: &str, port: u16, dev_mode: bool) -> ServerResult<Self> {
        let ip: IpAddr = host.parse().map_err(|e| {
            ServerError::ConfigError(format!("invalid host address {:?}: {}", host, e))
        })?;

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            dev_mode,
            exec_root: DEFAULT_EXEC_ROOT.to_string(),
            limits: SandboxLimits::default(),
            execution_timeout: timeout_from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            input_hints: true,
            image_overrides: BTreeMap::new(),
        })
    }

    /// Creates a configuration and applies the `EXECBOX_*` environment variables.
    pub fn from_env(host: &str, port: u16, dev_mode: bool) -> ServerResult<Self> {
        let mut config = Self::new(host, port, dev_mode)?;

        config.exec_root = get_env_or(env::EXECBOX_EXEC_ROOT_ENV_VAR, config.exec_root)?;
        if !config.exec_root.starts_with('/') {
            return Err(ServerError::ConfigError(format!(
                "{} must be an absolute path, got {:?}",
                env::EXECBOX_EXEC_ROOT_ENV_VAR,
                config.exec_root
            )));
        }

        let memory_mib = get_env_or(env::EXECBOX_MEMORY_MB_ENV_VAR, DEFAULT_SANDBOX_MEMORY_MIB)?;
        let cpu_percent =
            get_env_or(env::EXECBOX_CPU_PERCENT_ENV_VAR, DEFAULT_SANDBOX_CPU_PERCENT)?;
        if memory_mib == 0 || cpu_percent == 0 {
            return Err(ServerError::ConfigError(
                "sandbox memory and cpu share must be greater than zero".to_string(),
            ));
        }
        config.limits = SandboxLimits::new(memory_mib, cpu_percent);

        let timeout_secs = get_env_or(
            env::EXECBOX_EXECUTION_TIMEOUT_ENV_VAR,
            DEFAULT_EXECUTION_TIMEOUT_SECS,
        )?;
        config.execution_timeout = timeout_from_secs(timeout_secs);
        config.input_hints = get_env_flag(env::EXECBOX_INPUT_HINTS_ENV_VAR, true)?;

        for id in RuntimeRegistry::default().ids() {
            if let Ok(image) = std::env::var(env::image_override_var(id)) {
                if !image.trim().is_empty() {
                    config
                        .image_overrides
                        .insert(id.to_string(), image.trim().to_string());
                }
            }
        }

        Ok(config)
    }

    /// Replaces the image of a runtime.
    pub fn with_image_override(mut self, runtime_id: &str, image: impl Into<String>) -> Self {
        self.image_overrides.insert(runtime_id.to_string(), image.into());
        self
    }

    /// The runtime registry with image overrides applied.
    pub fn runtime_registry(&self) -> ServerResult<RuntimeRegistry> {
        let mut registry = RuntimeRegistry::default();
        for (id, image) in &self.image_overrides {
            registry = registry.with_image(id, image.clone())?;
        }
        Ok(registry)
    }

    /// The settings every protocol connection runs with.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            input_hints: self.input_hints,
            execution_timeout: self.execution_timeout,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("127.0.0.1", 3000, false).unwrap();
        assert_eq!(config.get_addr().to_string(), "127.0.0.1:3000");
        assert_eq!(config.get_exec_root(), "/code");
        assert_eq!(
            config.get_execution_timeout(),
            &Some(Duration::from_secs(600))
        );
        assert!(*config.get_input_hints());
    }

    #[test]
    fn test_invalid_host_is_rejected() {
        assert!(matches!(
            ServerConfig::new("not a host", 3000, false),
            Err(ServerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_image_override_reaches_registry() {
        let config = ServerConfig::new("0.0.0.0", 3000, true)
            .unwrap()
            .with_image_override("javascript", "node:20-slim");
        let registry = config.runtime_registry().unwrap();
        assert_eq!(
            registry.get("javascript").unwrap().get_image(),
            "node:20-slim"
        );

        let config = config.with_image_override("ruby", "ruby:3");
        assert!(config.runtime_registry().is_err());
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        assert_eq!(timeout_from_secs(0), None);
        assert_eq!(timeout_from_secs(5), Some(Duration::from_secs(5)));
    }
}
