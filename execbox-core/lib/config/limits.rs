use execbox_utils::{DEFAULT_SANDBOX_CPU_PERCENT, DEFAULT_SANDBOX_MEMORY_MIB};
use getset::CopyGetters;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The CFS period the CPU quota is expressed against, in microseconds.
pub const CPU_PERIOD_MICROS: i64 = 100_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Static resource limits applied to every pooled sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
pub struct SandboxLimits {
    /// Memory ceiling in MiB.
    memory_mib: u32,

    /// CPU share in percent of one CPU.
    cpu_percent: u32,

    /// Whether the sandbox may reach the network.
    network_enabled: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxLimits {
    /// Creates limits with networking disabled.
    pub fn new(memory_mib: u32, cpu_percent: u32) -> Self {
        Self {
            memory_mib,
            cpu_percent,
            network_enabled: false,
        }
    }

    /// The memory ceiling in bytes.
    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_mib) * 1024 * 1024
    }

    /// The CPU quota per [`CPU_PERIOD_MICROS`].
    pub fn cpu_quota_micros(&self) -> i64 {
        CPU_PERIOD_MICROS * i64::from(self.cpu_percent) / 100
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::new(DEFAULT_SANDBOX_MEMORY_MIB, DEFAULT_SANDBOX_CPU_PERCENT)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(limits.cpu_quota_micros(), 50_000);
        assert!(!limits.get_network_enabled());
    }
}
