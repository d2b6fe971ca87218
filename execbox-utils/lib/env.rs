//! Environment variable names and helpers for reading them.

use std::{fmt::Display, str::FromStr};

use crate::{UtilsError, UtilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the root of execution paths inside sandboxes.
pub const EXECBOX_EXEC_ROOT_ENV_VAR: &str = "EXECBOX_EXEC_ROOT";

/// Environment variable for the sandbox memory ceiling in MiB.
pub const EXECBOX_MEMORY_MB_ENV_VAR: &str = "EXECBOX_MEMORY_MB";

/// Environment variable for the sandbox CPU share in percent.
pub const EXECBOX_CPU_PERCENT_ENV_VAR: &str = "EXECBOX_CPU_PERCENT";

/// Environment variable for the wall-clock execution timeout in seconds. `0` disables it.
pub const EXECBOX_EXECUTION_TIMEOUT_ENV_VAR: &str = "EXECBOX_EXECUTION_TIMEOUT_SECS";

/// Environment variable toggling the heuristic `input_required` hints.
pub const EXECBOX_INPUT_HINTS_ENV_VAR: &str = "EXECBOX_INPUT_HINTS";

/// Prefix of the per-runtime image override variables, e.g. `EXECBOX_IMAGE_PYTHON`.
pub const EXECBOX_IMAGE_ENV_PREFIX: &str = "EXECBOX_IMAGE_";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads an environment variable and parses it, falling back to `default` when it is unset or
/// empty.
pub fn get_env_or<T>(name: &str, default: T) -> UtilsResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_env_value(name, &value),
        _ => Ok(default),
    }
}

/// Reads a boolean environment variable. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn get_env_flag(name: &str, default: bool) -> UtilsResult<bool> {
    let Ok(value) = std::env::var(name) else {
        return Ok(default);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(UtilsError::InvalidEnvValue {
            name: name.to_string(),
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// Returns the name of the image override variable for a runtime id.
pub fn image_override_var(runtime_id: &str) -> String {
    format!(
        "{}{}",
        EXECBOX_IMAGE_ENV_PREFIX,
        runtime_id.to_ascii_uppercase()
    )
}

fn parse_env_value<T>(name: &str, value: &str) -> UtilsResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| UtilsError::InvalidEnvValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_override_var() {
        assert_eq!(image_override_var("python"), "EXECBOX_IMAGE_PYTHON");
        assert_eq!(image_override_var("cpp"), "EXECBOX_IMAGE_CPP");
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value::<u32>("X", " 42 ").unwrap(), 42);
        assert!(parse_env_value::<u32>("X", "many").is_err());
    }

    #[test]
    fn test_unset_variables_use_defaults() {
        let name = "EXECBOX_TEST_SURELY_UNSET_VARIABLE";
        assert_eq!(get_env_or(name, 7u64).unwrap(), 7);
        assert!(get_env_flag(name, true).unwrap());
    }
}
