//! Utility functions for working with execution paths inside sandboxes.

use crate::{ExecboxError, ExecboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest session id accepted as a path component.
pub const MAX_SESSION_ID_LEN: usize = 64;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that a session id can be used as a single path component.
///
/// Ids may only contain ASCII alphanumerics, `-` and `_`, so distinct ids always map to distinct
/// directories and no id can escape the execution root.
pub fn validate_session_id(session_id: &str) -> ExecboxResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ExecboxError::InvalidSessionId(session_id.to_string()))
    }
}

/// Returns the isolated path of a session under `exec_root`.
pub fn execution_path(exec_root: &str, session_id: &str) -> ExecboxResult<String> {
    validate_session_id(session_id)?;
    Ok(format!("{}/{}", exec_root.trim_end_matches('/'), session_id))
}

/// Whether `path` is `root` itself or lies below it.
pub fn is_within(path: &str, root: &str) -> bool {
    with_trailing_slash(path).starts_with(&with_trailing_slash(root))
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_paths_are_disjoint() {
        let a = execution_path("/code", "1700000000000").unwrap();
        let b = execution_path("/code/", "1700000000001").unwrap();
        assert_eq!(a, "/code/1700000000000");
        assert_eq!(b, "/code/1700000000001");
        assert!(!is_within(&a, &b));
        assert!(!is_within(&b, &a));
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("a1b2-c3_d4").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("a b").is_err());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/code/a/main.py", "/code/a"));
        assert!(is_within("/code/a", "/code/a"));
        assert!(!is_within("/code/ab/main.py", "/code/a"));
        assert!(!is_within("/code", "/code/a"));
    }
}
