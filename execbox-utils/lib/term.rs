//! Terminal output helpers.

use std::sync::LazyLock;

use console::{style, Emoji};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// A green checkmark used to mark completed steps.
pub static CHECKMARK: LazyLock<String> =
    LazyLock::new(|| format!("{}", style(Emoji("✔", "+")).green()));
