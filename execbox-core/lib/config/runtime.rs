//! The runtime registry: which languages can run, and how.

use std::collections::BTreeMap;

use execbox_utils::{PATH_PLACEHOLDER, SOURCE_FILE_STEM};
use getset::Getters;
use serde::Serialize;

use crate::{ExecboxError, ExecboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The built-in runtimes: id, image, command template and source extension.
const DEFAULT_RUNTIMES: [(&str, &str, &str, &str); 4] = [
    ("python", "python:3.10-slim", "python -u {path}/main.py", "py"),
    ("javascript", "node:18-slim", "node {path}/main.js", "js"),
    (
        "c",
        "gcc:latest",
        "gcc {path}/main.c -o {path}/main && {path}/main",
        "c",
    ),
    (
        "cpp",
        "gcc:latest",
        "g++ {path}/main.cpp -o {path}/main && {path}/main",
        "cpp",
    ),
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The execution profile of one supported language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Runtime {
    /// The language identifier clients use, e.g. `python`.
    id: String,

    /// The sandbox image the language runs in.
    image: String,

    /// The shell command that runs the deployed file. Contains `{path}`.
    command_template: String,

    /// The extension of the deployed source file, without the dot.
    extension: String,
}

/// The immutable table of supported runtimes, keyed by id.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    runtimes: BTreeMap<String, Runtime>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Runtime {
    /// Creates a new runtime profile.
    pub fn new(
        id: impl Into<String>,
        image: impl Into<String>,
        command_template: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            command_template: command_template.into(),
            extension: extension.into(),
        }
    }

    /// The name of the source file deployed for this runtime, e.g. `main.py`.
    pub fn source_file_name(&self) -> String {
        format!("{}.{}", SOURCE_FILE_STEM, self.extension)
    }

    /// The run command with `{path}` replaced by `exec_path`.
    pub fn command_for(&self, exec_path: &str) -> String {
        self.command_template.replace(PATH_PLACEHOLDER, exec_path)
    }
}

impl RuntimeRegistry {
    /// Creates a registry from the given runtimes.
    pub fn new(runtimes: impl IntoIterator<Item = Runtime>) -> Self {
        Self {
            runtimes: runtimes
                .into_iter()
                .map(|runtime| (runtime.id.clone(), runtime))
                .collect(),
        }
    }

    /// Replaces the image of the runtime `id`. Unknown ids are rejected.
    pub fn with_image(mut self, id: &str, image: impl Into<String>) -> ExecboxResult<Self> {
        let runtime = self
            .runtimes
            .get_mut(id)
            .ok_or_else(|| ExecboxError::UnsupportedRuntime(id.to_string()))?;
        runtime.image = image.into();
        Ok(self)
    }

    /// Looks up a runtime by id.
    pub fn get(&self, id: &str) -> ExecboxResult<&Runtime> {
        self.runtimes
            .get(id)
            .ok_or_else(|| ExecboxError::UnsupportedRuntime(id.to_string()))
    }

    /// The supported runtime ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.runtimes.keys().map(String::as_str)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new(
            DEFAULT_RUNTIMES
                .iter()
                .map(|(id, image, command, ext)| Runtime::new(*id, *image, *command, *ext)),
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
