use serde::{Deserialize, Serialize};

/// Parameters for creating one remote exec session.
///
/// # Example
///
/// ```rust
/// use exec_link::SessionSpec;
///
/// let spec = SessionSpec::new("tools", "/bin/bash")
///     .with_workdir("/projects")
///     .with_size(120, 40);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Execution target: the container/machine the command runs in.
    pub target: String,

    /// Command line to execute.
    #[serde(rename = "cmd")]
    pub command_line: String,

    /// Working directory for the command (empty = target default).
    #[serde(rename = "cwd")]
    pub workdir: String,

    /// Initial terminal width in columns.
    pub cols: u16,

    /// Initial terminal height in rows.
    pub rows: u16,
}

impl SessionSpec {
    /// Create a spec with a default 80x24 geometry and no working directory.
    pub fn new(target: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            command_line: command_line.into(),
            workdir: String::new(),
            cols: 80,
            rows: 24,
        }
    }

    /// Set the working directory.
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the initial terminal geometry.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}
