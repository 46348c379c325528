//! SF-010: Script execution transport used by the `command` provider.

pub mod local;

use std::collections::BTreeMap;
use thiserror::Error;

/// A script plus the environment it runs with.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub body: String,
    pub env: BTreeMap<String, String>,
    /// Written to the script's stdin after the body has been read
    pub stdin: Option<String>,
}

impl Script {
    pub fn new(body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// Output from executing a script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_summary(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn bash: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("script I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Execute a script on this host.
pub async fn exec_script(script: &Script) -> Result<ExecOutput, TransportError> {
    local::exec_local(script).await
}
