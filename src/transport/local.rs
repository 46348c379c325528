//! SF-010: Local execution via `bash`.

use super::{ExecOutput, Script, TransportError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Execute a script locally with `bash -c`. Uses bash (not sh/dash) because
/// scripts may rely on `set -o pipefail`. [`Script::stdin`] is piped in.
///
/// Dropping the returned future kills the script, so a provider timeout
/// never leaves it running.
pub async fn exec_local(script: &Script) -> Result<ExecOutput, TransportError> {
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(&script.body)
        .envs(&script.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TransportError::Spawn)?;

    let pipe = child.stdin.take();
    let data = script.stdin.clone();
    let feed = async move {
        let (Some(mut pipe), Some(data)) = (pipe, data) else {
            return Ok(());
        };
        // A script that never reads stdin closes the pipe early.
        match pipe.write_all(data.as_bytes()).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
            _ => Ok(()),
        }
    };

    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    fed.map_err(TransportError::Io)?;
    let output = output.map_err(TransportError::Io)?;
    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
