//! External-process tool adapter.
//!
//! Protocol: the zone is written to the child's stdin as a single JSON line
//! (`{"tool", "timeout_ms", "zone"}`), stdin is closed, and the first
//! non-empty stdout line must be a JSON [`ToolOutput`]. Anything on stderr is
//! only used to explain a non-zero exit. The child is killed when the attempt
//! times out or is cancelled.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use zoneflow_shared::{Result, ToolOutput, Zone, ZoneflowError};

use super::ToolAdapter;

#[derive(Serialize)]
struct ProcessRequest<'a> {
    tool: &'a str,
    timeout_ms: u64,
    zone: &'a Zone,
}

#[derive(Debug, Clone)]
pub struct ProcessAdapter {
    name: String,
    program: String,
    args: Vec<String>,
}

impl ProcessAdapter {
    pub fn new(name: &str, command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            ZoneflowError::config(format!("tool '{name}' has an empty command"))
        })?;
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn exec_error(&self, message: impl Into<String>) -> ZoneflowError {
        ZoneflowError::ToolExecution {
            tool: self.name.clone(),
            message: message.into(),
        }
    }

    async fn run(&self, zone: &Zone, timeout: Duration) -> Result<ToolOutput> {
        let mut request = serde_json::to_string(&ProcessRequest {
            tool: &self.name,
            timeout_ms: timeout.as_millis() as u64,
            zone,
        })
        .map_err(|e| self.exec_error(format!("failed to encode request: {e}")))?;
        request.push('\n');

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.exec_error(format!("failed to spawn `{}`: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.exec_error("failed to capture stdin"))?;
        stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| self.exec_error(format!("failed to write request: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.exec_error(format!("failed to read output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(self.exec_error(format!("exited with {}: {detail}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| self.exec_error("produced no output"))?;
        serde_json::from_str(line).map_err(|e| self.exec_error(format!("invalid output: {e}")))
    }
}

#[async_trait]
impl ToolAdapter for ProcessAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(tool = %self.name, zone_id = %zone.id))]
    async fn execute(
        &self,
        zone: &Zone,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ToolOutput> {
        debug!(program = %self.program, "spawning tool process");
        // Dropping the `run` future drops the child, which kills it.
        tokio::select! {
            _ = cancel.cancelled() => Err(self.exec_error("cancelled")),
            res = tokio::time::timeout(timeout, self.run(zone, timeout)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ZoneflowError::ToolTimeout {
                    tool: self.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        }
    }
}
