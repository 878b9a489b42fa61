use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::link::{self, Connection};
use super::ChannelTransport;
use crate::error::{BridgeError, BridgeResult};

/// How long a host gets to exit on its own after its input is closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// A host running as a child process, reached over its stdin/stdout.
///
/// The process boundary is the isolation boundary: nothing but serialized frames
/// crosses it.
pub struct HostProcess {
    child: Child,
    connection: Connection,
}

impl HostProcess {
    /// Spawn `command` with piped stdio and connect a channel to it. The child's
    /// stderr is forwarded into this process's log.
    pub fn spawn(mut command: Command) -> BridgeResult<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Protocol("Failed to capture host stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Protocol("Failed to capture host stdout".into()))?;

        // Keep draining stderr so the host never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let pid = child.id().unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(text)) if !text.is_empty() => {
                            log::debug!("[host:{}] {}", pid, text);
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
            });
        }

        let connection = link::connect(stdout, stdin);
        log::info!(
            "Started host process {} on channel {}",
            child.id().unwrap_or_default(),
            connection.transport().id()
        );

        Ok(Self { child, connection })
    }

    pub fn transport(&self) -> Arc<ChannelTransport> {
        self.connection.transport()
    }

    /// Close the channel and wait for the host to exit, killing it after a grace period.
    pub async fn shutdown(self) -> BridgeResult<()> {
        let HostProcess {
            mut child,
            connection,
        } = self;
        connection.shutdown().await;

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(status) => {
                log::info!("Host process exited: {}", status?);
            }
            Err(_) => {
                log::warn!("Host process did not exit gracefully, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}
