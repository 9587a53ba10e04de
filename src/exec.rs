//! Remote-Exec Channel (Section 4.A): context-aware command execution over
//! a persistent session to a VM, with retry on transport errors.

use std::time::Duration;

use openssh::{KnownHosts, Session};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ExecError;

const MAX_TRANSPORT_RETRIES: u32 = 3;
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Output of a command run through the channel.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One logical channel per (target, session) pair. The channel is
/// single-command-at-a-time: callers needing parallelism to the same
/// target open multiple channels.
pub struct ExecChannel {
    target: String,
    session: Mutex<Option<Session>>,
}

impl ExecChannel {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            session: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Session, ExecError> {
        Session::connect(&self.target, KnownHosts::Accept)
            .await
            .map_err(|e| ExecError::Transport {
                target: self.target.clone(),
                command: "ssh: connect".into(),
                message: e.to_string(),
            })
    }

    /// Runs `command` on the target, cancelling the in-flight command when
    /// `cancel` fires. Retries up to [`MAX_TRANSPORT_RETRIES`] times with
    /// uniformly distributed backoff when the failure is a transport error
    /// (marker `"ssh:"`); other errors return immediately. The outer
    /// `cancel` token is the only timeout — there is no implicit one.
    pub async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ExecError::Cancelled {
                        target: self.target.clone(),
                        command: command.to_string(),
                    });
                }
                result = self.run_once(command) => result,
            };

            match result {
                Ok(out) => return Ok(out),
                Err(err) if err.is_transport() && attempt < MAX_TRANSPORT_RETRIES => {
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(BACKOFF_MIN..=BACKOFF_MAX)
                    };
                    warn!(target = %self.target, attempt, backoff = ?jitter, "remote-exec transport error, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ExecError::Cancelled {
                                target: self.target.clone(),
                                command: command.to_string(),
                            });
                        }
                        _ = tokio::time::sleep(jitter) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once(&self, command: &str) -> Result<ExecOutput, ExecError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let session = guard.as_ref().expect("session just established");

        let output = session
            .command("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.to_lowercase().contains("ssh:") || msg.to_lowercase().contains("broken pipe")
                {
                    *guard = None; // force reconnect on next attempt
                }
                ExecError::Transport {
                    target: self.target.clone(),
                    command: command.to_string(),
                    message: format!("ssh: {msg}"),
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            debug!(target = %self.target, command, code = ?output.status.code(), "command exited non-zero");
            return Err(ExecError::NonZeroExit {
                target: self.target.clone(),
                command: command.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(ExecOutput { stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_message_carries_ssh_marker() {
        let err = ExecError::Transport {
            target: "server-01".into(),
            command: "echo hi".into(),
            message: "ssh: connection refused".into(),
        };
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn run_respects_cancellation_before_connecting() {
        let channel = ExecChannel::new("unreachable.invalid");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = channel.run("true", &cancel).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }
}
