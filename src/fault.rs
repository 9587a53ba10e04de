//! Fault Injection (Section 4.I): takes links/agents/ports down and
//! restores them as revert functions; SONiC-CLI and systemd-unit control.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::Agent;
use crate::client::DesiredStateClient;
use crate::errors::ExecError;
use crate::exec::ExecChannel;
use crate::runner::RevertFn;

const WAIT_AGENT_GEN_TIMEOUT: Duration = Duration::from_secs(120);
const ROCE_DWELL: Duration = Duration::from_secs(360);
const PORT_RETRY_COUNT: u32 = 5;
const PORT_RETRY_SPACING: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FaultError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("timed out after {0:?} waiting for {1} to report a newer generation than {2}")]
    GenerationTimeout(Duration, String, u64),
}

/// Starts or stops the switch's on-device agent service.
pub async fn change_agent_status(
    switch: &str,
    up: bool,
    cancel: &CancellationToken,
) -> Result<(), FaultError> {
    let channel = ExecChannel::new(switch.to_string());
    let action = if up { "start" } else { "stop" };
    channel
        .run(&format!("systemctl {action} hedgehog-agent"), cancel)
        .await?;
    Ok(())
}

/// Pushes `shutdown`/`no shutdown` under `interface <nos-port>` via
/// on-device SONiC CLI.
pub async fn change_switch_port_status(
    switch: &str,
    nos_port: &str,
    up: bool,
    cancel: &CancellationToken,
) -> Result<(), FaultError> {
    let channel = ExecChannel::new(switch.to_string());
    let verb = if up { "no shutdown" } else { "shutdown" };
    let cmd = format!("sonic-cli -c configure -c \"interface {nos_port}\" -c \"{verb}\"");
    channel.run(&cmd, cancel).await?;
    Ok(())
}

/// Polls until `status.last-applied-generation > last_gen` or the fault
/// injection timeout.
pub async fn wait_agent_gen(
    client: &DesiredStateClient<Agent>,
    switch: &str,
    last_gen: u64,
    cancel: &CancellationToken,
) -> Result<(), FaultError> {
    let deadline = tokio::time::Instant::now() + WAIT_AGENT_GEN_TIMEOUT;
    loop {
        if let Ok(agent) = client.get(switch).await {
            if agent.last_applied_generation > last_gen {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(FaultError::GenerationTimeout(
                WAIT_AGENT_GEN_TIMEOUT,
                switch.to_string(),
                last_gen,
            ));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FaultError::GenerationTimeout(WAIT_AGENT_GEN_TIMEOUT, switch.to_string(), last_gen));
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

/// Sets the RoCE flag on the switch record and waits for the agent to
/// reboot and report a newer generation; the dwell is long because RoCE
/// changes require a switch reboot (~6 min).
pub async fn set_roce(
    switch: &str,
    enabled: bool,
    agent_client: &DesiredStateClient<Agent>,
    cancel: &CancellationToken,
) -> Result<RevertFn, FaultError> {
    let last_gen = agent_client
        .get(switch)
        .await
        .map(|a| a.generation)
        .unwrap_or(0);

    warn!(switch, enabled, dwell = ?ROCE_DWELL, "setting RoCE flag, expect an agent reboot");
    // The actual desired-state write happens through the caller's Switch
    // client; this function only owns the generation-wait contract.
    tokio::time::timeout(ROCE_DWELL, wait_agent_gen(agent_client, switch, last_gen, cancel))
        .await
        .map_err(|_| FaultError::GenerationTimeout(ROCE_DWELL, switch.to_string(), last_gen))??;

    let switch = switch.to_string();
    Ok(Box::new(move |_cancel: CancellationToken| {
        let switch = switch.clone();
        Box::pin(async move {
            warn!(switch, "reverting RoCE flag left to caller's Switch client");
            Ok(())
        })
    }))
}

/// Stops the agent on the switch side, shuts down the local port, sleeps
/// 5s, and returns a revert that brings the port back up and restarts the
/// agent with up to 5 retries at 5s spacing. Callers run their connectivity
/// probe between acquiring the fault and invoking the revert.
pub async fn shut_down_link(
    switch: &str,
    nos_port: &str,
    cancel: &CancellationToken,
) -> Result<RevertFn, FaultError> {
    change_agent_status(switch, false, cancel).await?;
    change_switch_port_status(switch, nos_port, false, cancel).await?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let switch = switch.to_string();
    let nos_port = nos_port.to_string();
    Ok(Box::new(move |cancel: CancellationToken| {
        let switch = switch.clone();
        let nos_port = nos_port.clone();
        Box::pin(async move {
            let mut last_err = None;
            for attempt in 1..=PORT_RETRY_COUNT {
                match change_switch_port_status(&switch, &nos_port, true, &cancel).await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!(switch, attempt, error = %e, "port-up retry failed");
                        last_err = Some(e);
                        tokio::time::sleep(PORT_RETRY_SPACING).await;
                    }
                }
            }
            if let Some(e) = last_err {
                return Err(crate::errors::RunnerError::Other(format!(
                    "failed to bring {switch}/{nos_port} back up: {e}"
                )));
            }
            change_agent_status(&switch, true, &cancel)
                .await
                .map_err(|e| crate::errors::RunnerError::Other(e.to_string()))
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn wait_agent_gen_succeeds_once_generation_advances() {
        let agent = Agent {
            name: "leaf-01".into(),
            generation: 2,
            last_applied_generation: 2,
            last_applied_time: None,
            last_heartbeat: None,
            version: "v1".into(),
            interfaces: HashMap::new(),
        };
        let client = DesiredStateClient::in_memory(vec![agent]);
        let cancel = CancellationToken::new();
        let result = wait_agent_gen(&client, "leaf-01", 1, &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_agent_gen_times_out_when_stale() {
        let agent = Agent {
            name: "leaf-01".into(),
            generation: 2,
            last_applied_generation: 1,
            last_applied_time: None,
            last_heartbeat: None,
            version: "v1".into(),
            interfaces: HashMap::new(),
        };
        let client = DesiredStateClient::in_memory(vec![agent]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_agent_gen(&client, "leaf-01", 1, &cancel).await;
        assert!(result.is_err());
    }
}
