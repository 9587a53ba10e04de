//! Readiness Oracle (Section 4.C): predicts whether an agent's
//! last-applied generation has caught up to its desired generation and has
//! held for a dwell time.

use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::client::DesiredStateClient;
use crate::errors::ReadinessError;

#[derive(Debug, Clone)]
pub struct ReadinessOptions {
    /// Dwell time the agent's last apply must have held (Section 3, invariant iv).
    pub applied_for: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Desired version every agent in scope must report, to distinguish
    /// "ready but not updated" (a controller bug) from genuine readiness.
    pub desired_version: String,
    /// Log the not-ready set every N polls.
    pub log_every_n_polls: u32,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self {
            applied_for: Duration::from_secs(15),
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            desired_version: String::new(),
            log_every_n_polls: 6,
        }
    }
}

/// Polls `expected` agent names against the Agent store until every one is
/// ready (Section 3 invariant iv) and running the desired version, or the
/// timeout/cancellation fires.
pub async fn wait_ready(
    client: &DesiredStateClient<Agent>,
    expected: &[String],
    opts: &ReadinessOptions,
    cancel: &CancellationToken,
) -> Result<(), ReadinessError> {
    let deadline = tokio::time::Instant::now() + opts.timeout;
    let mut poll_count: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ReadinessError::NotReady(opts.timeout, not_ready_names(client, expected, opts).await?));
        }

        let agents = client.list().await?;
        let by_name: std::collections::HashMap<&str, &Agent> =
            agents.iter().map(|a| (a.name.as_str(), a)).collect();

        let now = SystemTime::now();
        let mut not_ready = Vec::new();
        let mut ready_but_stale_version = Vec::new();

        for name in expected {
            match by_name.get(name.as_str()) {
                Some(agent) if agent.is_ready(now, opts.applied_for) => {
                    if !opts.desired_version.is_empty() && !agent.is_updated(&opts.desired_version)
                    {
                        ready_but_stale_version.push(name.clone());
                    }
                }
                _ => not_ready.push(name.clone()),
            }
        }

        if not_ready.is_empty() {
            if ready_but_stale_version.is_empty() {
                info!(agents = expected.len(), "fleet ready and updated");
                return Ok(());
            }
            return Err(ReadinessError::ReadyButNotUpdated(ready_but_stale_version));
        }

        poll_count += 1;
        if poll_count.is_multiple_of(opts.log_every_n_polls) {
            warn!(not_ready = ?not_ready, "still waiting for fleet readiness");
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(ReadinessError::NotReady(opts.timeout, not_ready));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ReadinessError::NotReady(opts.timeout, not_ready));
            }
            _ = tokio::time::sleep(opts.poll_interval) => {}
        }
    }
}

async fn not_ready_names(
    client: &DesiredStateClient<Agent>,
    expected: &[String],
    opts: &ReadinessOptions,
) -> Result<Vec<String>, ReadinessError> {
    let agents = client.list().await?;
    let now = SystemTime::now();
    let by_name: std::collections::HashMap<&str, &Agent> =
        agents.iter().map(|a| (a.name.as_str(), a)).collect();
    Ok(expected
        .iter()
        .filter(|name| {
            !by_name
                .get(name.as_str())
                .map(|a| a.is_ready(now, opts.applied_for))
                .unwrap_or(false)
        })
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ready_agent(name: &str) -> Agent {
        let now = SystemTime::now();
        Agent {
            name: name.into(),
            generation: 1,
            last_applied_generation: 1,
            last_applied_time: Some(now - Duration::from_secs(60)),
            last_heartbeat: Some(now - Duration::from_secs(1)),
            version: "v1".into(),
            interfaces: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn wait_ready_succeeds_immediately_when_already_ready() {
        let client = DesiredStateClient::in_memory(vec![ready_agent("leaf-01")]);
        let opts = ReadinessOptions {
            desired_version: "v1".into(),
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = wait_ready(&client, &["leaf-01".to_string()], &opts, &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_ready_times_out_on_missing_agent() {
        let client = DesiredStateClient::<Agent>::in_memory(vec![]);
        let opts = ReadinessOptions {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let err = wait_ready(&client, &["leaf-01".to_string()], &opts, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::NotReady(_, _)));
    }

    #[tokio::test]
    async fn wait_ready_distinguishes_ready_but_stale_version() {
        let mut agent = ready_agent("leaf-01");
        agent.version = "v0".into();
        let client = DesiredStateClient::in_memory(vec![agent]);
        let opts = ReadinessOptions {
            desired_version: "v1".into(),
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let err = wait_ready(&client, &["leaf-01".to_string()], &opts, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::ReadyButNotUpdated(_)));
    }
}
