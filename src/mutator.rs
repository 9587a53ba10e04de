//! Topology Mutator (Section 4.F): applies a desired peering set
//! (fabric-level, gateway-level, external) idempotently, wiping anything
//! not in the set.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::Agent;
use crate::client::{ApplyOutcome, DesiredStateClient};
use crate::errors::{ReadinessError, StoreError};
use crate::readiness::{wait_ready, ReadinessOptions};
use crate::vpc::{ExternalPeering, GatewayPeering, VpcPeering};

/// The 15s post-write grace is a deliberate conservative bound (Section
/// 4.F): without it, races where an agent already reports "ready" for a
/// stale generation have been observed.
pub const POST_WRITE_GRACE: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum MutatorError {
    #[error("gateway peerings are disabled in the fabricator config")]
    GatewayFeatureDisabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

pub struct PeeringSet {
    pub vpc_peerings: Vec<VpcPeering>,
    pub external_peerings: Vec<ExternalPeering>,
    pub gateway_peerings: Vec<GatewayPeering>,
}

pub struct Mutator {
    pub vpc_peering_client: DesiredStateClient<VpcPeering>,
    pub external_peering_client: DesiredStateClient<ExternalPeering>,
    pub gateway_peering_client: DesiredStateClient<GatewayPeering>,
    pub agent_client: DesiredStateClient<Agent>,
    pub gateway_feature_enabled: bool,
}

impl Mutator {
    /// After this call, the live peering set of each kind equals `desired`
    /// exactly (Section 8, property 3).
    pub async fn apply_peerings(
        &self,
        desired: &PeeringSet,
        wait_for_ready: bool,
        expected_agents: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), MutatorError> {
        if !self.gateway_feature_enabled && !desired.gateway_peerings.is_empty() {
            return Err(MutatorError::GatewayFeatureDisabled);
        }

        let mut changed = false;
        changed |= reconcile(&self.vpc_peering_client, &desired.vpc_peerings, |p| &p.name).await?;
        changed |=
            reconcile(&self.external_peering_client, &desired.external_peerings, |p| &p.name)
                .await?;
        changed |=
            reconcile(&self.gateway_peering_client, &desired.gateway_peerings, |p| &p.name)
                .await?;

        if changed && wait_for_ready {
            info!(grace = ?POST_WRITE_GRACE, "peering set changed, waiting out post-write grace");
            tokio::time::sleep(POST_WRITE_GRACE).await;
            let opts = ReadinessOptions {
                applied_for: POST_WRITE_GRACE,
                timeout: Duration::from_secs(600),
                ..Default::default()
            };
            wait_ready(&self.agent_client, expected_agents, &opts, cancel).await?;
        }

        Ok(())
    }
}

/// Deletes every existing object not in `desired` (ignoring not-found),
/// then `create_or_update`s each desired entry. Returns whether anything
/// was mutated.
async fn reconcile<K, F>(
    client: &DesiredStateClient<K>,
    desired: &[K],
    name_of: F,
) -> Result<bool, StoreError>
where
    K: crate::client::Named + PartialEq,
    F: Fn(&K) -> &String,
{
    let existing = client.list().await?;
    let desired_names: Vec<&str> = desired.iter().map(|d| name_of(d).as_str()).collect();

    let mut changed = false;
    for obj in &existing {
        if !desired_names.contains(&obj.object_name()) {
            client.delete(obj.object_name()).await?;
            changed = true;
        }
    }

    for obj in desired {
        let name = name_of(obj).clone();
        let obj_clone = obj.clone();
        let (_, outcome) = client
            .create_or_update(&name, || obj_clone.clone(), |existing| *existing = obj_clone.clone())
            .await?;
        if outcome != ApplyOutcome::Unchanged {
            changed = true;
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpc::PeeringEntry;

    fn peering(name: &str) -> VpcPeering {
        VpcPeering {
            name: name.to_string(),
            permit: vec![(
                PeeringEntry {
                    vpc: "vpc-a".into(),
                    subnets: vec![],
                },
                PeeringEntry {
                    vpc: "vpc-b".into(),
                    subnets: vec![],
                },
            )],
            remote: None,
        }
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let client = DesiredStateClient::in_memory(vec![]);
        let desired = vec![peering("a-b")];
        let changed_first = reconcile(&client, &desired, |p| &p.name).await.unwrap();
        assert!(changed_first);
        let changed_second = reconcile(&client, &desired, |p| &p.name).await.unwrap();
        assert!(!changed_second, "second apply must be a no-op");
    }

    #[tokio::test]
    async fn reconcile_deletes_peerings_not_in_desired_set() {
        let client = DesiredStateClient::in_memory(vec![peering("stale")]);
        let desired = vec![peering("a-b")];
        reconcile(&client, &desired, |p| &p.name).await.unwrap();
        let live = client.list().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "a-b");
    }

    #[tokio::test]
    async fn gateway_peerings_rejected_when_feature_disabled() {
        let mutator = Mutator {
            vpc_peering_client: DesiredStateClient::in_memory(vec![]),
            external_peering_client: DesiredStateClient::in_memory(vec![]),
            gateway_peering_client: DesiredStateClient::in_memory(vec![]),
            agent_client: DesiredStateClient::in_memory(vec![]),
            gateway_feature_enabled: false,
        };
        let desired = PeeringSet {
            vpc_peerings: vec![],
            external_peerings: vec![],
            gateway_peerings: vec![GatewayPeering {
                name: "gw".into(),
                endpoints: Default::default(),
            }],
        };
        let cancel = CancellationToken::new();
        let err = mutator
            .apply_peerings(&desired, false, &[], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MutatorError::GatewayFeatureDisabled));
    }
}
