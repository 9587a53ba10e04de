//! VPC Provisioner (Section 4.G): allocates subnets/VLANs, builds VPCs and
//! attachments to cover all servers, and programs per-server host
//! networking.

use std::collections::HashMap;
use std::str::FromStr;

use ipnet::Ipv4Net;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::Agent;
use crate::client::{DesiredStateClient, Named};
use crate::errors::{ExecError, StoreError};
use crate::exec::ExecChannel;
use crate::model::{sort_servers_by_id, Connection, Server};
use crate::readiness::{wait_ready, ReadinessOptions};
use crate::vpc::{Subnet, Vpc, VpcAttachment, VpcMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashPolicy {
    Layer2,
    Layer2Plus3,
    Layer3Plus4,
    Encap2Plus3,
    Encap3Plus4,
    VlanSrcMac,
}

impl HashPolicy {
    /// Only `Layer2` and `Layer2Plus3` are strictly 802.3ad-compliant; the
    /// rest produce an advisory warning, never an error (Section 9).
    pub fn is_8023ad_compliant(self) -> bool {
        matches!(self, HashPolicy::Layer2 | HashPolicy::Layer2Plus3)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashPolicy::Layer2 => "layer2",
            HashPolicy::Layer2Plus3 => "layer2+3",
            HashPolicy::Layer3Plus4 => "layer3+4",
            HashPolicy::Encap2Plus3 => "encap2+3",
            HashPolicy::Encap3Plus4 => "encap3+4",
            HashPolicy::VlanSrcMac => "vlan+srcmac",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub servers_per_subnet: u32,
    pub subnets_per_vpc: u32,
    pub vpc_mode: VpcMode,
    pub vlan_start: u32,
    pub ipv4_base: Ipv4Net,
    pub hash_policy: HashPolicy,
    pub wait_for_ready: bool,
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Readiness(#[from] crate::errors::ReadinessError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("server {server} hostname mismatch: expected {expected}, got {actual}")]
    HostnameMismatch {
        server: String,
        expected: String,
        actual: String,
    },

    #[error("server {server} acquired prefix {acquired} is not contained in expected subnet {expected}")]
    PrefixMismatch {
        server: String,
        acquired: String,
        expected: String,
    },

    #[error("could not parse acquired DHCP prefix for server {0}")]
    UnparseablePrefix(String),
}

/// One allocated subnet's planned contents before being sliced into a VPC.
struct Allocation {
    vpc_index: usize,
    subnet_name: String,
    cidr: Ipv4Net,
    vlan: u32,
    servers: Vec<Server>,
}

pub struct Provisioner {
    pub vpc_client: DesiredStateClient<Vpc>,
    pub attachment_client: DesiredStateClient<VpcAttachment>,
    pub agent_client: DesiredStateClient<Agent>,
}

impl Provisioner {
    /// Section 4.G's seven-step algorithm.
    pub async fn setup_vpcs(
        &self,
        mut servers: Vec<Server>,
        connections: &HashMap<String, Connection>,
        opts: &ProvisionOptions,
        expected_agents: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<VpcAttachment>, ProvisionError> {
        if !opts.hash_policy.is_8023ad_compliant() {
            warn!(policy = opts.hash_policy.as_str(), "hash policy is not 802.3ad-compliant");
        }

        // Step 1: sort servers by numeric id.
        sort_servers_by_id(&mut servers);

        // Step 3: walk servers, skipping unsupported ESLAG combinations.
        let eligible: Vec<Server> = servers
            .into_iter()
            .filter(|s| {
                let is_eslag = connections.get(&s.connection).map(|c| c.is_eslag()).unwrap_or(false);
                !(is_eslag && opts.vpc_mode != VpcMode::L2Vni)
            })
            .collect();

        let allocations = allocate(&eligible, opts);

        // Step 4: build VPC and attachment records.
        let mut vpcs: Vec<Vpc> = Vec::new();
        let mut attachments: Vec<VpcAttachment> = Vec::new();
        let mut by_vpc: HashMap<usize, HashMap<String, Subnet>> = HashMap::new();

        for alloc in &allocations {
            let subnet = Subnet {
                cidr: alloc.cidr.to_string(),
                vlan: alloc.vlan,
                gateway: alloc.cidr.hosts().next().map(|ip| ip.to_string()),
                isolated: false,
                restricted: false,
                host_bgp: false,
                dhcp: Default::default(),
            };
            by_vpc
                .entry(alloc.vpc_index)
                .or_default()
                .insert(alloc.subnet_name.clone(), subnet);

            for server in &alloc.servers {
                attachments.push(VpcAttachment {
                    name: format!("{}-attach", server.name),
                    connection: server.connection.clone(),
                    subnet: format!("vpc-{:02}/{}", alloc.vpc_index + 1, alloc.subnet_name),
                });
            }
        }

        for (vpc_index, subnets) in by_vpc {
            vpcs.push(Vpc {
                name: format!("vpc-{:02}", vpc_index + 1),
                mode: opts.vpc_mode,
                subnets,
                permit: vec![],
            });
        }

        // Step 5: apply via Desired-State Client; delete anything not in
        // the desired set (force-cleanup).
        reconcile(&self.vpc_client, &vpcs).await?;
        reconcile(&self.attachment_client, &attachments).await?;

        // Step 6: wait ready.
        if opts.wait_for_ready {
            let readiness_opts = ReadinessOptions::default();
            wait_ready(&self.agent_client, expected_agents, &readiness_opts, cancel).await?;
        }

        // Step 7: per-server host networking, concurrently.
        let mut tasks = Vec::new();
        for alloc in &allocations {
            for server in &alloc.servers {
                let server_name = server.name.clone();
                let vlan = alloc.vlan;
                let cidr = alloc.cidr;
                let hash_policy = opts.hash_policy;
                let vpc_mode = opts.vpc_mode;
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    configure_host(&server_name, vlan, hash_policy, cidr, vpc_mode, &cancel).await
                }));
            }
        }
        for task in tasks {
            task.await.expect("host configuration task panicked")?;
        }

        Ok(attachments)
    }
}

fn allocate(servers: &[Server], opts: &ProvisionOptions) -> Vec<Allocation> {
    let mut vlan_iter = opts.vlan_start..;
    let mut subnet_iter = opts.ipv4_base.subnets(24).into_iter().flatten();

    let mut allocations = Vec::new();
    let chunks = servers.chunks(opts.servers_per_subnet.max(1) as usize);

    for (subnet_idx, chunk) in (0_u32..).zip(chunks) {
        let vpc_index = (subnet_idx / opts.subnets_per_vpc.max(1)) as usize;
        let vlan = vlan_iter.next().expect("vlan namespace exhausted");
        let cidr = subnet_iter.next().expect("ipv4 namespace exhausted");
        allocations.push(Allocation {
            vpc_index,
            subnet_name: format!("subnet-{:02}", (subnet_idx % opts.subnets_per_vpc.max(1)) + 1),
            cidr,
            vlan,
            servers: chunk.to_vec(),
        });
    }
    allocations
}

async fn reconcile<K: Named + PartialEq>(
    client: &DesiredStateClient<K>,
    desired: &[K],
) -> Result<(), StoreError> {
    let existing = client.list().await?;
    let desired_names: Vec<&str> = desired.iter().map(|d| d.object_name()).collect();
    for obj in &existing {
        if !desired_names.contains(&obj.object_name()) {
            client.delete(obj.object_name()).await?;
        }
    }
    for obj in desired {
        let name = obj.object_name().to_string();
        let obj_clone = obj.clone();
        client
            .create_or_update(&name, || obj_clone.clone(), |existing| *existing = obj_clone.clone())
            .await?;
    }
    Ok(())
}

async fn configure_host(
    server: &str,
    vlan: u32,
    hash_policy: HashPolicy,
    expected_subnet: Ipv4Net,
    vpc_mode: VpcMode,
    cancel: &CancellationToken,
) -> Result<(), ProvisionError> {
    let channel = ExecChannel::new(server.to_string());

    let hostname_out = channel.run("hostname", cancel).await?;
    let hostname = hostname_out.stdout.trim();
    if hostname != server {
        return Err(ProvisionError::HostnameMismatch {
            server: server.to_string(),
            expected: server.to_string(),
            actual: hostname.to_string(),
        });
    }

    channel.run("/opt/bin/hhnet cleanup", cancel).await?;

    let bond_cmd = format!("/opt/bin/hhnet bond {vlan} {} eth1 eth2", hash_policy.as_str());
    channel.run(&bond_cmd, cancel).await?;

    let out = channel
        .run(&format!("/opt/bin/hhnet vlan {vlan} bond0"), cancel)
        .await?;
    let acquired = out
        .stdout
        .lines()
        .last()
        .and_then(|line| Ipv4Net::from_str(line.trim()).ok())
        .ok_or_else(|| ProvisionError::UnparseablePrefix(server.to_string()))?;

    // In L3 modes the host address is always /32; in L2VNI it matches the subnet prefix.
    let expected_host_prefix_len = if vpc_mode == VpcMode::L2Vni {
        expected_subnet.prefix_len()
    } else {
        32
    };
    let contained =
        expected_subnet.contains(&acquired.addr()) && acquired.prefix_len() == expected_host_prefix_len;
    if !contained {
        return Err(ProvisionError::PrefixMismatch {
            server: server.to_string(),
            acquired: acquired.to_string(),
            expected: expected_subnet.to_string(),
        });
    }

    Ok(())
}
