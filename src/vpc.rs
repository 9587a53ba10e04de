//! Mutable desired-state records (Section 3): VPCs, externals, and the three
//! kinds of peering. These are the records the Mutator (4.F) and Provisioner
//! (4.G) create, update and delete through the Desired-State Client (4.B).

use std::collections::HashMap;

use itertools::Itertools;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::client::Named;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VpcMode {
    L2Vni,
    L3Vni,
    L3Flat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct DhcpOptions {
    pub dns_servers: Vec<String>,
    pub time_servers: Vec<String>,
    pub mtu: Option<u32>,
    pub lease_seconds: Option<u32>,
    pub advertised_routes: Vec<String>,
    pub default_route_disable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct DhcpRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Dhcp {
    pub enable: bool,
    pub options: DhcpOptions,
    pub range: Option<DhcpRange>,
}

/// A subnet nested inside a [`Vpc`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Subnet {
    pub cidr: String,
    pub vlan: u32,
    pub gateway: Option<String>,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub host_bgp: bool,
    #[serde(default)]
    pub dhcp: Dhcp,
}

/// A permit group: subnets named here reach each other inside the VPC.
pub type PermitGroup = Vec<String>;

/// A named routing domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Vpc {
    pub name: String,
    pub mode: VpcMode,
    pub subnets: HashMap<String, Subnet>,
    #[serde(default)]
    pub permit: Vec<PermitGroup>,
}

impl Vpc {
    /// Subnets reachable from `from` under this VPC's intra-VPC policy
    /// (Section 4.D step 1).
    pub fn reachable_subnets_from(&self, from: &str) -> Vec<&str> {
        let Some(subnet) = self.subnets.get(from) else {
            return Vec::new();
        };
        if subnet.isolated {
            return self
                .permit
                .iter()
                .filter(|group| group.iter().any(|s| s == from))
                .flat_map(|group| group.iter().map(String::as_str))
                .filter(|s| *s != from)
                .collect();
        }
        if self.permit.is_empty() {
            return self
                .subnets
                .keys()
                .filter(|s| s.as_str() != from)
                .map(String::as_str)
                .collect();
        }
        self.permit
            .iter()
            .filter(|group| group.iter().any(|s| s == from))
            .flat_map(|group| group.iter().map(String::as_str))
            .filter(|s| *s != from)
            .unique()
            .collect()
    }
}

impl Named for Vpc {
    const KIND: &'static str = "Vpc";
    fn object_name(&self) -> &str {
        &self.name
    }
}

/// Binds a [`crate::model::Connection`] to a `VPC/subnet`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct VpcAttachment {
    pub name: String,
    pub connection: String,
    pub subnet: String, // "<vpc>/<subnet>"
}

impl VpcAttachment {
    pub fn vpc_name(&self) -> &str {
        self.subnet.split('/').next().unwrap_or_default()
    }

    pub fn subnet_name(&self) -> &str {
        self.subnet.split('/').nth(1).unwrap_or_default()
    }
}

impl Named for VpcAttachment {
    const KIND: &'static str = "VpcAttachment";
    fn object_name(&self) -> &str {
        &self.name
    }
}

/// One side of a [`VpcPeering`] permit list entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct PeeringEntry {
    pub vpc: String,
    #[serde(default)]
    pub subnets: Vec<String>, // empty => all subnets
}

/// Grants reachability between two VPCs through the fabric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct VpcPeering {
    pub name: String,
    pub permit: Vec<(PeeringEntry, PeeringEntry)>,
    pub remote: Option<String>,
}

impl VpcPeering {
    pub fn involves(&self, vpc_a: &str, vpc_b: &str) -> bool {
        self.permit.iter().any(|(a, b)| {
            (a.vpc == vpc_a && b.vpc == vpc_b) || (a.vpc == vpc_b && b.vpc == vpc_a)
        })
    }
}

impl Named for VpcPeering {
    const KIND: &'static str = "VpcPeering";
    fn object_name(&self) -> &str {
        &self.name
    }
}

/// A BGP or static egress target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct External {
    pub name: String,
    #[serde(default)]
    pub is_static: bool,
}

impl Named for External {
    const KIND: &'static str = "External";
    fn object_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ExternalAttachment {
    pub name: String,
    pub connection: String,
    pub external: String,
    #[serde(default)]
    pub proxy: bool,
}

impl Named for ExternalAttachment {
    const KIND: &'static str = "ExternalAttachment";
    fn object_name(&self) -> &str {
        &self.name
    }
}

/// Grants reachability between a `{vpc, subnets}` and an `{external, prefixes}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ExternalPeering {
    pub name: String,
    pub vpc: String,
    pub vpc_subnets: Vec<String>,
    pub external: String,
    pub prefixes: Vec<String>,
}

impl Named for ExternalPeering {
    const KIND: &'static str = "ExternalPeering";
    fn object_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Nat {
    Stateless,
    Stateful,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ExposeIp {
    pub cidr: Option<String>,
    pub vpc_subnet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct GatewayExpose {
    pub ips: Vec<ExposeIp>,
    #[serde(rename = "as", default)]
    pub as_cidrs: Vec<String>,
    pub nat: Option<Nat>,
    #[serde(default)]
    pub default_destination: bool,
}

/// Realized by the external gateway component; exactly two endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct GatewayPeering {
    pub name: String,
    pub endpoints: HashMap<String, Vec<GatewayExpose>>,
}

impl GatewayPeering {
    /// Whether this peering exposes `subnet_name` (matched either by
    /// explicit `vpc-subnet` name or by CIDR equality, per Section 4.D
    /// step 3).
    pub fn exposes(&self, endpoint: &str, vpc_subnet: &str, cidr: Option<&str>) -> bool {
        let Some(exposes) = self.endpoints.get(endpoint) else {
            return false;
        };
        exposes.iter().any(|e| {
            e.ips.iter().any(|ip| {
                ip.vpc_subnet.as_deref() == Some(vpc_subnet)
                    || (cidr.is_some() && ip.cidr.as_deref() == cidr)
            })
        })
    }

    pub fn other_endpoint<'a>(&'a self, endpoint: &str) -> Option<&'a str> {
        self.endpoints
            .keys()
            .map(String::as_str)
            .find(|e| *e != endpoint)
    }
}

impl Named for GatewayPeering {
    const KIND: &'static str = "GatewayPeering";
    fn object_name(&self) -> &str {
        &self.name
    }
}
