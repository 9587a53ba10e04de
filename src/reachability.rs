//! Reachability Oracle (Section 4.D): a pure predicate from VPC/peering/
//! external records to a reachability verdict for any source/destination
//! pair. Never touches the data plane — this is the ground truth the
//! Prober (4.E) is compared against.

use std::collections::HashMap;

use crate::vpc::{External, ExternalPeering, GatewayPeering, Vpc, VpcPeering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityReason {
    IntraVpc,
    SwitchPeering,
    GatewayPeering,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
    pub reachable: bool,
    pub reason: Option<ReachabilityReason>,
    pub peering: Option<String>,
}

impl Reachability {
    fn unreachable() -> Self {
        Self {
            reachable: false,
            reason: None,
            peering: None,
        }
    }

    fn reachable(reason: ReachabilityReason, peering: impl Into<String>) -> Self {
        Self {
            reachable: true,
            reason: Some(reason),
            peering: Some(peering.into()),
        }
    }
}

/// An endpoint: either a VPC subnet or an external prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    VpcSubnet { vpc: String, subnet: String },
    External { name: String, prefix: String },
}

/// A throw-away snapshot of the records the oracle reasons over, built on
/// demand per call (Section 9's "cyclic references" design note).
pub struct ReachabilitySnapshot<'a> {
    pub vpcs: &'a HashMap<String, Vpc>,
    pub vpc_peerings: &'a [VpcPeering],
    pub externals: &'a HashMap<String, External>,
    pub external_peerings: &'a [ExternalPeering],
    pub gateway_peerings: &'a [GatewayPeering],
    /// vpc name -> switch-groups it has at least one attachment on.
    pub vpc_switch_groups: &'a HashMap<String, Vec<String>>,
}

impl<'a> ReachabilitySnapshot<'a> {
    pub fn reachable(&self, src: &Endpoint, dst: &Endpoint) -> Reachability {
        match (src, dst) {
            (
                Endpoint::VpcSubnet {
                    vpc: src_vpc,
                    subnet: src_subnet,
                },
                Endpoint::VpcSubnet {
                    vpc: dst_vpc,
                    subnet: dst_subnet,
                },
            ) if src_vpc == dst_vpc => self.intra_vpc(src_vpc, src_subnet, dst_subnet),
            (
                Endpoint::VpcSubnet {
                    vpc: src_vpc,
                    subnet: src_subnet,
                },
                Endpoint::VpcSubnet {
                    vpc: dst_vpc,
                    subnet: dst_subnet,
                },
            ) => self
                .switch_peering(src_vpc, src_subnet, dst_vpc, dst_subnet)
                .or_else(|| self.gateway_peering_vpc_to_vpc(src_vpc, src_subnet, dst_vpc, dst_subnet))
                .unwrap_or_else(Reachability::unreachable),
            (
                Endpoint::VpcSubnet {
                    vpc: src_vpc,
                    subnet: src_subnet,
                },
                Endpoint::External {
                    name: ext_name,
                    prefix,
                },
            ) => self
                .external_peering(src_vpc, src_subnet, ext_name, prefix)
                .or_else(|| self.gateway_default_destination(src_vpc, src_subnet, ext_name))
                .unwrap_or_else(Reachability::unreachable),
            _ => Reachability::unreachable(),
        }
    }

    /// Step 1: same-VPC reachability.
    fn intra_vpc(&self, vpc_name: &str, src: &str, dst: &str) -> Reachability {
        let Some(vpc) = self.vpcs.get(vpc_name) else {
            return Reachability::unreachable();
        };
        if src == dst {
            if let Some(subnet) = vpc.subnets.get(src) {
                if subnet.restricted {
                    return Reachability::unreachable();
                }
            }
            return Reachability::reachable(ReachabilityReason::IntraVpc, vpc_name);
        }
        if vpc.reachable_subnets_from(src).contains(&dst) {
            Reachability::reachable(ReachabilityReason::IntraVpc, vpc_name)
        } else {
            Reachability::unreachable()
        }
    }

    /// Step 2: VPCPeering search.
    fn switch_peering(
        &self,
        src_vpc: &str,
        src_subnet: &str,
        dst_vpc: &str,
        dst_subnet: &str,
    ) -> Option<Reachability> {
        for peering in self.vpc_peerings {
            if !peering.involves(src_vpc, dst_vpc) {
                continue;
            }
            if let Some(group) = &peering.remote {
                let src_in_group = self
                    .vpc_switch_groups
                    .get(src_vpc)
                    .map(|gs| gs.iter().any(|g| g == group))
                    .unwrap_or(false);
                let dst_in_group = self
                    .vpc_switch_groups
                    .get(dst_vpc)
                    .map(|gs| gs.iter().any(|g| g == group))
                    .unwrap_or(false);
                if !src_in_group || !dst_in_group {
                    continue;
                }
            }
            for (a, b) in &peering.permit {
                let (src_entry, dst_entry) = if a.vpc == src_vpc {
                    (a, b)
                } else {
                    (b, a)
                };
                let src_ok = src_entry.subnets.is_empty()
                    || src_entry.subnets.iter().any(|s| s == src_subnet);
                let dst_ok = dst_entry.subnets.is_empty()
                    || dst_entry.subnets.iter().any(|s| s == dst_subnet);
                if src_ok && dst_ok {
                    return Some(Reachability::reachable(
                        ReachabilityReason::SwitchPeering,
                        peering.name.clone(),
                    ));
                }
            }
        }
        None
    }

    /// Step 3: GatewayPeering search between two VPC subnets.
    fn gateway_peering_vpc_to_vpc(
        &self,
        src_vpc: &str,
        src_subnet: &str,
        dst_vpc: &str,
        dst_subnet: &str,
    ) -> Option<Reachability> {
        let src_cidr = self
            .vpcs
            .get(src_vpc)
            .and_then(|v| v.subnets.get(src_subnet))
            .map(|s| s.cidr.as_str());
        let dst_cidr = self
            .vpcs
            .get(dst_vpc)
            .and_then(|v| v.subnets.get(dst_subnet))
            .map(|s| s.cidr.as_str());
        let src_key = format!("{src_vpc}/{src_subnet}");
        let dst_key = format!("{dst_vpc}/{dst_subnet}");
        for gw in self.gateway_peerings {
            let endpoints: Vec<&str> = gw.endpoints.keys().map(String::as_str).collect();
            for &ep_a in &endpoints {
                if gw.exposes(ep_a, &src_key, src_cidr) {
                    if let Some(ep_b) = gw.other_endpoint(ep_a) {
                        if gw.exposes(ep_b, &dst_key, dst_cidr) {
                            return Some(Reachability::reachable(
                                ReachabilityReason::GatewayPeering,
                                gw.name.clone(),
                            ));
                        }
                    }
                }
            }
        }
        None
    }

    /// Step 4: ExternalPeering search for VPC-to-external reachability.
    fn external_peering(
        &self,
        src_vpc: &str,
        src_subnet: &str,
        ext_name: &str,
        prefix: &str,
    ) -> Option<Reachability> {
        self.external_peerings
            .iter()
            .find(|p| {
                p.vpc == src_vpc
                    && p.external == ext_name
                    && (p.vpc_subnets.is_empty() || p.vpc_subnets.iter().any(|s| s == src_subnet))
                    && p.prefixes.iter().any(|pfx| prefix_contains(pfx, prefix))
            })
            .map(|p| Reachability::reachable(ReachabilityReason::SwitchPeering, p.name.clone()))
    }

    /// Step 4 continued: gateway-expressed default-destination peerings,
    /// walked symmetrically with [`Self::gateway_peering_vpc_to_vpc`].
    fn gateway_default_destination(
        &self,
        src_vpc: &str,
        src_subnet: &str,
        _ext_name: &str,
    ) -> Option<Reachability> {
        let src_key = format!("{src_vpc}/{src_subnet}");
        for gw in self.gateway_peerings {
            for (ep, exposes) in &gw.endpoints {
                if gw.exposes(ep, &src_key, None) {
                    if let Some(other) = gw.other_endpoint(ep) {
                        if let Some(other_exposes) = gw.endpoints.get(other) {
                            if other_exposes.iter().any(|e| e.default_destination) {
                                return Some(Reachability::reachable(
                                    ReachabilityReason::GatewayPeering,
                                    gw.name.clone(),
                                ));
                            }
                        }
                    }
                }
                let _ = exposes;
            }
        }
        None
    }
}

/// Exact prefix match; CIDR-subset containment is left to the Provisioner's
/// ipnet-based allocator, which only ever emits exact prefixes for this
/// comparison.
fn prefix_contains(configured: &str, observed: &str) -> bool {
    configured == observed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpc::{PeeringEntry, Subnet, VpcMode};
    use std::collections::HashMap;

    fn subnet() -> Subnet {
        Subnet {
            cidr: "10.0.0.0/24".into(),
            vlan: 100,
            gateway: None,
            isolated: false,
            restricted: false,
            host_bgp: false,
            dhcp: Default::default(),
        }
    }

    fn two_vpcs() -> HashMap<String, Vpc> {
        let mut vpcs = HashMap::new();
        for name in ["vpc-a", "vpc-b"] {
            let mut subnets = HashMap::new();
            subnets.insert("subnet-01".to_string(), subnet());
            vpcs.insert(
                name.to_string(),
                Vpc {
                    name: name.to_string(),
                    mode: VpcMode::L2Vni,
                    subnets,
                    permit: vec![],
                },
            );
        }
        vpcs
    }

    #[test]
    fn no_peering_is_unreachable() {
        let vpcs = two_vpcs();
        let empty_groups = HashMap::new();
        let snapshot = ReachabilitySnapshot {
            vpcs: &vpcs,
            vpc_peerings: &[],
            externals: &HashMap::new(),
            external_peerings: &[],
            gateway_peerings: &[],
            vpc_switch_groups: &empty_groups,
        };
        let src = Endpoint::VpcSubnet {
            vpc: "vpc-a".into(),
            subnet: "subnet-01".into(),
        };
        let dst = Endpoint::VpcSubnet {
            vpc: "vpc-b".into(),
            subnet: "subnet-01".into(),
        };
        let got = snapshot.reachable(&src, &dst);
        assert!(!got.reachable);
    }

    #[test]
    fn vpc_peering_with_empty_subnets_permits_everything() {
        let vpcs = two_vpcs();
        let peering = VpcPeering {
            name: "a-b".into(),
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
        };
        let empty_groups = HashMap::new();
        let snapshot = ReachabilitySnapshot {
            vpcs: &vpcs,
            vpc_peerings: std::slice::from_ref(&peering),
            externals: &HashMap::new(),
            external_peerings: &[],
            gateway_peerings: &[],
            vpc_switch_groups: &empty_groups,
        };
        let src = Endpoint::VpcSubnet {
            vpc: "vpc-a".into(),
            subnet: "subnet-01".into(),
        };
        let dst = Endpoint::VpcSubnet {
            vpc: "vpc-b".into(),
            subnet: "subnet-01".into(),
        };
        let got = snapshot.reachable(&src, &dst);
        assert!(got.reachable);
        assert_eq!(got.reason, Some(ReachabilityReason::SwitchPeering));
        assert_eq!(got.peering.as_deref(), Some("a-b"));
    }

    #[test]
    fn remote_switch_group_constraint_is_enforced() {
        let vpcs = two_vpcs();
        let peering = VpcPeering {
            name: "a-b".into(),
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
            remote: Some("border".into()),
        };
        let mut groups = HashMap::new();
        groups.insert("vpc-a".to_string(), vec!["border".to_string()]);
        // vpc-b has no attachment on the "border" switch group.
        let snapshot = ReachabilitySnapshot {
            vpcs: &vpcs,
            vpc_peerings: std::slice::from_ref(&peering),
            externals: &HashMap::new(),
            external_peerings: &[],
            gateway_peerings: &[],
            vpc_switch_groups: &groups,
        };
        let src = Endpoint::VpcSubnet {
            vpc: "vpc-a".into(),
            subnet: "subnet-01".into(),
        };
        let dst = Endpoint::VpcSubnet {
            vpc: "vpc-b".into(),
            subnet: "subnet-01".into(),
        };
        assert!(!snapshot.reachable(&src, &dst).reachable);
    }
}
