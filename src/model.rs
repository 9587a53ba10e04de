//! Static fabric records (Section 3): switches, switch profiles, connections
//! and servers. These are fixed for the lifetime of a lab boot — the core
//! lists and reads them but never creates, updates or deletes them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A leaf/spine fabric node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Switch {
    pub name: String,
    pub role: SwitchRole,
    pub profile: String,
    pub roce_enabled: bool,
    pub redundancy_type: RedundancyType,
    pub description: String,
    pub virtual_switch: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchRole {
    Spine,
    ServerLeaf,
    MixedLeaf,
    BorderLeaf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyType {
    Mclag,
    Eslag,
    None,
}

/// Capabilities of a switch model. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwitchProfile {
    pub name: String,
    pub supports_subinterfaces: bool,
    pub supports_roce: bool,
    pub ports_to_nos_name: HashMap<String, String>,
}

/// A link, or link-bundle, between two endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub name: String,
    pub kind: ConnectionKind,
    pub ports: Vec<PortPair>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    Unbundled,
    Bundled,
    Mclag,
    Eslag,
    Fabric,
    Mesh,
    StaticExternal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortPair {
    pub switch: String,
    pub switch_port: String,
    pub peer: String,
    pub peer_port: String,
}

impl Connection {
    /// `true` for MCLAG/ESLAG bundles that span two switches, the
    /// combination the Provisioner (4.G) refuses to set up in non-L2VNI
    /// VPC modes.
    pub fn is_eslag(&self) -> bool {
        self.kind == ConnectionKind::Eslag
    }

    /// Every switch participating in this connection's port pairs.
    pub fn switches(&self) -> impl Iterator<Item = &str> {
        self.ports.iter().map(|p| p.switch.as_str())
    }
}

/// A compute endpoint named `server-<id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub name: String,
    pub id: u32,
    pub connection: String,
}

impl Server {
    /// Extracts the numeric id from a `server-<id>` name, falling back to
    /// the stored `id` field when the name does not parse — canonical
    /// ordering is always by numeric id (Section 3).
    pub fn sort_key(&self) -> u32 {
        self.name
            .strip_prefix("server-")
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.id)
    }
}

pub fn sort_servers_by_id(servers: &mut [Server]) {
    servers.sort_by_key(|s| s.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_sort_by_numeric_id_not_lexical() {
        let mut servers = vec![
            Server {
                name: "server-2".into(),
                id: 2,
                connection: "c2".into(),
            },
            Server {
                name: "server-10".into(),
                id: 10,
                connection: "c10".into(),
            },
            Server {
                name: "server-1".into(),
                id: 1,
                connection: "c1".into(),
            },
        ];
        sort_servers_by_id(&mut servers);
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["server-1", "server-2", "server-10"]);
    }
}
