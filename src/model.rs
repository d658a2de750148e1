use std::fmt;
use std::fmt::Formatter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration of one managed cluster. Long-lived, edited by
/// administrators; everything else about a cluster is read from its RAPI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub hostname: String,
    pub slug: String,
    pub port: u16,
    pub description: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Allow fast instance creations on this cluster from the admin
    /// interface.
    pub fast_create: bool,
    /// Set only if the cluster uses gnt-network.
    pub use_gnt_network: bool,
    /// Blocks setting a network at application review and blocks instance
    /// creation.
    pub disable_instance_creation: bool,
    pub disabled: bool,
    pub default_disk_template: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            hostname: String::new(),
            slug: String::new(),
            port: 5080,
            description: None,
            username: None,
            password: None,
            fast_create: false,
            use_gnt_network: true,
            disable_instance_creation: false,
            disabled: false,
            default_disk_template: "drbd".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum NetworkMode {
    Bridged,
    Routed,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Bridged => write!(f, "bridged"),
            NetworkMode::Routed => write!(f, "routed"),
        }
    }
}

/// A network configured for a cluster, addressed by its transport link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub description: String,
    pub cluster: String,
    pub link: String,
    pub mode: NetworkMode,
    pub cluster_default: bool,
    pub ipv6_prefix: Option<String>,
    pub groups: Vec<String>,
}

/// Marks the network with the given link as the cluster default,
/// un-defaulting whichever network of the same cluster held the flag
/// before. Networks of other clusters are untouched.
pub fn set_cluster_default(networks: &mut [Network], cluster: &str, link: &str) {
    for network in networks.iter_mut() {
        if network.cluster == cluster {
            network.cluster_default = network.link == link;
        }
    }
}

pub fn default_network<'a>(networks: &'a [Network], cluster: &str) -> Option<&'a Network> {
    networks
        .iter()
        .find(|n| n.cluster == cluster && n.cluster_default)
}

/// Desired or observed power state of an instance.
///
/// The RAPI reports these as the strings "up"/"down" (admin state) or as
/// booleans (oper state); anything else is preserved verbatim instead of
/// leaving a type-mixed field.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum PowerState {
    Up,
    Down,
    Other(String),
}

impl PowerState {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(true) => PowerState::Up,
            Value::Bool(false) => PowerState::Down,
            Value::String(s) if s == "up" => PowerState::Up,
            Value::String(s) if s == "down" => PowerState::Down,
            Value::String(s) => PowerState::Other(s.clone()),
            Value::Null => PowerState::Down,
            other => PowerState::Other(other.to_string()),
        }
    }

    pub fn is_up(&self) -> bool {
        *self == PowerState::Up
    }
}

/// Operational state reconciled against the administrative (desired) state.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub enum RunState {
    Running,
    Stopped,
    RunningShouldStop,
    StoppedShouldRun,
}

impl RunState {
    pub fn reconcile(oper_state: &PowerState, admin_state: &PowerState) -> Self {
        match (oper_state.is_up(), admin_state.is_up()) {
            (true, true) => RunState::Running,
            (false, false) => RunState::Stopped,
            (true, false) => RunState::RunningShouldStop,
            (false, true) => RunState::StoppedShouldRun,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "Running"),
            RunState::Stopped => write!(f, "Stopped"),
            RunState::RunningShouldStop => write!(f, "Running, should be stopped"),
            RunState::StoppedShouldRun => write!(f, "Stopped, should be running"),
        }
    }
}

/// A fully-populated instance projection.
///
/// Built fresh per request from the cluster query data plus reference data
/// and discarded after the response; never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Instance {
    pub cluster: String,
    pub name: String,
    pub tags: Vec<String>,
    pub pnode: Option<String>,
    pub snodes: Vec<String>,
    pub disk_sizes: Vec<u64>,
    pub nic_modes: Vec<String>,
    pub nic_ips: Vec<Option<String>>,
    pub nic_links: Vec<String>,
    pub nic_macs: Vec<String>,
    pub status: Option<String>,
    pub admin_state: Option<PowerState>,
    pub oper_state: Option<PowerState>,
    pub beparams: Value,
    pub hvparams: Value,
    pub osparams: Value,
    pub os: Option<String>,
    pub disk_template: Option<String>,
    pub network_port: Option<u64>,
    pub ctime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub organization: Option<String>,
    pub application: Option<String>,
    pub services: Vec<String>,
    pub adminlock: bool,
    pub isolate: bool,
    pub needsreboot: bool,
    pub admin_view_only: bool,
    pub whitelist_ip: Option<String>,
    /// IPv6 prefixes of the networks the NIC links resolved to.
    pub links: Vec<String>,
    pub ipv6s: Vec<String>,
    /// Set by a forced cache refresh while a mutating job is in flight.
    pub action_lock: bool,
}

impl Instance {
    /// Marks the projection read-only for an administrator inspecting an
    /// instance they do not own. One-way for the projection's lifetime.
    pub fn set_admin_view_only(&mut self) {
        self.admin_view_only = true;
    }

    pub fn run_state(&self) -> RunState {
        let down = PowerState::Down;
        RunState::reconcile(
            self.oper_state.as_ref().unwrap_or(&down),
            self.admin_state.as_ref().unwrap_or(&down),
        )
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
