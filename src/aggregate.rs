use std::net::Ipv6Addr;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{ClusterConfig, Instance, PowerState};
use crate::refdata::ReferenceData;
use crate::tags::InstanceFacets;

/// Builds a fully-populated [`Instance`] from one raw cluster record plus
/// reference data.
///
/// Missing or malformed optional fields never fail the build; the derived
/// field is simply omitted and the rest of the instance stays usable.
pub fn build_instance(
    cluster: &ClusterConfig,
    record: &Map<String, Value>,
    refdata: &ReferenceData,
    tag_prefix: &str,
) -> Instance {
    let tags = str_vec(record, "tags");
    let facets = InstanceFacets::from_tags(&tags, tag_prefix);

    let mut instance = Instance {
        cluster: cluster.slug.clone(),
        name: str_field(record, "name").unwrap_or_default(),
        pnode: str_field(record, "pnode"),
        snodes: str_vec(record, "snodes"),
        disk_sizes: u64_vec(record, "disk.sizes"),
        nic_modes: str_vec(record, "nic.modes"),
        nic_ips: opt_str_vec(record, "nic.ips"),
        nic_links: str_vec(record, "nic.links"),
        nic_macs: str_vec(record, "nic.macs"),
        status: str_field(record, "status"),
        admin_state: record.get("admin_state").map(PowerState::from_json),
        oper_state: record.get("oper_state").map(PowerState::from_json),
        beparams: record.get("beparams").cloned().unwrap_or(Value::Null),
        hvparams: record.get("hvparams").cloned().unwrap_or(Value::Null),
        osparams: record.get("osparams").cloned().unwrap_or(Value::Null),
        os: str_field(record, "os"),
        disk_template: str_field(record, "disk_template"),
        network_port: record.get("network_port").and_then(Value::as_u64),
        ctime: epoch_field(record, "ctime"),
        mtime: epoch_field(record, "mtime"),
        // Ownership associations resolve only against existing reference
        // entries; dangling tag suffixes are dropped.
        users: facets
            .users
            .into_iter()
            .filter(|u| refdata.users.contains_key(u))
            .collect(),
        groups: facets
            .groups
            .into_iter()
            .filter(|g| refdata.groups.contains_key(g))
            .collect(),
        organization: facets
            .organization
            .filter(|o| refdata.orgs.contains_key(o)),
        application: facets
            .application
            .filter(|a| refdata.applications.contains_key(a)),
        services: facets.services,
        adminlock: facets.adminlock,
        isolate: facets.isolate,
        needsreboot: facets.needsreboot,
        whitelist_ip: facets.whitelist_ip,
        action_lock: record
            .get("action_lock")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        tags,
        ..Default::default()
    };

    // Under bridging the reported IPv4 address is not meaningful.
    for (i, mode) in instance.nic_modes.iter().enumerate() {
        if mode == "bridged" {
            if let Some(ip) = instance.nic_ips.get_mut(i) {
                *ip = None;
            }
        }
    }

    for (i, link) in instance.nic_links.iter().enumerate() {
        let prefix = match refdata.networks.get(link) {
            Some(Some(prefix)) => prefix,
            // Unmapped link, or a network without an IPv6 prefix.
            _ => continue,
        };
        instance.links.push(prefix.clone());
        if let Some(mac) = instance.nic_macs.get(i) {
            if let Some(addr) = generate_ipv6(prefix, mac) {
                instance.ipv6s.push(addr);
            }
        }
    }

    instance
}

/// Derives a stateless IPv6 address from a prefix and a MAC via EUI-64:
/// bit 2 of the first octet inverted, ff:fe inserted at the midpoint, the
/// result embedded in the low 64 bits of the prefix. Malformed input
/// yields no address.
pub fn generate_ipv6(prefix: &str, mac: &str) -> Option<String> {
    let net: Ipv6Addr = prefix.split('/').next()?.parse().ok()?;
    let octets: Vec<u8> = mac
        .split(':')
        .map(|p| u8::from_str_radix(p, 16))
        .collect::<Result<_, _>>()
        .ok()?;
    if octets.len() != 6 {
        return None;
    }
    let eui64 = [
        octets[0] ^ 0x02,
        octets[1],
        octets[2],
        0xff,
        0xfe,
        octets[3],
        octets[4],
        octets[5],
    ];
    let seg = net.segments();
    let addr = Ipv6Addr::new(
        seg[0],
        seg[1],
        seg[2],
        seg[3],
        u16::from_be_bytes([eui64[0], eui64[1]]),
        u16::from_be_bytes([eui64[2], eui64[3]]),
        u16::from_be_bytes([eui64[4], eui64[5]]),
        u16::from_be_bytes([eui64[6], eui64[7]]),
    );
    Some(addr.to_string())
}

fn str_field(record: &Map<String, Value>, key: &str) -> Option<String> {
    record.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn str_vec(record: &Map<String, Value>, key: &str) -> Vec<String> {
    record
        .get(key)
        .and_then(Value::as_array)
        .map(|vs| {
            vs.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn opt_str_vec(record: &Map<String, Value>, key: &str) -> Vec<Option<String>> {
    record
        .get(key)
        .and_then(Value::as_array)
        .map(|vs| {
            vs.iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn u64_vec(record: &Map<String, Value>, key: &str) -> Vec<u64> {
    record
        .get(key)
        .and_then(Value::as_array)
        .map(|vs| vs.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

fn epoch_field(record: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let epoch = record.get(key)?.as_f64()?;
    Utc.timestamp_opt(epoch as i64, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refdata::{GroupRef, UserRef};
    use serde_json::json;

    #[test]
    fn eui64_fixed_vector() {
        assert_eq!(
            generate_ipv6("2001:db8::/64", "00:11:22:33:44:55").as_deref(),
            Some("2001:db8::211:22ff:fe33:4455")
        );
    }

    #[test]
    fn eui64_is_deterministic() {
        let a = generate_ipv6("2001:db8::/64", "00:11:22:33:44:55");
        let b = generate_ipv6("2001:db8::/64", "00:11:22:33:44:55");
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_mac_or_prefix_yields_no_address() {
        assert_eq!(generate_ipv6("2001:db8::/64", "zz"), None);
        assert_eq!(generate_ipv6("2001:db8::/64", "00:11:22:33:44"), None);
        assert_eq!(generate_ipv6("not-a-prefix", "00:11:22:33:44:55"), None);
    }

    fn refdata() -> ReferenceData {
        let mut refdata = ReferenceData::default();
        refdata.users.insert(
            "alice".to_owned(),
            UserRef {
                username: "alice".to_owned(),
                ..Default::default()
            },
        );
        refdata.groups.insert(
            "ops".to_owned(),
            GroupRef {
                name: "ops".to_owned(),
                members: vec!["alice".to_owned()],
            },
        );
        refdata
            .networks
            .insert("br0".to_owned(), Some("2001:db8::/64".to_owned()));
        refdata.networks.insert("br9".to_owned(), None);
        refdata
    }

    fn record() -> Map<String, Value> {
        json!({
            "name": "vm1.example.org",
            "tags": ["gnt:user:alice", "gnt:user:ghost", "gnt:group:ops", "gnt:service:dns"],
            "pnode": "node1",
            "snodes": ["node2"],
            "disk.sizes": [10240],
            "nic.modes": ["bridged", "routed", "routed"],
            "nic.ips": ["192.0.2.1", "192.0.2.2", "192.0.2.3"],
            "nic.links": ["br0", "unknown", "br9"],
            "nic.macs": ["00:11:22:33:44:55", "00:11:22:33:44:56", "00:11:22:33:44:57"],
            "status": "running",
            "admin_state": "up",
            "oper_state": true,
            "ctime": 1388530800.5,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn build_resolves_ownership_and_networks() {
        let cluster = ClusterConfig {
            slug: "c1".to_owned(),
            ..Default::default()
        };
        let instance = build_instance(&cluster, &record(), &refdata(), "gnt");

        assert_eq!(instance.name, "vm1.example.org");
        // Dangling user tag dropped, matched ones kept.
        assert_eq!(instance.users, vec!["alice"]);
        assert_eq!(instance.groups, vec!["ops"]);
        assert_eq!(instance.services, vec!["dns"]);
        // Bridged NIC loses its IPv4 address.
        assert_eq!(instance.nic_ips[0], None);
        assert_eq!(instance.nic_ips[1].as_deref(), Some("192.0.2.2"));
        // Only the mapped link with a prefix produces an IPv6 address.
        assert_eq!(instance.links, vec!["2001:db8::/64"]);
        assert_eq!(instance.ipv6s, vec!["2001:db8::211:22ff:fe33:4455"]);
        assert_eq!(instance.admin_state, Some(PowerState::Up));
        assert_eq!(instance.oper_state, Some(PowerState::Up));
        assert_eq!(instance.ctime.unwrap().timestamp(), 1388530800);
        assert_eq!(instance.mtime, None);
    }

    #[test]
    fn build_never_fails_on_empty_record() {
        let cluster = ClusterConfig::default();
        let instance = build_instance(&cluster, &Map::new(), &ReferenceData::default(), "gnt");
        assert_eq!(instance.name, "");
        assert!(instance.ipv6s.is_empty());
    }
}
