use std::collections::HashMap;

/// Resolves prefixed tags against a lookup table.
///
/// Every tag starting with `prefix` has the prefix stripped and the suffix
/// looked up in `table`; suffixes without a match are silently dropped (a
/// tag may reference an organization or user deleted long ago). Output
/// order follows tag iteration order and carries no guarantee beyond
/// display.
pub fn resolve_tag_prefix<'a, V>(
    tags: &[String],
    prefix: &str,
    table: &'a HashMap<String, V>,
) -> Vec<&'a V> {
    tags.iter()
        .filter_map(|tag| tag.strip_prefix(prefix))
        .filter_map(|suffix| table.get(suffix))
        .collect()
}

/// Typed view over an instance's raw tag list.
///
/// The tag convention encodes ownership, flags and parameters as
/// `<prefix>:<kind>[:<value>]` strings; this extracts them once into a
/// strongly-typed facade. The raw tags stay on the instance for
/// round-tripping when tags must be rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFacets {
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub organization: Option<String>,
    pub application: Option<String>,
    pub services: Vec<String>,
    pub adminlock: bool,
    pub isolate: bool,
    pub needsreboot: bool,
    pub whitelist_ip: Option<String>,
}

impl InstanceFacets {
    pub fn from_tags(tags: &[String], prefix: &str) -> Self {
        let group_pfx = format!("{}:group:", prefix);
        let user_pfx = format!("{}:user:", prefix);
        let org_pfx = format!("{}:org:", prefix);
        let app_pfx = format!("{}:application:", prefix);
        let serv_pfx = format!("{}:service:", prefix);
        let whitelist_pfx = format!("{}:whitelist_ip:", prefix);
        let adminlock_tag = format!("{}:adminlock", prefix);
        let isolate_tag = format!("{}:isolate", prefix);
        let needsreboot_tag = format!("{}:needsreboot", prefix);

        let mut facets = InstanceFacets::default();
        for tag in tags {
            if let Some(group) = tag.strip_prefix(&group_pfx) {
                facets.groups.push(group.to_owned());
            } else if let Some(user) = tag.strip_prefix(&user_pfx) {
                facets.users.push(user.to_owned());
            } else if let Some(org) = tag.strip_prefix(&org_pfx) {
                facets.organization.get_or_insert_with(|| org.to_owned());
            } else if let Some(app) = tag.strip_prefix(&app_pfx) {
                facets.application.get_or_insert_with(|| app.to_owned());
            } else if let Some(service) = tag.strip_prefix(&serv_pfx) {
                facets.services.push(service.to_owned());
            } else if let Some(ip) = tag.strip_prefix(&whitelist_pfx) {
                facets.whitelist_ip = Some(ip.to_owned());
            } else if tag == &adminlock_tag {
                facets.adminlock = true;
            } else if tag == &isolate_tag {
                facets.isolate = true;
            } else if tag == &needsreboot_tag {
                facets.needsreboot = true;
            }
        }
        facets
    }
}
