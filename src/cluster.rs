use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::aggregate::build_instance;
use crate::cache::Cache;
use crate::env::{GANETI_TAG_PREFIX, GANETI_VERSION_OSPARAMS};
use crate::error::{RapiError, Result};
use crate::model::{ClusterConfig, Instance, Network, NetworkMode};
use crate::osimage::OsCatalog;
use crate::query::parse_query;
use crate::queue::{Delivery, JobLockMessage, WorkQueue};
use crate::rapi::RapiClient;
use crate::refdata::ReferenceData;

const INSTANCE_LIST_FIELDS: &[&str] = &[
    "name",
    "tags",
    "pnode",
    "snodes",
    "disk.sizes",
    "nic.modes",
    "nic.ips",
    "nic.links",
    "status",
    "admin_state",
    "beparams",
    "oper_state",
    "hvparams",
    "nic.macs",
    "ctime",
    "mtime",
];

const INSTANCE_DETAIL_FIELDS: &[&str] = &[
    "name",
    "tags",
    "pnode",
    "snodes",
    "disk.sizes",
    "nic.modes",
    "nic.ips",
    "nic.links",
    "status",
    "admin_state",
    "beparams",
    "oper_state",
    "hvparams",
    "nic.macs",
    "ctime",
    "mtime",
    "osparams",
    "os",
    "network_port",
    "disk_template",
];

const NODE_FIELDS: &[&str] = &[
    "name",
    "role",
    "mfree",
    "mtotal",
    "dtotal",
    "dfree",
    "ctotal",
    "group",
    "pinst_cnt",
    "offline",
    "vm_capable",
    "pinst_list",
];

const BULK_TTL: Duration = Duration::from_secs(180);
const FORCED_TTL: Duration = Duration::from_secs(45);
const DETAIL_TTL: Duration = Duration::from_secs(60);
const LOCK_TTL: Duration = Duration::from_secs(30);
const LOCKED_DIR_TTL: Duration = Duration::from_secs(90);

/// Width of the all-clusters fan-out pool.
const FANOUT_WIDTH: usize = 20;

// Extstorage providers are advertised as <prefix>:ext:<provider> cluster
// tags; parameter tags append :params:<key>:<value> and must not match.
static EXT_PROVIDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^{}:ext:([\w.+*/@-]+)$",
        regex::escape(GANETI_TAG_PREFIX.as_str())
    ))
    .unwrap()
});

/// One managed cluster: its configuration plus the injected collaborators.
///
/// Owns every per-cluster cached collection, the advisory lock protocol and
/// the mutating-operation surface.
pub struct Cluster {
    pub config: ClusterConfig,
    rapi: Arc<dyn RapiClient>,
    cache: Arc<dyn Cache>,
    queue: Arc<dyn WorkQueue>,
}

/// Parameters for instance creation. Unset backend parameters are omitted
/// from the call so the remote API applies its own defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateInstanceParams {
    pub name: String,
    pub os: String,
    pub disk_template: Option<String>,
    pub disks: Value,
    pub nics: Value,
    pub memory: Option<u64>,
    pub vcpus: Option<u64>,
    pub tags: Vec<String>,
    pub osparams: Value,
    pub nodes: Vec<String>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        rapi: Arc<dyn RapiClient>,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Cluster {
            config,
            rapi,
            cache,
            queue,
        }
    }

    // Cache keys are deterministic strings composed from the cluster
    // identity and, where applicable, the sub-resource name.

    pub fn instances_key(&self) -> String {
        format!("cluster:{}:instances", self.config.hostname)
    }

    pub fn instance_key(&self, instance: &str) -> String {
        format!("cluster:{}:instance:{}", self.config.hostname, instance)
    }

    pub fn instance_lock_key(&self, instance: &str) -> String {
        format!("cluster:{}:instance:{}:lock", self.config.hostname, instance)
    }

    fn cluster_key(&self, resource: &str) -> String {
        format!("cluster:{}:{}", self.config.hostname, resource)
    }

    /// Drops a cache entry so the next read bypasses the cache. Mutating
    /// operations call this before issuing the remote call.
    pub async fn invalidate(&self, key: &str) {
        self.cache.delete(key).await;
    }

    // ---- instance collections ----

    pub async fn refresh_instances(&self) -> Result<Vec<Map<String, Value>>> {
        let response = self
            .rapi
            .query("instance", INSTANCE_LIST_FIELDS, None)
            .await?;
        let records = parse_query(&response);
        self.cache
            .set(
                &self.instances_key(),
                Value::Array(records.iter().cloned().map(Value::Object).collect()),
                BULK_TTL,
            )
            .await;
        Ok(records)
    }

    /// Raw instance records, from cache or a synchronous refresh.
    pub async fn raw_instances(&self) -> Result<Vec<Map<String, Value>>> {
        if let Some(cached) = self.cache.get(&self.instances_key()).await {
            if let Value::Array(rows) = cached {
                return Ok(rows
                    .into_iter()
                    .filter_map(|r| r.as_object().cloned())
                    .collect());
            }
        }
        self.refresh_instances().await
    }

    pub async fn get_instances(&self, refdata: &ReferenceData) -> Result<Vec<Instance>> {
        let records = self.raw_instances().await?;
        Ok(records
            .iter()
            .map(|r| build_instance(&self.config, r, refdata, GANETI_TAG_PREFIX.as_str()))
            .collect())
    }

    /// Refreshes the bulk instance list immediately, tagging the named
    /// instance as locked by an in-flight action. Used after issuing a
    /// mutating call so listings reflect the pending state without waiting
    /// for the normal TTL.
    pub async fn force_cache_refresh(&self, instance: &str) -> Result<()> {
        let mut instances = self.rapi.get_instances(true).await?;
        if let Some(rows) = instances.as_array_mut() {
            for row in rows {
                if row.get("name").and_then(Value::as_str) == Some(instance) {
                    row["action_lock"] = json!(true);
                }
            }
        }
        self.cache
            .set(&self.instances_key(), instances, FORCED_TTL)
            .await;
        Ok(())
    }

    /// Per-instance detail record, cached for 60 seconds.
    pub async fn get_instance_info(&self, instance: &str) -> Result<Map<String, Value>> {
        let cache_key = self.instance_key(instance);
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Some(record) = cached.as_object() {
                return Ok(record.clone());
            }
        }
        let response = self
            .rapi
            .query(
                "instance",
                INSTANCE_DETAIL_FIELDS,
                Some(json!(["|", ["=", "name", instance]])),
            )
            .await?;
        let record = parse_query(&response)
            .into_iter()
            .next()
            .ok_or(RapiError::NotFound)?;
        self.cache
            .set(&cache_key, Value::Object(record.clone()), DETAIL_TTL)
            .await;
        Ok(record)
    }

    pub async fn get_instance(
        &self,
        instance: &str,
        refdata: &ReferenceData,
    ) -> Result<Instance> {
        let record = self.get_instance_info(instance).await?;
        Ok(build_instance(
            &self.config,
            &record,
            refdata,
            GANETI_TAG_PREFIX.as_str(),
        ))
    }

    // ---- cluster-level collections ----

    pub async fn get_cluster_info(&self) -> Result<Value> {
        let key = self.cluster_key("info");
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let mut info = self.rapi.get_info().await?;
        for ts_key in ["ctime", "mtime"] {
            if let Some(epoch) = info.get(ts_key).and_then(Value::as_f64) {
                if let Some(ts) = Utc.timestamp_opt(epoch as i64, 0).single() {
                    info[ts_key] = json!(ts.to_rfc3339());
                }
            }
        }
        self.cache.set(&key, info.clone(), BULK_TTL).await;
        Ok(info)
    }

    pub async fn get_version(&self) -> String {
        match self.get_cluster_info().await {
            Ok(info) => info
                .get("software_version")
                .and_then(Value::as_str)
                .unwrap_or("0")
                .to_owned(),
            Err(_) => "0".to_owned(),
        }
    }

    /// Capability flag: from 2.16.0 the RAPI replaces OS parameters
    /// atomically on reinstall.
    pub async fn supports_atomic_osparams(&self) -> bool {
        version_at_least(&self.get_version().await, GANETI_VERSION_OSPARAMS)
    }

    pub async fn refresh_nodes(&self) -> Result<Vec<Map<String, Value>>> {
        let response = self.rapi.query("node", NODE_FIELDS, None).await?;
        let mut nodes = parse_query(&response);
        for node in &mut nodes {
            annotate_node(node, &self.config);
        }
        self.cache
            .set(
                &self.cluster_key("nodes"),
                Value::Array(nodes.iter().cloned().map(Value::Object).collect()),
                BULK_TTL,
            )
            .await;
        Ok(nodes)
    }

    pub async fn get_nodes(&self) -> Result<Vec<Map<String, Value>>> {
        if let Some(Value::Array(rows)) = self.cache.get(&self.cluster_key("nodes")).await {
            return Ok(rows
                .into_iter()
                .filter_map(|r| r.as_object().cloned())
                .collect());
        }
        self.refresh_nodes().await
    }

    /// Plain node listing straight off the RAPI, cached separately from the
    /// annotated one.
    pub async fn list_cluster_nodes(&self) -> Result<Value> {
        let key = self.cluster_key("listnodes");
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let nodes = self.rapi.get_nodes(false).await?;
        self.cache.set(&key, nodes.clone(), BULK_TTL).await;
        Ok(nodes)
    }

    pub async fn get_node_info(&self, node: &str) -> Result<Option<Map<String, Value>>> {
        let key = self.cluster_key(&format!("node:{}", node));
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached.as_object().cloned());
        }
        for info in self.get_nodes().await? {
            if info.get("name").and_then(Value::as_str) == Some(node) {
                self.cache
                    .set(&key, Value::Object(info.clone()), BULK_TTL)
                    .await;
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// Names of up to `count` allocatable nodes in the given node group.
    pub async fn get_available_nodes(
        &self,
        node_group: &str,
        count: usize,
    ) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for node in self.get_nodes().await? {
            let role = node.get("role").and_then(Value::as_str).unwrap_or("");
            if role == "D" || role == "O" {
                continue;
            }
            if node.get("group").and_then(Value::as_str) != Some(node_group) {
                continue;
            }
            if node.get("vm_capable").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            if let Some(name) = node.get("name").and_then(Value::as_str) {
                names.push(name.to_owned());
            }
        }
        names.truncate(count);
        Ok(names)
    }

    pub async fn get_node_groups(&self) -> Result<Value> {
        let key = self.cluster_key("nodegroups");
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let groups = self.rapi.get_groups(true).await?;
        self.cache.set(&key, groups.clone(), BULK_TTL).await;
        Ok(groups)
    }

    pub async fn get_node_group_info(&self, nodegroup: &str) -> Result<Value> {
        let key = self.cluster_key(&format!("nodegroup:{}", nodegroup));
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let mut info = self.rapi.get_group(nodegroup).await?;
        info["cluster"] = json!(self.config.hostname);
        self.cache.set(&key, info.clone(), BULK_TTL).await;
        Ok(info)
    }

    pub async fn get_networks(&self) -> Result<Value> {
        let key = self.cluster_key("networks");
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let networks = self.rapi.get_networks(true).await?;
        self.cache.set(&key, networks.clone(), BULK_TTL).await;
        Ok(networks)
    }

    /// Networks reachable from a node group: the RAPI-managed ones
    /// restricted to the group, plus the bridged networks configured for
    /// this cluster. Sorted by network name.
    pub async fn get_node_group_networks(
        &self,
        nodegroup: &str,
        configured: &[Network],
    ) -> Result<Vec<Value>> {
        let mut group_nets = Vec::new();
        let networks = self.get_networks().await?;
        for net in networks.as_array().into_iter().flatten() {
            for group in net
                .get("group_list")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if group.get(0).and_then(Value::as_str) != Some(nodegroup) {
                    continue;
                }
                let link = group.get(2).and_then(Value::as_str).unwrap_or("");
                let mode = group.get(1).and_then(Value::as_str).unwrap_or("");
                let default = configured
                    .iter()
                    .any(|n| n.cluster == self.config.slug && n.cluster_default && n.link == link);
                let mut entry = json!({
                    "network": net.get("name").cloned().unwrap_or(Value::Null),
                    "link": link,
                    "type": mode,
                    "defaultnet": default,
                    "free_count": Value::Null,
                    "reserved_count": Value::Null,
                });
                if mode == "routed" {
                    entry["free_count"] = net.get("free_count").cloned().unwrap_or(Value::Null);
                    entry["reserved_count"] =
                        net.get("reserved_count").cloned().unwrap_or(Value::Null);
                }
                group_nets.push(entry);
            }
        }
        for net in configured
            .iter()
            .filter(|n| n.cluster == self.config.slug && n.mode == NetworkMode::Bridged)
        {
            group_nets.push(json!({
                "network": net.description,
                "link": net.link,
                "type": net.mode.to_string(),
                "defaultnet": net.cluster_default,
                "free_count": Value::Null,
                "reserved_count": Value::Null,
            }));
        }
        group_nets.sort_by(|a, b| {
            let a = a.get("network").and_then(Value::as_str).unwrap_or("");
            let b = b.get("network").and_then(Value::as_str).unwrap_or("");
            a.cmp(b)
        });
        Ok(group_nets)
    }

    /// Per-group view used by the placement forms: allocation policy,
    /// reachable networks, member nodes and the volume groups advertised
    /// through `vg:` tags.
    pub async fn get_node_group_stack(&self, configured: &[Network]) -> Result<Vec<Value>> {
        let groups = self.get_node_groups().await?;
        let mut stack = Vec::new();
        for group in groups.as_array().into_iter().flatten() {
            let name = group.get("name").and_then(Value::as_str).unwrap_or("");
            let vgs: Vec<String> = group
                .get("tags")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .filter_map(|t| t.strip_prefix("vg:"))
                .map(str::to_owned)
                .collect();
            stack.push(json!({
                "name": name,
                "alloc_policy": group.get("alloc_policy").cloned().unwrap_or(Value::Null),
                "networks": self.get_node_group_networks(name, configured).await?,
                "nodes": group.get("node_list").cloned().unwrap_or(Value::Null),
                "vgs": vgs,
            }));
        }
        Ok(stack)
    }

    /// All nodes belonging to node groups tagged `locked`.
    pub async fn locked_nodes_from_nodegroup(&self) -> Result<Vec<String>> {
        let key = self.cluster_key("lockednodegroups:nodes");
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(nodes) = serde_json::from_value(cached) {
                return Ok(nodes);
            }
        }
        let mut locked = Vec::new();
        let groups = self.get_node_groups().await?;
        for group in groups.as_array().into_iter().flatten() {
            let tagged = group
                .get("tags")
                .and_then(Value::as_array)
                .map(|ts| ts.iter().any(|t| t.as_str() == Some("locked")))
                .unwrap_or(false);
            if tagged {
                locked.extend(
                    group
                        .get("node_list")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                        .map(str::to_owned),
                );
            }
        }
        self.cache.set(&key, json!(locked), BULK_TTL).await;
        Ok(locked)
    }

    pub async fn get_job_list(&self) -> Result<Vec<Value>> {
        let jobs = self.rapi.get_jobs(true).await?;
        let mut jobs: Vec<Value> = jobs.as_array().cloned().unwrap_or_default();
        for job in &mut jobs {
            job["cluster"] = json!(self.config.slug);
            let start_time = job
                .get("start_ts")
                .and_then(Value::as_array)
                .and_then(|ts| ts.first())
                .and_then(Value::as_i64)
                .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            job["start_time"] = json!(start_time);
            if let Some(op_id) = job
                .pointer("/ops/0/OP_ID")
                .and_then(Value::as_str)
                .map(prettify_op_id)
            {
                job["ops"][0]["OP_ID"] = json!(op_id);
            }
        }
        Ok(jobs)
    }

    /// Job status is a pass-through; the core never interprets it.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Value> {
        self.rapi.get_job_status(job_id).await
    }

    /// Extstorage providers advertised through cluster tags of the form
    /// `<prefix>:ext:<provider>`. Parameter tags do not match the provider
    /// pattern and are ignored here. Bypasses the cache.
    pub async fn get_extstorage_providers(&self) -> Result<Vec<String>> {
        let tags = self.rapi.get_cluster_tags().await?;
        Ok(tags
            .iter()
            .filter_map(|t| EXT_PROVIDER_RE.captures(t))
            .map(|c| format!("{}[ext]", &c[1]))
            .collect())
    }

    /// Disk parameters for one extstorage provider, from tags of the form
    /// `<prefix>:ext:<provider>:params:<key>:<value>`. Bypasses the cache.
    pub async fn get_extstorage_disk_params(
        &self,
        provider: &str,
    ) -> Result<HashMap<String, String>> {
        let provider_tag = format!("{}:ext:{}", GANETI_TAG_PREFIX.as_str(), provider);
        let pattern = format!(
            r"^{}:params:([\w+*/@-]+):([\w+*/@-]+)$",
            regex::escape(&provider_tag)
        );
        let param_re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(_) => return Ok(HashMap::new()),
        };
        let tags = self.rapi.get_cluster_tags().await?;
        Ok(tags
            .iter()
            .filter_map(|t| param_re.captures(t))
            .map(|c| (c[1].to_owned(), c[2].to_owned()))
            .collect())
    }

    // ---- lock coordination ----

    /// Places the advisory lock for an in-flight action: the per-instance
    /// lock entry plus the cluster-wide locked-instances directory. When a
    /// job id is given the JOB_LOCK message is published so the worker
    /// flushes `flush_keys` (plus the detail key) after the job finishes.
    ///
    /// Fail-open: an abandoned publish is logged and the lock stays
    /// applied; stale cache until TTL expiry is the accepted cost.
    pub async fn lock_instance(
        &self,
        instance: &str,
        reason: &str,
        ttl: Duration,
        job_id: Option<&str>,
        flush_keys: &[String],
    ) -> Delivery {
        let lock_key = self.instance_lock_key(instance);
        self.cache.set(&lock_key, json!(reason), ttl).await;

        let mut locked: Map<String, Value> = self
            .cache
            .get("locked_instances")
            .await
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        locked.insert(instance.to_owned(), json!(reason));
        self.cache
            .set("locked_instances", Value::Object(locked), LOCKED_DIR_TTL)
            .await;

        let job_id = match job_id {
            Some(id) => id,
            None => return Delivery::Delivered,
        };
        let mut flush = flush_keys.to_vec();
        flush.push(self.instance_key(instance));
        let message =
            JobLockMessage::new(&self.config.slug, instance, job_id, &lock_key, flush);
        let delivery = self.queue.publish(&message).await;
        if let Delivery::Abandoned(reason) = &delivery {
            warn!(
                cluster = self.config.slug.as_str(),
                instance,
                job_id,
                reason = reason.as_str(),
                "job lock notification abandoned"
            );
        }
        delivery
    }

    /// Presence of the lock entry is the authoritative signal; the reason
    /// string is display-only.
    pub async fn is_locked(&self, instance: &str) -> bool {
        self.cache
            .get(&self.instance_lock_key(instance))
            .await
            .is_some()
    }

    pub async fn locked_instances(&self) -> Map<String, Value> {
        self.cache
            .get("locked_instances")
            .await
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    // ---- mutating operations ----
    //
    // Uniform protocol: invalidate the detail cache entry, issue the remote
    // call, lock with the job id, hand the job id back. Never waits for the
    // remote job.

    pub async fn shutdown_instance(&self, instance: &str) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.shutdown_instance(instance).await?;
        self.lock_instance(instance, "shutting down", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }

    pub async fn startup_instance(&self, instance: &str) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.startup_instance(instance).await?;
        self.lock_instance(instance, "starting up", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }

    pub async fn reboot_instance(
        &self,
        instance: &str,
        refdata: &ReferenceData,
    ) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.reboot_instance(instance).await?;
        self.lock_instance(instance, "rebooting", LOCK_TTL, Some(&job_id), &[])
            .await;
        let rebooted = self.get_instance(instance, refdata).await?;
        if rebooted.needsreboot {
            self.untag_instance(
                instance,
                &[format!("{}:needsreboot", GANETI_TAG_PREFIX.as_str())],
            )
            .await?;
        }
        Ok(job_id)
    }

    pub async fn migrate_instance(&self, instance: &str) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.migrate_instance(instance).await?;
        self.lock_instance(instance, "migrating", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }

    pub async fn rename_instance(&self, instance: &str, new_name: &str) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self
            .rapi
            .rename_instance(instance, new_name, false, false)
            .await?;
        self.lock_instance(instance, "renaming", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }

    pub async fn destroy_instance(&self, instance: &str) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.delete_instance(instance).await?;
        self.lock_instance(instance, "deleting", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }

    pub async fn set_instance_params(&self, instance: &str, params: Value) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.modify_instance(instance, params).await?;
        self.lock_instance(instance, "modifying", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }

    /// Tagging alters cluster-wide listing data, so the whole instance list
    /// is flushed with the job. A remote failure is handed back as the
    /// error value without locking; callers match on it.
    pub async fn tag_instance(&self, instance: &str, tags: &[String]) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.add_instance_tags(instance, tags).await?;
        self.lock_instance(
            instance,
            "tagging",
            LOCK_TTL,
            Some(&job_id),
            &[self.instances_key()],
        )
        .await;
        Ok(job_id)
    }

    pub async fn untag_instance(&self, instance: &str, tags: &[String]) -> Result<String> {
        self.invalidate(&self.instance_key(instance)).await;
        let job_id = self.rapi.delete_instance_tags(instance, tags).await?;
        self.lock_instance(
            instance,
            "untagging",
            LOCK_TTL,
            Some(&job_id),
            &[self.instances_key()],
        )
        .await;
        Ok(job_id)
    }

    /// Reinstalls an instance with the OS descriptor from the catalog.
    ///
    /// Returns `Ok(None)` when the catalog has no descriptor for the OS —
    /// nothing to do, distinct from a remote failure.
    pub async fn reinstall_instance(
        &self,
        instance: &str,
        operating_system: &str,
        catalog: &dyn OsCatalog,
        refdata: &ReferenceData,
        fqdn: &str,
    ) -> Result<Option<String>> {
        let details = match catalog.lookup(operating_system) {
            Some(d) => d,
            None => return Ok(None),
        };
        self.invalidate(&self.instance_key(instance)).await;

        let application = match self.get_instance(instance, refdata).await {
            Ok(inst) => inst
                .application
                .and_then(|id| refdata.applications.get(&id).cloned()),
            Err(RapiError::NotFound) => return Err(RapiError::NotFound),
            Err(_) => None,
        };

        let mut osparams = Map::new();
        if let Some(param) = &details.ssh_key_param {
            if !param.is_empty() {
                if let Some(app) = &application {
                    osparams.insert(param.clone(), json!(app.ssh_keys_url(fqdn)));
                }
            }
        }
        if !details.ssh_key_users.is_empty() {
            let ssh_keys: Vec<String> = application
                .as_ref()
                .and_then(|app| refdata.users.get(&app.applicant))
                .map(|u| u.ssh_keys.clone())
                .unwrap_or_default();
            if !ssh_keys.is_empty() {
                let mut lines = ssh_keys.join("\n");
                lines.push('\n');
                let encoded = base64::encode(lines.as_bytes());
                let mut personality = Vec::new();
                for user_spec in &details.ssh_key_users {
                    let (owner, group, path) = map_ssh_user(user_spec);
                    personality.push(json!({
                        "path": path,
                        "contents": encoded,
                        "owner": owner,
                        "group": group,
                        "mode": 0o600,
                    }));
                }
                osparams.insert("img_personality".to_owned(), json!(personality));
            }
        }
        for (key, value) in &details.osparams {
            osparams.insert(key.clone(), value.clone());
        }
        // The RAPI only accepts flat string values for OS parameters;
        // anything structured is submitted JSON-encoded.
        for value in osparams.values_mut() {
            if !value.is_string() {
                *value = json!(serde_json::to_string(value).unwrap_or_default());
            }
        }

        let mut body = json!({
            "os": details.provider,
            "osparams": Value::Object(osparams.clone()),
        });
        let job_id = if self.supports_atomic_osparams().await {
            body["clear_osparams"] = json!(true);
            self.rapi.reinstall_instance(instance, body).await?
        } else {
            // Older clusters cannot replace parameters atomically; set them
            // with an explicit modify before reinstalling.
            self.rapi
                .modify_instance(instance, json!({ "osparams": Value::Object(osparams) }))
                .await?;
            self.rapi.reinstall_instance(instance, body).await?
        };
        self.lock_instance(instance, "reinstalling", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(Some(job_id))
    }

    pub async fn create_instance(&self, params: CreateInstanceParams) -> Result<String> {
        let mut beparams = Map::new();
        if let Some(memory) = params.memory {
            beparams.insert("memory".to_owned(), json!(memory));
        }
        if let Some(vcpus) = params.vcpus {
            beparams.insert("vcpus".to_owned(), json!(vcpus));
        }
        let disk_template = params
            .disk_template
            .unwrap_or_else(|| self.config.default_disk_template.clone());

        let mut body = json!({
            "mode": "create",
            "name": params.name,
            "os": params.os,
            "disk_template": disk_template,
            "disks": params.disks,
            "nics": params.nics,
            "start": false,
            "ip_check": false,
            "name_check": false,
            "beparams": Value::Object(beparams),
            "tags": params.tags,
            "osparams": params.osparams,
            "wait_for_sync": false,
        });
        // First node is the primary, an optional second the secondary; more
        // than two is unsupported.
        if let Some(pnode) = params.nodes.first() {
            body["pnode"] = json!(pnode);
        }
        if params.nodes.len() == 2 {
            body["snode"] = json!(params.nodes[1]);
        }
        let job_id = self.rapi.create_instance(body).await?;
        self.lock_instance(&params.name, "creating", LOCK_TTL, Some(&job_id), &[])
            .await;
        Ok(job_id)
    }
}

fn annotate_node(node: &mut Map<String, Value>, config: &ClusterConfig) {
    node.insert("cluster".to_owned(), json!(config.hostname));
    node.insert("cluster_slug".to_owned(), json!(config.slug));
    for key in ["mfree", "mtotal", "dtotal", "dfree"] {
        if node.get(key).map(Value::is_null).unwrap_or(true) {
            node.insert(key.to_owned(), json!(0));
        }
    }
    let mem_used = used_percent(
        node.get("mtotal").and_then(Value::as_u64).unwrap_or(0),
        node.get("mfree").and_then(Value::as_u64).unwrap_or(0),
    );
    let disk_used = used_percent(
        node.get("dtotal").and_then(Value::as_u64).unwrap_or(0),
        node.get("dfree").and_then(Value::as_u64).unwrap_or(0),
    );
    node.insert("mem_used".to_owned(), json!(mem_used));
    node.insert("disk_used".to_owned(), json!(disk_used));
    node.insert("shared_storage".to_owned(), json!(false));
}

/// Used percentage out of a reported total; an offline node reports zero
/// totals and counts as 0% used.
fn used_percent(total: u64, free: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    total.saturating_sub(free) * 100 / total
}

/// `user[:group[:path]]` from the OS descriptor, with the authorized_keys
/// defaults for root and ordinary users.
fn map_ssh_user(spec: &str) -> (String, String, String) {
    let mut parts = spec.splitn(3, ':');
    let user = parts.next().unwrap_or_default().to_owned();
    let group = match parts.next() {
        Some(g) => g.to_owned(),
        // snf-image will expand the empty group to root or wheel.
        None if user == "root" => String::new(),
        None => user.clone(),
    };
    let path = match parts.next() {
        Some(p) => p.to_owned(),
        None if user == "root" => "/root/.ssh/authorized_keys".to_owned(),
        None => format!("/home/{}/.ssh/authorized_keys", user),
    };
    (user, group, path)
}

fn prettify_op_id(op_id: &str) -> String {
    let lowered = op_id
        .trim_start_matches("OP_")
        .replace('_', " ")
        .to_lowercase();
    let mut chars = lowered.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => lowered,
    }
}

fn version_at_least(actual: &str, required: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| p.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(actual) >= parse(required)
}

/// Lists instances across all enabled clusters with a bounded fan-out
/// pool. One cluster's unreachable API does not abort the others; a
/// failing cluster is omitted from the combined result.
pub async fn all_instances(clusters: &[Arc<Cluster>], refdata: &ReferenceData) -> Vec<Instance> {
    let enabled: Vec<Arc<Cluster>> = clusters
        .iter()
        .filter(|c| !c.config.disabled)
        .cloned()
        .collect();
    let results: Vec<Result<Vec<Instance>>> = stream::iter(enabled)
        .map(|cluster| {
            let refdata = refdata.clone();
            async move {
                let instances = cluster.get_instances(&refdata).await;
                if let Err(e) = &instances {
                    warn!(
                        cluster = cluster.config.slug.as_str(),
                        error = e.to_string().as_str(),
                        "skipping unreachable cluster"
                    );
                }
                instances
            }
        })
        .buffer_unordered(FANOUT_WIDTH)
        .collect()
        .await;
    results.into_iter().flatten().flatten().collect()
}

/// Post-hoc filter over an aggregated instance list.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub user: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
    pub name_contains: Option<String>,
    pub tag: Option<String>,
}

impl InstanceFilter {
    pub fn apply(&self, instances: Vec<Instance>) -> Vec<Instance> {
        instances
            .into_iter()
            .filter(|i| {
                self.user
                    .as_ref()
                    .map(|u| i.users.contains(u))
                    .unwrap_or(true)
                    && self
                        .group
                        .as_ref()
                        .map(|g| i.groups.contains(g))
                        .unwrap_or(true)
                    && self.name.as_ref().map(|n| &i.name == n).unwrap_or(true)
                    && self
                        .name_contains
                        .as_ref()
                        .map(|n| i.name.contains(n.as_str()))
                        .unwrap_or(true)
                    && self.tag.as_ref().map(|t| i.tags.contains(t)).unwrap_or(true)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::osimage::{OsDetails, StaticOsCatalog};
    use crate::refdata::{Application, UserRef};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeQueue {
        messages: Mutex<Vec<JobLockMessage>>,
        abandon: bool,
    }

    #[async_trait::async_trait]
    impl WorkQueue for FakeQueue {
        async fn publish(&self, message: &JobLockMessage) -> Delivery {
            if self.abandon {
                return Delivery::Abandoned("queue down".to_owned());
            }
            self.messages.lock().unwrap().push(message.clone());
            Delivery::Delivered
        }
    }

    struct FakeRapi {
        calls: Mutex<Vec<String>>,
        query_responses: Mutex<Vec<Value>>,
        instances: Value,
        info: Value,
        fail_everything: bool,
        fail_tags: bool,
        reinstall_bodies: Mutex<Vec<Value>>,
        modify_bodies: Mutex<Vec<Value>>,
        create_bodies: Mutex<Vec<Value>>,
    }

    impl Default for FakeRapi {
        fn default() -> Self {
            FakeRapi {
                calls: Mutex::new(Vec::new()),
                query_responses: Mutex::new(Vec::new()),
                instances: json!([]),
                info: json!({"software_version": "2.16.0"}),
                fail_everything: false,
                fail_tags: false,
                reinstall_bodies: Mutex::new(Vec::new()),
                modify_bodies: Mutex::new(Vec::new()),
                create_bodies: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeRapi {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push_query_response(&self, response: Value) {
            self.query_responses.lock().unwrap().push(response);
        }
    }

    #[async_trait::async_trait]
    impl RapiClient for FakeRapi {
        async fn get_instances(&self, _bulk: bool) -> Result<Value> {
            self.record("get_instances");
            Ok(self.instances.clone())
        }

        async fn query(
            &self,
            resource: &str,
            _fields: &[&str],
            _filter: Option<Value>,
        ) -> Result<Value> {
            self.record(&format!("query:{}", resource));
            if self.fail_everything {
                return Err(RapiError::Transport("cluster unreachable".to_owned()));
            }
            let mut responses = self.query_responses.lock().unwrap();
            if responses.is_empty() {
                Ok(json!({"fields": [], "data": []}))
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn modify_instance(&self, _instance: &str, params: Value) -> Result<String> {
            self.record("modify_instance");
            self.modify_bodies.lock().unwrap().push(params);
            Ok("50".to_owned())
        }

        async fn shutdown_instance(&self, _instance: &str) -> Result<String> {
            self.record("shutdown_instance");
            Ok("51".to_owned())
        }

        async fn startup_instance(&self, _instance: &str) -> Result<String> {
            self.record("startup_instance");
            Ok("52".to_owned())
        }

        async fn reboot_instance(&self, _instance: &str) -> Result<String> {
            self.record("reboot_instance");
            Ok("53".to_owned())
        }

        async fn migrate_instance(&self, _instance: &str) -> Result<String> {
            self.record("migrate_instance");
            Ok("54".to_owned())
        }

        async fn rename_instance(
            &self,
            _instance: &str,
            _new_name: &str,
            _ip_check: bool,
            _name_check: bool,
        ) -> Result<String> {
            self.record("rename_instance");
            Ok("55".to_owned())
        }

        async fn delete_instance(&self, _instance: &str) -> Result<String> {
            self.record("delete_instance");
            Ok("56".to_owned())
        }

        async fn create_instance(&self, body: Value) -> Result<String> {
            self.record("create_instance");
            self.create_bodies.lock().unwrap().push(body);
            Ok("57".to_owned())
        }

        async fn reinstall_instance(&self, _instance: &str, body: Value) -> Result<String> {
            self.record("reinstall_instance");
            self.reinstall_bodies.lock().unwrap().push(body);
            Ok("58".to_owned())
        }

        async fn add_instance_tags(&self, _instance: &str, _tags: &[String]) -> Result<String> {
            self.record("add_instance_tags");
            if self.fail_tags {
                return Err(RapiError::Api {
                    code: 500,
                    message: "tag job refused".to_owned(),
                });
            }
            Ok("59".to_owned())
        }

        async fn delete_instance_tags(&self, _instance: &str, _tags: &[String]) -> Result<String> {
            self.record("delete_instance_tags");
            Ok("60".to_owned())
        }

        async fn get_cluster_tags(&self) -> Result<Vec<String>> {
            Ok(vec![
                "gnt:ext:archipelago".to_owned(),
                "gnt:ext:archipelago:params:pool:rbd".to_owned(),
                "gnt:ext:bad provider".to_owned(),
                "gnt:ext:archipelago:params:bad key:v".to_owned(),
                "gnt:ext:archipelago:params:deep:a:b".to_owned(),
                "other".to_owned(),
            ])
        }

        async fn get_nodes(&self, _bulk: bool) -> Result<Value> {
            Ok(json!([]))
        }

        async fn get_groups(&self, _bulk: bool) -> Result<Value> {
            Ok(json!([
                {"name": "default", "alloc_policy": "preferred",
                 "node_list": ["node1", "node2"], "tags": ["vg:lvm"]},
                {"name": "quarantine", "alloc_policy": "unallocable",
                 "node_list": ["node9"], "tags": ["locked"]}
            ]))
        }

        async fn get_group(&self, _group: &str) -> Result<Value> {
            Ok(json!({}))
        }

        async fn get_networks(&self, _bulk: bool) -> Result<Value> {
            Ok(json!([]))
        }

        async fn get_info(&self) -> Result<Value> {
            self.record("get_info");
            Ok(self.info.clone())
        }

        async fn get_jobs(&self, _bulk: bool) -> Result<Value> {
            Ok(json!([
                {"id": 7, "start_ts": [1388535600, 0],
                 "ops": [{"OP_ID": "OP_INSTANCE_REBOOT"}]}
            ]))
        }

        async fn get_job_status(&self, _job_id: &str) -> Result<Value> {
            Ok(json!({"status": "running"}))
        }
    }

    fn cluster_with(rapi: Arc<FakeRapi>, queue: Arc<FakeQueue>) -> (Cluster, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let config = ClusterConfig {
            hostname: "ganeti.example.org".to_owned(),
            slug: "c1".to_owned(),
            ..Default::default()
        };
        (
            Cluster::new(config, rapi, cache.clone(), queue),
            cache,
        )
    }

    fn detail_response(name: &str) -> Value {
        json!({
            "fields": [{"name": "name"}, {"name": "tags"}, {"name": "status"}],
            "data": [[[0, name], [0, []], [0, "running"]]]
        })
    }

    #[tokio::test]
    async fn mutation_invalidates_detail_cache() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, cache) = cluster_with(rapi.clone(), queue);

        // Pre-seed with sentinel pre-mutation data.
        cache
            .set(
                &cluster.instance_key("vm1"),
                json!({"name": "vm1", "status": "old"}),
                Duration::from_secs(60),
            )
            .await;
        rapi.push_query_response(detail_response("vm1"));

        let job_id = cluster.shutdown_instance("vm1").await.unwrap();
        assert_eq!(job_id, "51");

        let info = cluster.get_instance_info("vm1").await.unwrap();
        assert_eq!(info.get("status"), Some(&json!("running")));
        assert!(rapi.calls().contains(&"query:instance".to_owned()));
    }

    #[tokio::test]
    async fn lock_sets_both_keys_and_expires() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue.clone());

        let delivery = cluster
            .lock_instance("vm1", "rebooting", LOCK_TTL, Some("53"), &[])
            .await;
        assert_eq!(delivery, Delivery::Delivered);
        assert!(cluster.is_locked("vm1").await);
        assert_eq!(
            cluster.locked_instances().await.get("vm1"),
            Some(&json!("rebooting"))
        );

        let messages = queue.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, "JOB_LOCK");
        assert_eq!(messages[0].lock_key, cluster.instance_lock_key("vm1"));
        assert_eq!(messages[0].flush_keys, vec![cluster.instance_key("vm1")]);
    }

    #[tokio::test]
    async fn expired_lock_reads_as_unlocked() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue);

        cluster
            .lock_instance("vm1", "rebooting", Duration::from_secs(0), None, &[])
            .await;
        assert!(!cluster.is_locked("vm1").await);
    }

    #[tokio::test]
    async fn abandoned_publish_still_locks() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue {
            abandon: true,
            ..Default::default()
        });
        let (cluster, _cache) = cluster_with(rapi, queue);

        let delivery = cluster
            .lock_instance("vm1", "deleting", LOCK_TTL, Some("56"), &[])
            .await;
        assert!(matches!(delivery, Delivery::Abandoned(_)));
        assert!(cluster.is_locked("vm1").await);
    }

    #[tokio::test]
    async fn tag_failure_returns_error_without_locking() {
        let rapi = Arc::new(FakeRapi {
            fail_tags: true,
            ..Default::default()
        });
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue.clone());

        let result = cluster
            .tag_instance("vm1", &["gnt:isolate".to_owned()])
            .await;
        assert!(matches!(result, Err(RapiError::Api { code: 500, .. })));
        assert!(!cluster.is_locked("vm1").await);
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tagging_flushes_the_instance_list() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue.clone());

        cluster
            .untag_instance("vm1", &["gnt:needsreboot".to_owned()])
            .await
            .unwrap();
        let messages = queue.messages.lock().unwrap().clone();
        assert!(messages[0]
            .flush_keys
            .contains(&cluster.instances_key()));
    }

    #[tokio::test]
    async fn forced_refresh_marks_action_lock() {
        let rapi = Arc::new(FakeRapi {
            instances: json!([{"name": "vm1"}, {"name": "vm2"}]),
            ..Default::default()
        });
        let queue = Arc::new(FakeQueue::default());
        let (cluster, cache) = cluster_with(rapi, queue);

        cluster.force_cache_refresh("vm2").await.unwrap();
        let cached = cache.get(&cluster.instances_key()).await.unwrap();
        assert_eq!(cached[0].get("action_lock"), None);
        assert_eq!(cached[1].get("action_lock"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn zero_total_counts_as_unused() {
        let mut node = json!({"name": "node1", "mfree": 512, "mtotal": 0,
                              "dtotal": Value::Null, "dfree": Value::Null})
            .as_object()
            .cloned()
            .unwrap();
        annotate_node(&mut node, &ClusterConfig::default());
        assert_eq!(node["mem_used"], json!(0));
        assert_eq!(node["disk_used"], json!(0));

        assert_eq!(used_percent(0, 12345), 0);
        assert_eq!(used_percent(100, 25), 75);
    }

    #[tokio::test]
    async fn fanout_omits_failing_cluster() {
        let queue = Arc::new(FakeQueue::default());
        let cache = Arc::new(MemoryCache::new());
        let list_response = || {
            json!({
                "fields": [{"name": "name"}, {"name": "tags"}],
                "data": [[[0, "vm1"], [0, []]]]
            })
        };

        let mut clusters = Vec::new();
        for (slug, fail) in [("c1", false), ("c2", true), ("c3", false)] {
            let rapi = Arc::new(FakeRapi {
                fail_everything: fail,
                ..Default::default()
            });
            rapi.push_query_response(list_response());
            clusters.push(Arc::new(Cluster::new(
                ClusterConfig {
                    hostname: format!("{}.example.org", slug),
                    slug: slug.to_owned(),
                    ..Default::default()
                },
                rapi,
                cache.clone(),
                queue.clone(),
            )));
        }

        let instances = all_instances(&clusters, &ReferenceData::default()).await;
        let mut from: Vec<&str> = instances.iter().map(|i| i.cluster.as_str()).collect();
        from.sort_unstable();
        assert_eq!(from, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn disabled_clusters_are_skipped() {
        let queue = Arc::new(FakeQueue::default());
        let cache = Arc::new(MemoryCache::new());
        let cluster = Arc::new(Cluster::new(
            ClusterConfig {
                slug: "c1".to_owned(),
                disabled: true,
                ..Default::default()
            },
            Arc::new(FakeRapi::default()),
            cache,
            queue,
        ));
        assert!(all_instances(&[cluster], &ReferenceData::default())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn reinstall_composes_osparams_and_clears_atomically() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi.clone(), queue);

        rapi.push_query_response(json!({
            "fields": [{"name": "name"}, {"name": "tags"}],
            "data": [[[0, "vm1"], [0, ["gnt:application:42"]]]]
        }));

        let mut refdata = ReferenceData::default();
        refdata.applications.insert(
            "42".to_owned(),
            Application {
                id: "42".to_owned(),
                applicant: "alice".to_owned(),
            },
        );
        refdata.users.insert(
            "alice".to_owned(),
            UserRef {
                username: "alice".to_owned(),
                groups: vec![],
                ssh_keys: vec!["ssh-ed25519 AAAA alice@host".to_owned()],
            },
        );

        let catalog = StaticOsCatalog::new(vec![(
            "debian-bookworm".to_owned(),
            OsDetails {
                provider: "debootstrap+default".to_owned(),
                ssh_key_param: Some("img_ssh_key_url".to_owned()),
                ssh_key_users: vec!["root".to_owned(), "admin:staff".to_owned()],
                osparams: [("img_format".to_owned(), json!(["ext4"]))]
                    .into_iter()
                    .collect(),
            },
        )]);

        let job_id = cluster
            .reinstall_instance(
                "vm1",
                "debian-bookworm",
                &catalog,
                &refdata,
                "https://console.example.org",
            )
            .await
            .unwrap();
        assert_eq!(job_id.as_deref(), Some("58"));

        let bodies = rapi.reinstall_bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert_eq!(body["os"], json!("debootstrap+default"));
        assert_eq!(body["clear_osparams"], json!(true));
        let osparams = body["osparams"].as_object().unwrap();
        assert_eq!(
            osparams["img_ssh_key_url"],
            json!("https://console.example.org/application/42/ssh_keys")
        );
        // Non-string values are JSON-encoded strings on the wire.
        assert!(osparams["img_format"].is_string());
        assert!(osparams["img_personality"].is_string());
        let personality: Value =
            serde_json::from_str(osparams["img_personality"].as_str().unwrap()).unwrap();
        assert_eq!(
            personality[0]["path"],
            json!("/root/.ssh/authorized_keys")
        );
        assert_eq!(personality[0]["group"], json!(""));
        assert_eq!(
            personality[1]["path"],
            json!("/home/admin/.ssh/authorized_keys")
        );
        assert_eq!(personality[1]["group"], json!("staff"));
        // No modify call on an atomic-capable cluster.
        assert!(!rapi.calls().contains(&"modify_instance".to_owned()));
    }

    #[tokio::test]
    async fn reinstall_on_old_cluster_modifies_params_first() {
        let rapi = Arc::new(FakeRapi {
            info: json!({"software_version": "2.15.2"}),
            ..Default::default()
        });
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi.clone(), queue);
        rapi.push_query_response(detail_response("vm1"));

        let catalog = StaticOsCatalog::new(vec![(
            "debian-bookworm".to_owned(),
            OsDetails {
                provider: "debootstrap+default".to_owned(),
                ssh_key_param: None,
                ssh_key_users: vec![],
                osparams: Default::default(),
            },
        )]);

        cluster
            .reinstall_instance(
                "vm1",
                "debian-bookworm",
                &catalog,
                &ReferenceData::default(),
                "https://console.example.org",
            )
            .await
            .unwrap();
        let calls = rapi.calls();
        let modify = calls.iter().position(|c| c == "modify_instance").unwrap();
        let reinstall = calls.iter().position(|c| c == "reinstall_instance").unwrap();
        assert!(modify < reinstall);
        let body = &rapi.reinstall_bodies.lock().unwrap()[0];
        assert_eq!(body.get("clear_osparams"), None);
    }

    #[tokio::test]
    async fn unknown_os_is_nothing_to_do() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi.clone(), queue);
        let catalog = StaticOsCatalog::new(vec![]);

        let job_id = cluster
            .reinstall_instance(
                "vm1",
                "no-such-os",
                &catalog,
                &ReferenceData::default(),
                "https://console.example.org",
            )
            .await
            .unwrap();
        assert_eq!(job_id, None);
        assert!(rapi.calls().is_empty());
    }

    #[tokio::test]
    async fn create_omits_unset_backend_params() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi.clone(), queue);

        cluster
            .create_instance(CreateInstanceParams {
                name: "vm9".to_owned(),
                os: "debootstrap+default".to_owned(),
                memory: Some(2048),
                nodes: vec!["node1".to_owned(), "node2".to_owned()],
                ..Default::default()
            })
            .await
            .unwrap();
        let body = &rapi.create_bodies.lock().unwrap()[0];
        assert_eq!(body["beparams"], json!({"memory": 2048}));
        assert_eq!(body["disk_template"], json!("drbd"));
        assert_eq!(body["pnode"], json!("node1"));
        assert_eq!(body["snode"], json!("node2"));
        assert_eq!(body["start"], json!(false));
    }

    #[tokio::test]
    async fn locked_nodegroup_nodes_are_collected() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue);
        assert_eq!(
            cluster.locked_nodes_from_nodegroup().await.unwrap(),
            vec!["node9"]
        );
    }

    #[tokio::test]
    async fn job_list_is_annotated() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue);
        let jobs = cluster.get_job_list().await.unwrap();
        assert_eq!(jobs[0]["cluster"], json!("c1"));
        assert_eq!(jobs[0]["ops"][0]["OP_ID"], json!("Instance reboot"));
        assert_eq!(jobs[0]["start_time"], json!("2014-01-01 00:20:00"));
    }

    #[tokio::test]
    async fn extstorage_tags_are_parsed() {
        let rapi = Arc::new(FakeRapi::default());
        let queue = Arc::new(FakeQueue::default());
        let (cluster, _cache) = cluster_with(rapi, queue);
        // Malformed provider and parameter tags are dropped, not mangled.
        assert_eq!(
            cluster.get_extstorage_providers().await.unwrap(),
            vec!["archipelago[ext]"]
        );
        let params = cluster
            .get_extstorage_disk_params("archipelago")
            .await
            .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("pool").map(String::as_str), Some("rbd"));
    }

    #[test]
    fn version_threshold() {
        assert!(version_at_least("2.16.0", "2.16.0"));
        assert!(version_at_least("2.17.1", "2.16.0"));
        assert!(!version_at_least("2.15.2", "2.16.0"));
        assert!(!version_at_least("0", "2.16.0"));
    }

    #[test]
    fn filter_matches_ownership_and_tags() {
        let instances = vec![
            Instance {
                name: "vm1".to_owned(),
                users: vec!["alice".to_owned()],
                tags: vec!["gnt:isolate".to_owned()],
                ..Default::default()
            },
            Instance {
                name: "vm2".to_owned(),
                users: vec!["bob".to_owned()],
                ..Default::default()
            },
        ];
        let filtered = InstanceFilter {
            user: Some("alice".to_owned()),
            ..Default::default()
        }
        .apply(instances.clone());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "vm1");

        let filtered = InstanceFilter {
            name_contains: Some("vm".to_owned()),
            tag: Some("gnt:isolate".to_owned()),
            ..Default::default()
        }
        .apply(instances);
        assert_eq!(filtered.len(), 1);
    }
}
