use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::Cache;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub username: String,
    pub groups: Vec<String>,
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupRef {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organization {
    pub tag: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Application {
    pub id: String,
    pub applicant: String,
}

impl Application {
    /// URL serving the applicant's public-key bundle, injected into OS
    /// parameters on reinstall.
    pub fn ssh_keys_url(&self, fqdn: &str) -> String {
        format!("{}/application/{}/ssh_keys", fqdn, self.id)
    }
}

/// All reference maps needed to aggregate an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceData {
    /// Users keyed by username.
    pub users: HashMap<String, UserRef>,
    /// Groups keyed by name, membership resolved.
    pub groups: HashMap<String, GroupRef>,
    /// Organizations keyed by their tag suffix.
    pub orgs: HashMap<String, Organization>,
    /// Instance applications keyed by identifier.
    pub applications: HashMap<String, Application>,
    /// Network link identifier to optional IPv6 prefix.
    pub networks: HashMap<String, Option<String>>,
}

/// Source of record for reference data (the console's user/group/network
/// directories). External collaborator.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_users(&self) -> anyhow::Result<HashMap<String, UserRef>>;
    async fn list_groups(&self) -> anyhow::Result<HashMap<String, GroupRef>>;
    async fn list_orgs(&self) -> anyhow::Result<HashMap<String, Organization>>;
    async fn list_applications(&self) -> anyhow::Result<HashMap<String, Application>>;
    async fn list_networks(&self) -> anyhow::Result<HashMap<String, Option<String>>>;
}

const REFDATA_TTL: Duration = Duration::from_secs(60);

/// Short-lived cache over the directory, refreshed independently of
/// instance data.
///
/// Each sub-map refreshes as a whole on miss. Concurrent misses may each
/// refresh redundantly; correctness does not depend on the refresh being
/// at-most-once.
pub struct RefDataCache {
    cache: Arc<dyn Cache>,
    directory: Arc<dyn Directory>,
}

impl RefDataCache {
    pub fn new(cache: Arc<dyn Cache>, directory: Arc<dyn Directory>) -> Self {
        RefDataCache { cache, directory }
    }

    pub async fn preload(&self) -> ReferenceData {
        ReferenceData {
            users: self
                .submap("userlist", || self.directory.list_users())
                .await,
            groups: self
                .submap("grouplist", || self.directory.list_groups())
                .await,
            orgs: self.submap("orglist", || self.directory.list_orgs()).await,
            applications: self
                .submap("applicationlist", || self.directory.list_applications())
                .await,
            networks: self
                .submap("networklist", || self.directory.list_networks())
                .await,
        }
    }

    async fn submap<T, F, Fut>(&self, key: &str, refresh: F) -> T
    where
        T: Serialize + serde::de::DeserializeOwned + Default,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        if let Some(cached) = self.cache.get(key).await {
            if let Ok(map) = serde_json::from_value(cached) {
                return map;
            }
        }
        match refresh().await {
            Ok(map) => {
                if let Ok(value) = serde_json::to_value(&map) {
                    self.cache.set(key, value, REFDATA_TTL).await;
                }
                map
            }
            Err(e) => {
                warn!(key, error = e.to_string().as_str(), "reference data refresh failed");
                T::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDirectory {
        user_calls: AtomicUsize,
    }

    #[async_trait]
    impl Directory for CountingDirectory {
        async fn list_users(&self) -> anyhow::Result<HashMap<String, UserRef>> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            let mut users = HashMap::new();
            users.insert(
                "alice".to_owned(),
                UserRef {
                    username: "alice".to_owned(),
                    groups: vec!["ops".to_owned()],
                    ssh_keys: vec![],
                },
            );
            Ok(users)
        }

        async fn list_groups(&self) -> anyhow::Result<HashMap<String, GroupRef>> {
            Ok(HashMap::new())
        }

        async fn list_orgs(&self) -> anyhow::Result<HashMap<String, Organization>> {
            Ok(HashMap::new())
        }

        async fn list_applications(&self) -> anyhow::Result<HashMap<String, Application>> {
            Ok(HashMap::new())
        }

        async fn list_networks(&self) -> anyhow::Result<HashMap<String, Option<String>>> {
            anyhow::bail!("network directory unreachable")
        }
    }

    #[tokio::test]
    async fn second_preload_hits_cache() {
        let directory = Arc::new(CountingDirectory::default());
        let refdata = RefDataCache::new(Arc::new(MemoryCache::new()), directory.clone());

        let first = refdata.preload().await;
        let second = refdata.preload().await;
        assert!(first.users.contains_key("alice"));
        assert!(second.users.contains_key("alice"));
        assert_eq!(directory.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_submap_degrades_to_empty() {
        let refdata = RefDataCache::new(
            Arc::new(MemoryCache::new()),
            Arc::new(CountingDirectory::default()),
        );
        let data = refdata.preload().await;
        assert!(data.networks.is_empty());
        assert!(data.users.contains_key("alice"));
    }

    #[test]
    fn ssh_keys_url_embeds_application_id() {
        let app = Application {
            id: "42".to_owned(),
            applicant: "alice".to_owned(),
        };
        assert_eq!(
            app.ssh_keys_url("https://console.example.org"),
            "https://console.example.org/application/42/ssh_keys"
        );
    }
}
