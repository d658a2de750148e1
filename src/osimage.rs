use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Installation descriptor for one offered operating system image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsDetails {
    /// OS provider name passed to the cluster, e.g. `debootstrap+default`.
    pub provider: String,
    /// OS parameter that receives the URL of the applicant's public-key
    /// bundle, when the image supports fetching keys itself.
    pub ssh_key_param: Option<String>,
    /// Accounts that get the applicant's keys written into their
    /// authorized_keys file, as `user[:group[:path]]` specs.
    pub ssh_key_users: Vec<String>,
    /// Extra OS parameters submitted verbatim with the reinstall.
    pub osparams: Map<String, Value>,
}

/// Maps an offered OS identifier to its installation descriptor. An
/// unknown identifier is not an error; it means there is nothing to
/// install.
pub trait OsCatalog: Send + Sync {
    fn lookup(&self, operating_system: &str) -> Option<OsDetails>;
}

/// Catalog backed by a fixed table, typically deserialized from the
/// console configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticOsCatalog {
    entries: HashMap<String, OsDetails>,
}

impl StaticOsCatalog {
    pub fn new(entries: Vec<(String, OsDetails)>) -> Self {
        StaticOsCatalog {
            entries: entries.into_iter().collect(),
        }
    }
}

impl OsCatalog for StaticOsCatalog {
    fn lookup(&self, operating_system: &str) -> Option<OsDetails> {
        self.entries.get(operating_system).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_by_exact_identifier() {
        let catalog = StaticOsCatalog::new(vec![(
            "debian-bookworm".to_owned(),
            OsDetails {
                provider: "debootstrap+default".to_owned(),
                ..Default::default()
            },
        )]);
        assert_eq!(
            catalog.lookup("debian-bookworm").map(|d| d.provider),
            Some("debootstrap+default".to_owned())
        );
        assert!(catalog.lookup("debian").is_none());
    }
}
