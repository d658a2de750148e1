use std::io::ErrorKind;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;
use tracing::warn;

use crate::env::INSTANCE_ACTION_ACTIVE_DAYS;

/// Sentinel stored in place of a consumed or expired activation key.
/// Makes every key single-use: once activated, the key no longer matches
/// any record.
pub const ALREADY_ACTIVATED: &str = "ALREADY_ACTIVATED";

static ACTIVATION_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-f0-9]{40}$").unwrap());

/// Destructive operations that require mail-confirmed activation before
/// they are carried out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum ActionKind {
    Reinstall,
    Destroy,
    Rename,
    MailChange,
}

/// One filed action awaiting activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceAction {
    pub applicant: String,
    pub instance: String,
    pub cluster: String,
    pub kind: ActionKind,
    /// Operand of the action: the target OS for a reinstall, the new name
    /// for a rename, the new address for a mail change.
    pub action_value: Option<String>,
    /// OS the instance runs at filing time, kept for the confirmation mail.
    pub operating_system: Option<String>,
    pub activation_key: String,
    pub filed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl InstanceAction {
    pub fn has_expired(&self) -> bool {
        self.activation_key == ALREADY_ACTIVATED
            || Utc::now() - self.filed > Duration::days(*INSTANCE_ACTION_ACTIVE_DAYS)
    }

    pub fn expire_now(&mut self) {
        self.activation_key = ALREADY_ACTIVATED.to_owned();
        self.last_updated = Utc::now();
    }

    fn is_pending(&self) -> bool {
        !self.has_expired()
    }

    fn matches(&self, instance: &str, cluster: &str, kind: ActionKind) -> bool {
        self.instance == instance && self.cluster == cluster && self.kind == kind
    }
}

/// Activation keys are the 40 lowercase hex digits of a SHA-1; anything
/// else is rejected before touching the ledger.
fn is_activation_key(key: &str) -> bool {
    ACTIVATION_KEY_RE.is_match(key)
}

fn new_activation_key(applicant: &str) -> String {
    let mut nonce = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut nonce);
    let salt = &hex::encode(Sha1::digest(nonce))[..5];
    hex::encode(Sha1::digest(format!("{}{}", salt, applicant).as_bytes()))
}

/// Durable ledger of filed actions, persisted as a JSON file. Writes go
/// through a copy plus an atomic rename so a crash never leaves a
/// half-written ledger behind.
#[derive(Clone)]
pub struct ActionLedger {
    path: String,
    state: Arc<RwLock<Vec<InstanceAction>>>,
}

impl ActionLedger {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let mut actions = Vec::new();
        match tokio::fs::read(path).await {
            Ok(contents) => {
                actions = serde_json::from_slice(&contents)?;
            }
            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(ActionLedger {
            path: path.to_string(),
            state: Arc::new(RwLock::new(actions)),
        })
    }

    async fn read_write<F>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&mut Vec<InstanceAction>) -> bool,
    {
        let state = &mut *self.state.write().await;
        let mut new_state = state.clone();
        if f(&mut new_state) {
            let data = serde_json::to_vec(&new_state)?;
            let tmp_path = format!("{}.tmp", self.path);
            tokio::fs::write(&tmp_path, data).await?;
            tokio::fs::rename(&tmp_path, &self.path).await?;
            *state = new_state;
        }
        Ok(())
    }

    /// Files a new action. Any still-pending action of the same applicant
    /// for the same instance, cluster and kind is expired first, so at
    /// most one such action can ever be activated. Actions of a different
    /// kind, or for a same-named instance on another cluster, are left
    /// alone.
    pub async fn create_action(
        &self,
        applicant: &str,
        instance: &str,
        cluster: &str,
        kind: ActionKind,
        action_value: Option<String>,
        operating_system: Option<String>,
    ) -> anyhow::Result<InstanceAction> {
        let now = Utc::now();
        let action = InstanceAction {
            applicant: applicant.to_owned(),
            instance: instance.to_owned(),
            cluster: cluster.to_owned(),
            kind,
            action_value,
            operating_system,
            activation_key: new_activation_key(applicant),
            filed: now,
            last_updated: now,
        };
        let created = action.clone();
        self.read_write(|actions| {
            for prior in actions.iter_mut() {
                if prior.applicant == applicant
                    && prior.matches(instance, cluster, kind)
                    && prior.is_pending()
                {
                    prior.expire_now();
                }
            }
            actions.push(action.clone());
            true
        })
        .await?;
        Ok(created)
    }

    /// Consumes an activation key. A well-formed key matching a pending
    /// record expires that record and hands it back for execution;
    /// anything else, including a key that was already consumed, yields
    /// `None`.
    pub async fn activate_request(&self, key: &str) -> anyhow::Result<Option<InstanceAction>> {
        if !is_activation_key(key) {
            return Ok(None);
        }
        let mut activated = None;
        self.read_write(|actions| {
            for action in actions.iter_mut() {
                if action.activation_key == key {
                    if action.is_pending() {
                        activated = Some(action.clone());
                    }
                    action.expire_now();
                    return true;
                }
            }
            false
        })
        .await?;
        Ok(activated)
    }

    /// The single pending action of a kind for an instance on a cluster.
    /// Finding more than one means the single-active invariant was
    /// violated; all candidates are expired and none is returned.
    pub async fn pending_action(
        &self,
        instance: &str,
        cluster: &str,
        kind: ActionKind,
    ) -> anyhow::Result<Option<InstanceAction>> {
        let pending: Vec<InstanceAction> = self
            .state
            .read()
            .await
            .iter()
            .filter(|a| a.matches(instance, cluster, kind) && a.is_pending())
            .cloned()
            .collect();
        match pending.len() {
            0 => Ok(None),
            1 => Ok(pending.into_iter().next()),
            n => {
                warn!(instance, cluster, count = n, "multiple pending actions, expiring all");
                self.read_write(|actions| {
                    let mut changed = false;
                    for action in actions.iter_mut() {
                        if action.matches(instance, cluster, kind) && action.is_pending() {
                            action.expire_now();
                            changed = true;
                        }
                    }
                    changed
                })
                .await?;
                Ok(None)
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<InstanceAction> {
        self.state.read().await.clone()
    }
}
