//! Runtime binding table (extension → registered contacts)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use flowpbx_sip_core::Uri;
use flowpbx_sip_transport::TransportKind;

use crate::error::{Error, Result};

/// How often the expiry scan runs.
pub const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// One registered contact for an extension.
#[derive(Debug, Clone)]
pub struct Binding {
    pub contact_uri: Uri,
    /// Network source the REGISTER arrived from; INVITEs are sent here, not
    /// to the advertised contact, which is routinely behind NAT.
    pub source: SocketAddr,
    pub transport: TransportKind,
    pub expires_at: Instant,
    /// Wall-clock expiry, reported in 200 OK and diagnostics.
    pub expires_wall: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub push_token: Option<String>,
    pub push_platform: Option<String>,
    pub device_id: Option<String>,
}

impl Binding {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Bindings match when they are the same device: by device id when both
    /// sides advertise one, otherwise by contact URI.
    fn same_device(&self, other: &Binding) -> bool {
        match (&self.device_id, &other.device_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.contact_uri == other.contact_uri,
        }
    }
}

/// In-memory registration table. Reads on the INVITE path are lock-free per
/// shard; the single writer per extension is the REGISTER handler.
pub struct BindingStore {
    bindings: DashMap<String, Vec<Binding>>,
    /// Fired with the extension number whenever a binding is added or
    /// refreshed; the push wake-up path listens for this.
    registered_tx: broadcast::Sender<String>,
}

impl Default for BindingStore {
    fn default() -> Self {
        BindingStore::new()
    }
}

impl BindingStore {
    pub fn new() -> Self {
        let (registered_tx, _) = broadcast::channel(64);
        BindingStore {
            bindings: DashMap::new(),
            registered_tx,
        }
    }

    /// Subscribe to binding-added notifications.
    pub fn subscribe_registrations(&self) -> broadcast::Receiver<String> {
        self.registered_tx.subscribe()
    }

    /// Insert or refresh a binding. A refresh never moves the expiry
    /// backwards. Fails when the extension would exceed `max_contacts`.
    pub fn upsert(&self, extension: &str, binding: Binding, max_contacts: usize) -> Result<()> {
        let mut entry = self.bindings.entry(extension.to_string()).or_default();
        entry.retain(|b| !b.is_expired());

        if let Some(existing) = entry.iter_mut().find(|b| b.same_device(&binding)) {
            let expires_at = existing.expires_at.max(binding.expires_at);
            let expires_wall = existing.expires_wall.max(binding.expires_wall);
            *existing = binding;
            existing.expires_at = expires_at;
            existing.expires_wall = expires_wall;
        } else {
            if entry.len() >= max_contacts {
                return Err(Error::MaxRegistrations {
                    user: extension.to_string(),
                    limit: max_contacts,
                });
            }
            entry.push(binding);
        }
        drop(entry);

        let _ = self.registered_tx.send(extension.to_string());
        Ok(())
    }

    /// Remove one contact (`expires=0` for a single Contact).
    pub fn remove(&self, extension: &str, contact_uri: &Uri) {
        if let Some(mut entry) = self.bindings.get_mut(extension) {
            entry.retain(|b| &b.contact_uri != contact_uri);
            if entry.is_empty() {
                drop(entry);
                self.bindings.remove(extension);
            }
        }
    }

    /// Remove every contact (wildcard un-register).
    pub fn remove_all(&self, extension: &str) {
        self.bindings.remove(extension);
        info!("cleared all bindings for {extension}");
    }

    /// Current unexpired bindings for an extension.
    pub fn lookup(&self, extension: &str) -> Vec<Binding> {
        self.bindings
            .get(extension)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|b| !b.is_expired())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored push tokens for an extension, including expired bindings:
    /// a phone whose registration lapsed is exactly the one that needs a
    /// push wake-up.
    pub fn push_tokens(&self, extension: &str) -> Vec<(String, String)> {
        self.bindings
            .get(extension)
            .map(|entry| {
                entry
                    .iter()
                    .filter_map(|b| {
                        Some((b.push_token.clone()?, b.push_platform.clone().unwrap_or_default()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every binding past its deadline. Returns how many were removed.
    pub fn expire_scan(&self) -> usize {
        let mut removed = 0;
        let mut empty_keys = Vec::new();
        for mut entry in self.bindings.iter_mut() {
            let before = entry.len();
            entry.retain(|b| !b.is_expired());
            removed += before - entry.len();
            if entry.is_empty() {
                empty_keys.push(entry.key().clone());
            }
        }
        for key in empty_keys {
            self.bindings.remove_if(&key, |_, v| v.is_empty());
        }
        if removed > 0 {
            debug!("expiry scan removed {removed} bindings");
        }
        removed
    }

    pub fn total_bindings(&self) -> usize {
        self.bindings.iter().map(|e| e.len()).sum()
    }
}

/// Run the fixed-cadence expiry scan until the store is dropped.
pub fn spawn_expiry_scan(store: Arc<BindingStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(EXPIRY_SCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            store.expire_scan();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(uri: &str, ttl: Duration) -> Binding {
        Binding {
            contact_uri: uri.parse().unwrap(),
            source: "192.168.1.20:5060".parse().unwrap(),
            transport: TransportKind::Udp,
            expires_at: Instant::now() + ttl,
            expires_wall: Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
            user_agent: None,
            push_token: None,
            push_platform: None,
            device_id: None,
        }
    }

    #[test]
    fn upsert_and_lookup() {
        let store = BindingStore::new();
        store
            .upsert("201", binding("sip:201@10.0.0.2", Duration::from_secs(60)), 5)
            .unwrap();
        assert_eq!(store.lookup("201").len(), 1);
        assert!(store.lookup("202").is_empty());
    }

    #[test]
    fn refresh_never_shortens_expiry() {
        let store = BindingStore::new();
        store
            .upsert("201", binding("sip:201@10.0.0.2", Duration::from_secs(600)), 5)
            .unwrap();
        let long_deadline = store.lookup("201")[0].expires_at;

        store
            .upsert("201", binding("sip:201@10.0.0.2", Duration::from_secs(10)), 5)
            .unwrap();
        assert_eq!(store.lookup("201").len(), 1);
        assert!(store.lookup("201")[0].expires_at >= long_deadline);
    }

    #[test]
    fn max_contacts_enforced() {
        let store = BindingStore::new();
        store
            .upsert("201", binding("sip:201@10.0.0.2", Duration::from_secs(60)), 2)
            .unwrap();
        store
            .upsert("201", binding("sip:201@10.0.0.3", Duration::from_secs(60)), 2)
            .unwrap();
        let err = store
            .upsert("201", binding("sip:201@10.0.0.4", Duration::from_secs(60)), 2)
            .unwrap_err();
        assert!(matches!(err, Error::MaxRegistrations { limit: 2, .. }));
    }

    #[test]
    fn device_id_matches_across_contact_change() {
        let store = BindingStore::new();
        let mut first = binding("sip:201@10.0.0.2:1024", Duration::from_secs(60));
        first.device_id = Some("ios-7f".into());
        let mut second = binding("sip:201@10.0.0.9:4096", Duration::from_secs(60));
        second.device_id = Some("ios-7f".into());

        store.upsert("201", first, 1).unwrap();
        store.upsert("201", second, 1).unwrap();
        let found = store.lookup("201");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].contact_uri.host, "10.0.0.9");
    }

    #[test]
    fn expire_scan_removes_dead_bindings() {
        let store = BindingStore::new();
        store
            .upsert("201", binding("sip:201@10.0.0.2", Duration::ZERO), 5)
            .unwrap();
        // The binding is already past its deadline.
        assert!(store.lookup("201").is_empty());
        assert_eq!(store.expire_scan(), 1);
        assert_eq!(store.total_bindings(), 0);
    }

    #[test]
    fn remove_specific_contact() {
        let store = BindingStore::new();
        store
            .upsert("201", binding("sip:201@10.0.0.2", Duration::from_secs(60)), 5)
            .unwrap();
        store
            .upsert("201", binding("sip:201@10.0.0.3", Duration::from_secs(60)), 5)
            .unwrap();
        store.remove("201", &"sip:201@10.0.0.2".parse().unwrap());
        let left = store.lookup("201");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].contact_uri.host, "10.0.0.3");
    }
}
