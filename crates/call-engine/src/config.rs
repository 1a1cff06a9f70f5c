//! Engine configuration
//!
//! A typed snapshot of the key-value configuration the repository layer
//! owns. Loaded from a TOML file with `FLOWPBX_`-prefixed environment
//! overrides; every field has the documented default.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_sip_udp_port() -> u16 {
    5060
}
fn default_sip_tcp_port() -> u16 {
    5060
}
fn default_rtp_port_min() -> u16 {
    10_000
}
fn default_rtp_port_max() -> u16 {
    20_000
}
fn default_external_ip() -> IpAddr {
    "127.0.0.1".parse().expect("literal address")
}
fn default_min_register_expiry() -> u32 {
    60
}
fn default_max_register_expiry() -> u32 {
    7_200
}
fn default_realm() -> String {
    "flowpbx".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_recording_policy() -> RecordingPolicy {
    RecordingPolicy::FollowEntity
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/flowpbx")
}
fn default_push_wait_secs() -> u64 {
    5
}
fn default_ring_timeout_secs() -> u64 {
    30
}
fn default_node_deadline_secs() -> u64 {
    120
}
fn default_max_flow_steps() -> usize {
    1_000
}

/// Global recording override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingPolicy {
    Off,
    Always,
    FollowEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_sip_udp_port")]
    pub sip_udp_port: u16,
    #[serde(default = "default_sip_tcp_port")]
    pub sip_tcp_port: u16,
    /// TLS listener; absent disables TLS.
    #[serde(default)]
    pub sip_tls_port: Option<u16>,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,

    #[serde(default = "default_rtp_port_min")]
    pub rtp_port_min: u16,
    #[serde(default = "default_rtp_port_max")]
    pub rtp_port_max: u16,

    /// Address written into outgoing SDP and Contact headers.
    #[serde(default = "default_external_ip")]
    pub external_ip: IpAddr,

    #[serde(default = "default_min_register_expiry")]
    pub min_register_expiry: u32,
    #[serde(default = "default_max_register_expiry")]
    pub max_register_expiry: u32,
    #[serde(default = "default_realm")]
    pub realm: String,

    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_from: Option<String>,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_tls: bool,

    #[serde(default = "default_recording_policy")]
    pub recording_policy: RecordingPolicy,
    /// 0 disables the cleanup scan.
    #[serde(default)]
    pub recording_retention_days: u32,
    #[serde(default)]
    pub voicemail_retention_days: u32,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Push gateway for waking mobile clients with no live binding.
    #[serde(default)]
    pub push_gateway_url: Option<String>,
    #[serde(default)]
    pub license_key: Option<String>,
    #[serde(default = "default_push_wait_secs")]
    pub push_wait_secs: u64,

    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
    #[serde(default = "default_node_deadline_secs")]
    pub node_deadline_secs: u64,
    #[serde(default = "default_max_flow_steps")]
    pub max_flow_steps: usize,
}

impl Default for Config {
    fn default() -> Self {
        // An empty source yields pure defaults.
        config::Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .expect("defaults are valid")
    }
}

impl Config {
    /// Load from a TOML file, then apply `FLOWPBX_*` environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Config> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("FLOWPBX"));
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Other(format!("configuration error: {e}")))
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }

    pub fn voicemail_dir(&self) -> PathBuf {
        self.data_dir.join("voicemail")
    }

    pub fn greetings_dir(&self) -> PathBuf {
        self.data_dir.join("greetings")
    }

    pub fn system_prompts_dir(&self) -> PathBuf {
        self.data_dir.join("prompts/system")
    }

    pub fn smtp_configured(&self) -> bool {
        self.smtp_host.is_some() && self.smtp_from.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = Config::default();
        assert_eq!(config.sip_udp_port, 5060);
        assert_eq!(config.rtp_port_min, 10_000);
        assert_eq!(config.rtp_port_max, 20_000);
        assert_eq!(config.min_register_expiry, 60);
        assert_eq!(config.push_wait_secs, 5);
        assert_eq!(config.ring_timeout_secs, 30);
        assert_eq!(config.recording_policy, RecordingPolicy::FollowEntity);
        assert!(config.sip_tls_port.is_none());
        assert!(!config.smtp_configured());
    }

    #[test]
    fn directory_layout() {
        let config = Config::default();
        assert!(config.recordings_dir().ends_with("recordings"));
        assert!(config.voicemail_dir().ends_with("voicemail"));
        assert!(config.system_prompts_dir().ends_with("prompts/system"));
    }
}
