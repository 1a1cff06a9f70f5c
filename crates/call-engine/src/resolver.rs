//! Entity resolver contract
//!
//! Long-lived entities (extensions, trunks, flows, mailboxes, groups,
//! menus, time switches, bridges, inbound numbers) are owned by the
//! external repository. The core consumes them through this narrow
//! resolve-by-id interface; every node handler goes through it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flow::FlowGraph;

/// Extension account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub id: u64,
    /// Dialable number, also the SIP username.
    pub number: String,
    pub display_name: String,
    /// Digest verifier (HA1).
    pub ha1: String,
    #[serde(default)]
    pub ring_timeout_secs: Option<u64>,
    #[serde(default)]
    pub dnd: bool,
    #[serde(default = "default_max_contacts")]
    pub max_contacts: usize,
    #[serde(default)]
    pub record_calls: bool,
    #[serde(default)]
    pub voicemail_box: Option<u64>,
}

fn default_max_contacts() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundNumber {
    pub id: u64,
    /// The DID in the format trunks present it.
    pub number: String,
    pub flow_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingGroup {
    pub id: u64,
    pub name: String,
    /// Member extension numbers.
    pub members: Vec<String>,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub ring_timeout_secs: Option<u64>,
    /// "pass" or "prepend".
    #[serde(default)]
    pub caller_id_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvrMenu {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub greeting_file: Option<String>,
    #[serde(default)]
    pub greeting_text: Option<String>,
    /// Digit → option label; the digit itself is the output port.
    pub options: HashMap<String, String>,
    #[serde(default = "default_ivr_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ivr_timeout")]
    pub timeout_secs: u64,
}

fn default_ivr_retries() -> u32 {
    3
}
fn default_ivr_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRule {
    pub label: String,
    /// Lowercase three-letter day names: "mon".."sun".
    pub days: Vec<String>,
    /// "HH:MM" inclusive start.
    pub start: String,
    /// "HH:MM" exclusive end; start > end spans midnight.
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSwitch {
    pub id: u64,
    pub name: String,
    pub timezone: String,
    pub rules: Vec<TimeRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicemailBox {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_vm_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_vm_max_duration")]
    pub max_message_secs: u64,
    /// "default" or "custom" (file at `<data>/greetings/box_<id>.wav`).
    #[serde(default)]
    pub greeting_type: String,
    /// Extension whose devices get MWI NOTIFYs.
    #[serde(default)]
    pub notify_extension: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_attach_audio: bool,
}

fn default_vm_max_messages() -> usize {
    100
}
fn default_vm_max_duration() -> u64 {
    180
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceBridge {
    pub id: u64,
    pub name: String,
    /// Dialable room extension.
    pub number: String,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default = "default_conf_max_members")]
    pub max_members: usize,
    #[serde(default)]
    pub mute_on_join: bool,
    #[serde(default = "default_true")]
    pub announce_join: bool,
    #[serde(default)]
    pub record: bool,
}

fn default_conf_max_members() -> usize {
    32
}
fn default_true() -> bool {
    true
}

/// Typed payload returned by the resolver.
#[derive(Debug, Clone)]
pub enum Entity {
    Extension(Extension),
    InboundNumber(InboundNumber),
    RingGroup(RingGroup),
    IvrMenu(IvrMenu),
    TimeSwitch(TimeSwitch),
    VoicemailBox(VoicemailBox),
    Conference(ConferenceBridge),
}

impl Entity {
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::Extension(_) => "extension",
            Entity::InboundNumber(_) => "inbound_number",
            Entity::RingGroup(_) => "ring_group",
            Entity::IvrMenu(_) => "ivr_menu",
            Entity::TimeSwitch(_) => "time_switch",
            Entity::VoicemailBox(_) => "voicemail_box",
            Entity::Conference(_) => "conference",
        }
    }
}

/// The repository lookup interface the core consumes.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// Fetch an entity by type name and id.
    async fn resolve(&self, entity_type: &str, id: u64) -> Result<Entity>;

    /// Look up an extension by its dialable number.
    async fn extension_by_number(&self, number: &str) -> Option<Extension>;

    /// Look up a DID by the dialled number.
    async fn inbound_number(&self, number: &str) -> Option<InboundNumber>;

    /// Look up a conference bridge by its room extension.
    async fn conference_by_number(&self, number: &str) -> Option<ConferenceBridge>;

    /// Fetch a published flow graph.
    async fn flow(&self, flow_id: u64) -> Result<FlowGraph>;
}

/// Typed fetch helpers over the string-keyed resolver.
pub struct Resolver;

macro_rules! typed_resolve {
    ($name:ident, $variant:ident, $ty:ty, $type_name:literal) => {
        pub async fn $name(resolver: &dyn EntityResolver, id: u64) -> Result<$ty> {
            match resolver.resolve($type_name, id).await? {
                Entity::$variant(entity) => Ok(entity),
                other => Err(Error::TypeMismatch {
                    id: id.to_string(),
                    expected: $type_name.to_string(),
                    actual: other.type_name().to_string(),
                }),
            }
        }
    };
}

impl Resolver {
    typed_resolve!(extension, Extension, Extension, "extension");
    typed_resolve!(ring_group, RingGroup, RingGroup, "ring_group");
    typed_resolve!(ivr_menu, IvrMenu, IvrMenu, "ivr_menu");
    typed_resolve!(time_switch, TimeSwitch, TimeSwitch, "time_switch");
    typed_resolve!(voicemail_box, VoicemailBox, VoicemailBox, "voicemail_box");
    typed_resolve!(conference, Conference, ConferenceBridge, "conference");
}

/// In-memory resolver used by tests and the flow validator CLI.
#[derive(Default)]
pub struct StaticResolver {
    pub extensions: Vec<Extension>,
    pub inbound_numbers: Vec<InboundNumber>,
    pub ring_groups: Vec<RingGroup>,
    pub ivr_menus: Vec<IvrMenu>,
    pub time_switches: Vec<TimeSwitch>,
    pub voicemail_boxes: Vec<VoicemailBox>,
    pub conferences: Vec<ConferenceBridge>,
    pub flows: Vec<(u64, FlowGraph)>,
}

impl StaticResolver {
    pub fn into_arc(self) -> Arc<dyn EntityResolver> {
        Arc::new(self)
    }
}

#[async_trait]
impl EntityResolver for StaticResolver {
    async fn resolve(&self, entity_type: &str, id: u64) -> Result<Entity> {
        let not_found = || Error::EntityNotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        };
        match entity_type {
            "extension" => self
                .extensions
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::Extension)
                .ok_or_else(not_found),
            "inbound_number" => self
                .inbound_numbers
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::InboundNumber)
                .ok_or_else(not_found),
            "ring_group" => self
                .ring_groups
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::RingGroup)
                .ok_or_else(not_found),
            "ivr_menu" => self
                .ivr_menus
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::IvrMenu)
                .ok_or_else(not_found),
            "time_switch" => self
                .time_switches
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::TimeSwitch)
                .ok_or_else(not_found),
            "voicemail_box" => self
                .voicemail_boxes
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::VoicemailBox)
                .ok_or_else(not_found),
            "conference" => self
                .conferences
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(Entity::Conference)
                .ok_or_else(not_found),
            other => Err(Error::EntityNotFound {
                entity_type: other.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn extension_by_number(&self, number: &str) -> Option<Extension> {
        self.extensions.iter().find(|e| e.number == number).cloned()
    }

    async fn inbound_number(&self, number: &str) -> Option<InboundNumber> {
        self.inbound_numbers
            .iter()
            .find(|e| e.number == number)
            .cloned()
    }

    async fn conference_by_number(&self, number: &str) -> Option<ConferenceBridge> {
        self.conferences.iter().find(|e| e.number == number).cloned()
    }

    async fn flow(&self, flow_id: u64) -> Result<FlowGraph> {
        self.flows
            .iter()
            .find(|(id, _)| *id == flow_id)
            .map(|(_, flow)| flow.clone())
            .ok_or_else(|| Error::EntityNotFound {
                entity_type: "flow".into(),
                id: flow_id.to_string(),
            })
    }
}
