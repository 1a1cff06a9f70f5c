//! Voicemail persistence, MWI notification and email

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{header::ContentType, Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as Email, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowpbx_sip_core::{random_token, Address, HeaderName, Method, Request, Uri};
use flowpbx_registrar_core::BindingStore;
use flowpbx_sip_transport::TransportManager;

use crate::config::Config;
use crate::error::Result;
use crate::resolver::VoicemailBox;

/// Stored metadata for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicemailMessage {
    pub mailbox_id: u64,
    pub caller_id_name: String,
    pub caller_id_num: String,
    pub received_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub file: PathBuf,
}

/// Message counts for MWI.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCounts {
    pub new: usize,
    pub old: usize,
}

/// Repository-owned persistence for voicemail metadata.
#[async_trait]
pub trait VoicemailSink: Send + Sync {
    async fn store(&self, message: &VoicemailMessage) -> anyhow::Result<()>;
    async fn message_count(&self, mailbox_id: u64) -> usize;
    async fn counts(&self, mailbox_id: u64) -> MessageCounts;
}

/// Default sink: metadata JSON lines next to the audio files.
pub struct JsonlVoicemailSink {
    dir: PathBuf,
}

impl JsonlVoicemailSink {
    pub fn new(data_dir: &Path) -> Self {
        JsonlVoicemailSink {
            dir: data_dir.join("voicemail"),
        }
    }

    fn index_file(&self, mailbox_id: u64) -> PathBuf {
        self.dir.join(format!("box_{mailbox_id}/messages.jsonl"))
    }

    async fn read_all(&self, mailbox_id: u64) -> Vec<VoicemailMessage> {
        match tokio::fs::read_to_string(self.index_file(mailbox_id)).await {
            Ok(text) => text
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl VoicemailSink for JsonlVoicemailSink {
    async fn store(&self, message: &VoicemailMessage) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let index = self.index_file(message.mailbox_id);
        if let Some(parent) = index.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(index)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn message_count(&self, mailbox_id: u64) -> usize {
        self.read_all(mailbox_id).await.len()
    }

    async fn counts(&self, mailbox_id: u64) -> MessageCounts {
        // Without listen-state tracking every stored message counts as new.
        MessageCounts {
            new: self.read_all(mailbox_id).await.len(),
            old: 0,
        }
    }
}

/// Audio file path for a new message.
pub fn message_path(config: &Config, mailbox_id: u64) -> PathBuf {
    config
        .voicemail_dir()
        .join(format!("box_{mailbox_id}/msg_{}.wav", Utc::now().timestamp_millis()))
}

/// Greeting to play for a box: the custom file when configured and
/// present, else the system default prompt.
pub async fn greeting_path(config: &Config, mailbox: &VoicemailBox) -> Option<PathBuf> {
    if mailbox.greeting_type == "custom" {
        let custom = config.greetings_dir().join(format!("box_{}.wav", mailbox.id));
        if tokio::fs::try_exists(&custom).await.unwrap_or(false) {
            return Some(custom);
        }
        debug!(mailbox = mailbox.id, "custom greeting missing, using default");
    }
    let default = config.system_prompts_dir().join("vm-greeting.wav");
    tokio::fs::try_exists(&default)
        .await
        .unwrap_or(false)
        .then_some(default)
}

/// Send a message-summary NOTIFY to every current binding of the notify
/// extension.
pub async fn send_mwi(
    transports: &TransportManager,
    bindings: &BindingStore,
    contact: &Address,
    extension: &str,
    counts: MessageCounts,
) {
    let body = format!(
        "Messages-Waiting: {}\r\nVoice-Message: {}/{} (0/0)\r\n",
        if counts.new > 0 { "yes" } else { "no" },
        counts.new,
        counts.old
    );
    for binding in bindings.lookup(extension) {
        let mut notify = Request::new(Method::Notify, binding.contact_uri.clone());
        notify.headers.push(
            HeaderName::Via,
            format!(
                "SIP/2.0/UDP {};branch={}{}",
                contact.uri.host_port(),
                flowpbx_sip_core::types::headers::Via::BRANCH_COOKIE,
                random_token(12)
            ),
        );
        notify.headers.push(HeaderName::MaxForwards, "70");
        let mut from = Address::new(Uri::sip(extension, contact.uri.host.clone()));
        from.set_tag(random_token(8));
        notify.headers.push(HeaderName::From, from.to_string());
        notify.headers.push(
            HeaderName::To,
            Address::new(Uri::sip(extension, contact.uri.host.clone())).to_string(),
        );
        notify
            .headers
            .push(HeaderName::CallId, format!("mwi-{}", random_token(16)));
        notify.headers.push(HeaderName::CSeq, "1 NOTIFY");
        notify.headers.push(HeaderName::Event, "message-summary");
        notify
            .headers
            .push(HeaderName::SubscriptionState, "active");
        notify.headers.push(HeaderName::Contact, contact.to_string());
        let notify = notify.with_body("application/simple-message-summary", body.clone());

        if let Err(err) = transports.send_udp(&notify.into(), binding.source).await {
            warn!(extension, %err, "MWI NOTIFY failed");
        } else {
            debug!(extension, new = counts.new, "MWI NOTIFY sent");
        }
    }
}

/// SMTP notifier for new voicemail.
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl Mailer {
    /// Build from configuration; `None` when SMTP is not configured.
    pub fn from_config(config: &Config) -> Option<Mailer> {
        let host = config.smtp_host.as_deref()?;
        let from = config.smtp_from.clone()?;

        let mut builder = if config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).ok()?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        builder = builder.port(config.smtp_port);
        if let (Some(user), Some(password)) =
            (config.smtp_username.clone(), config.smtp_password.clone())
        {
            builder = builder.credentials(Credentials::new(user, password));
        }
        Some(Mailer {
            transport: builder.build(),
            from,
        })
    }

    /// Send the new-message notification, optionally attaching the WAV.
    pub async fn send_voicemail_notification(
        &self,
        to: &str,
        mailbox_name: &str,
        message: &VoicemailMessage,
        attach_audio: bool,
    ) -> Result<()> {
        let subject = format!(
            "New voicemail for {mailbox_name} from {}",
            if message.caller_id_num.is_empty() {
                "unknown"
            } else {
                &message.caller_id_num
            }
        );
        let text = format!(
            "Mailbox: {mailbox_name}\nFrom: {} <{}>\nReceived: {}\nDuration: {}s\n",
            message.caller_id_name,
            message.caller_id_num,
            message.received_at.to_rfc2822(),
            message.duration_secs
        );

        let builder = Email::builder()
            .from(self.from.parse().map_err(|e| {
                crate::error::Error::Other(format!("bad smtp_from address: {e}"))
            })?)
            .to(to
                .parse()
                .map_err(|e| crate::error::Error::Other(format!("bad recipient: {e}")))?)
            .subject(subject);

        let email = if attach_audio {
            let audio = tokio::fs::read(&message.file).await?;
            let attachment = Attachment::new(
                message
                    .file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "voicemail.wav".into()),
            )
            .body(audio, "audio/wav".parse::<ContentType>().expect("static mime"));
            builder
                .multipart(
                    MultiPart::mixed()
                        .singlepart(SinglePart::plain(text))
                        .singlepart(attachment),
                )
                .map_err(|e| crate::error::Error::Other(e.to_string()))?
        } else {
            builder
                .body(text)
                .map_err(|e| crate::error::Error::Other(e.to_string()))?
        };

        self.transport
            .send(email)
            .await
            .map_err(|e| crate::error::Error::Other(format!("smtp send failed: {e}")))?;
        info!(mailbox = message.mailbox_id, to, "voicemail email sent");
        Ok(())
    }
}

/// Notify all the configured channels about a stored message.
pub async fn notify_new_message(
    config: &Config,
    transports: &TransportManager,
    bindings: &BindingStore,
    contact: &Address,
    sink: &Arc<dyn VoicemailSink>,
    mailer: Option<&Mailer>,
    mailbox: &VoicemailBox,
    message: &VoicemailMessage,
) {
    if let Some(extension) = &mailbox.notify_extension {
        let counts = sink.counts(mailbox.id).await;
        send_mwi(transports, bindings, contact, extension, counts).await;
    }
    if let (Some(mailer), Some(email)) = (mailer, &mailbox.email) {
        if config.smtp_configured() {
            if let Err(err) = mailer
                .send_voicemail_notification(email, &mailbox.name, message, mailbox.email_attach_audio)
                .await
            {
                warn!(mailbox = mailbox.id, %err, "voicemail email failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(greeting_type: &str) -> VoicemailBox {
        VoicemailBox {
            id: 5,
            name: "main".into(),
            max_messages: 3,
            max_message_secs: 180,
            greeting_type: greeting_type.into(),
            notify_extension: None,
            email: None,
            email_attach_audio: false,
        }
    }

    #[tokio::test]
    async fn sink_counts_and_caps() {
        let dir = std::env::temp_dir().join(format!("flowpbx-vm-{}", uuid::Uuid::new_v4()));
        let sink = JsonlVoicemailSink::new(&dir);
        assert_eq!(sink.message_count(5).await, 0);

        for i in 0..3 {
            sink.store(&VoicemailMessage {
                mailbox_id: 5,
                caller_id_name: "A".into(),
                caller_id_num: format!("040000000{i}"),
                received_at: Utc::now(),
                duration_secs: 10,
                file: dir.join(format!("voicemail/box_5/msg_{i}.wav")),
            })
            .await
            .unwrap();
        }
        assert_eq!(sink.message_count(5).await, 3);
        assert_eq!(sink.counts(5).await.new, 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn custom_greeting_falls_back_when_missing() {
        let mut config = Config::default();
        config.data_dir = std::env::temp_dir().join(format!("flowpbx-gr-{}", uuid::Uuid::new_v4()));
        // Neither custom nor default exists.
        assert_eq!(greeting_path(&config, &mailbox("custom")).await, None);

        // Custom present wins.
        let custom = config.greetings_dir().join("box_5.wav");
        std::fs::create_dir_all(custom.parent().unwrap()).unwrap();
        std::fs::write(&custom, flowpbx_media_core::wav::encode(&[0i16; 160])).unwrap();
        assert_eq!(
            greeting_path(&config, &mailbox("custom")).await,
            Some(custom)
        );
        std::fs::remove_dir_all(&config.data_dir).unwrap();
    }

    #[test]
    fn message_path_layout() {
        let config = Config::default();
        let path = message_path(&config, 9);
        let text = path.to_string_lossy();
        assert!(text.contains("voicemail/box_9/msg_"));
        assert!(text.ends_with(".wav"));
    }
}
