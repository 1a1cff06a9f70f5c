//! Push gateway client
//!
//! When an INVITE targets an extension with no live binding but a stored
//! push token, the PBX wakes the mobile client through the gateway and
//! holds the caller in ringing while the phone races to re-REGISTER.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct WakeRequest<'a> {
    license_key: &'a str,
    push_token: &'a str,
    push_platform: &'a str,
    caller_id_name: &'a str,
    caller_id_num: &'a str,
    call_id: &'a str,
}

/// Outbound HTTPS client for the push gateway.
#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
    gateway_url: String,
    license_key: String,
}

impl PushClient {
    pub fn new(gateway_url: impl Into<String>, license_key: impl Into<String>) -> PushClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(4))
            .build()
            .unwrap_or_default();
        PushClient {
            http,
            gateway_url: gateway_url.into(),
            license_key: license_key.into(),
        }
    }

    /// Fire a wake-up for one device token. Best-effort: failures are
    /// logged and the caller proceeds to the no-binding branch.
    #[allow(clippy::too_many_arguments)]
    pub async fn wake(
        &self,
        push_token: &str,
        push_platform: &str,
        caller_id_name: &str,
        caller_id_num: &str,
        call_id: &str,
    ) {
        let body = WakeRequest {
            license_key: &self.license_key,
            push_token,
            push_platform,
            caller_id_name,
            caller_id_num,
            call_id,
        };
        match self.http.post(&self.gateway_url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(call_id, "push wake-up accepted");
            }
            Ok(response) => {
                warn!(call_id, status = %response.status(), "push gateway refused wake-up");
            }
            Err(err) => {
                warn!(call_id, %err, "push gateway unreachable");
            }
        }
    }
}
