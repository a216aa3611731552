use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{extract_provider_error, Mail, MailSender, SenderError};

pub const RELAY_PATH: &str = "/api/send-email";

/// Posts mails to the application's own HTTP mail relay.
pub struct RelaySender {
    client: Client,
    endpoint: String,
}

impl RelaySender {
    pub fn new(base_url: &str) -> Result<Self, SenderError> {
        let base = base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(SenderError::InvalidConfiguration(format!(
                "Relay URL must be http(s): {base_url}"
            )));
        }
        Ok(Self {
            client: Client::new(),
            endpoint: format!("{base}{RELAY_PATH}"),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[async_trait]
impl MailSender for RelaySender {
    async fn send(&self, mail: &Mail) -> Result<(), SenderError> {
        let payload = RelayPayload {
            to: &mail.to,
            subject: &mail.subject,
            html: &mail.html,
        };
        let response = self.client.post(&self.endpoint).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SenderError::Rejected(extract_provider_error(
                &error_body,
                "Falha ao enviar email",
            )));
        }

        Ok(())
    }
}
