use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{extract_provider_error, Mail, MailSender, SenderError};

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

/// Delivers straight through the SendGrid v3 API.
pub struct SendGridSender {
    client: Client,
    api_key: String,
    from: String,
}

impl SendGridSender {
    pub fn new(api_key: String, from: String) -> Result<Self, SenderError> {
        if api_key.trim().is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "SendGrid API key is not configured.".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            api_key,
            from,
        })
    }
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: [Address<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct SendGridPayload<'a> {
    personalizations: [Personalization<'a>; 1],
    from: Address<'a>,
    subject: &'a str,
    content: [Content<'a>; 1],
}

impl<'a> SendGridPayload<'a> {
    fn from_mail(mail: &'a Mail, from: &'a str) -> Self {
        Self {
            personalizations: [Personalization {
                to: [Address { email: &mail.to }],
            }],
            from: Address { email: from },
            subject: &mail.subject,
            content: [Content {
                kind: "text/html",
                value: &mail.html,
            }],
        }
    }
}

#[async_trait]
impl MailSender for SendGridSender {
    async fn send(&self, mail: &Mail) -> Result<(), SenderError> {
        let payload = SendGridPayload::from_mail(mail, &self.from);
        let response = self
            .client
            .post(SENDGRID_SEND_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SenderError::Rejected(extract_provider_error(
                &error_body,
                &format!("SendGrid returned {status}"),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let mail = Mail {
            to: "ops@example.com".into(),
            subject: "Teste".into(),
            html: "<p>oi</p>".into(),
        };
        let value = serde_json::to_value(SendGridPayload::from_mail(&mail, "noreply@example.com")).unwrap();
        assert_eq!(value["personalizations"][0]["to"][0]["email"], "ops@example.com");
        assert_eq!(value["from"]["email"], "noreply@example.com");
        assert_eq!(value["content"][0]["type"], "text/html");
    }

    #[test]
    fn test_missing_key_is_rejected() {
        assert!(SendGridSender::new("  ".into(), "a@b.c".into()).is_err());
    }
}
