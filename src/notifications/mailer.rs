use tracing::{error, info};

use super::senders::relay::RelaySender;
use super::senders::sendgrid::SendGridSender;
use super::senders::{Mail, MailSender, SenderError};
use crate::config::{MailConfig, MailProvider};

pub const TEST_EMAIL_SUBJECT: &str = "Teste de Notificação - DeltaNuvem";
pub const TEST_EMAIL_HTML: &str =
    "<h1>Teste de Email</h1><p>Este é um email de teste enviado pelo sistema DeltaNuvem.</p>";

pub struct MailService {
    sender: Box<dyn MailSender>,
}

impl MailService {
    pub fn new(sender: Box<dyn MailSender>) -> Self {
        Self { sender }
    }

    pub fn from_config(config: &MailConfig) -> Result<Self, SenderError> {
        let sender: Box<dyn MailSender> = match config.provider {
            MailProvider::Relay => {
                let base_url = config.relay_url.as_deref().ok_or_else(|| {
                    SenderError::InvalidConfiguration("mail.relay_url is not set.".to_string())
                })?;
                Box::new(RelaySender::new(base_url)?)
            }
            MailProvider::SendGrid => {
                let api_key = config.sendgrid_api_key.clone().ok_or_else(|| {
                    SenderError::InvalidConfiguration(
                        "SENDGRID_API_KEY is not configured.".to_string(),
                    )
                })?;
                Box::new(SendGridSender::new(api_key, config.from.clone())?)
            }
        };
        Ok(Self::new(sender))
    }

    pub async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError> {
        let mail = Mail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        };
        match self.sender.send(&mail).await {
            Ok(()) => {
                info!(to = %to, subject = %subject, "Mail sent.");
                Ok(())
            }
            Err(e) => {
                error!(to = %to, error = %e, "Failed to send mail.");
                Err(e)
            }
        }
    }

    pub async fn send_test_email(&self, to: &str) -> Result<(), SenderError> {
        self.send(to, TEST_EMAIL_SUBJECT, TEST_EMAIL_HTML).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        sent: Arc<Mutex<Vec<Mail>>>,
        refuse_with: Option<String>,
    }

    #[async_trait]
    impl MailSender for Recorder {
        async fn send(&self, mail: &Mail) -> Result<(), SenderError> {
            if let Some(reason) = &self.refuse_with {
                return Err(SenderError::Rejected(reason.clone()));
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_test_email_uses_fixed_message() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let service = MailService::new(Box::new(Recorder {
            sent: Arc::clone(&sent),
            refuse_with: None,
        }));
        service.send_test_email("ops@example.com").await.unwrap();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, TEST_EMAIL_SUBJECT);
        assert_eq!(sent[0].to, "ops@example.com");
    }

    #[tokio::test]
    async fn test_provider_message_is_returned_verbatim() {
        let service = MailService::new(Box::new(Recorder {
            sent: Arc::new(Mutex::new(Vec::new())),
            refuse_with: Some("quota exceeded".into()),
        }));
        let err = service.send("a@b.c", "s", "<p/>").await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn test_from_config_requires_provider_settings() {
        let config = MailConfig {
            provider: MailProvider::SendGrid,
            relay_url: None,
            sendgrid_api_key: None,
            from: "noreply@example.com".into(),
        };
        assert!(MailService::from_config(&config).is_err());

        let relay = MailConfig {
            provider: MailProvider::Relay,
            relay_url: Some("http://localhost:3000".into()),
            ..config
        };
        assert!(MailService::from_config(&relay).is_ok());
    }
}
