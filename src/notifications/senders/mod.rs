use async_trait::async_trait;
use thiserror::Error;

pub mod relay;
pub mod sendgrid;

#[derive(Error, Debug)]
pub enum SenderError {
    /// The provider refused the message; the text is the provider's own.
    #[error("{0}")]
    Rejected(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// An outbound HTML mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// A transport able to deliver a [`Mail`].
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), SenderError>;
}

/// Pulls the human-readable message out of a provider error body.
///
/// Understands the relay's `{"error": "..."}` and SendGrid's
/// `{"errors": [{"message": "..."}]}`; falls back to the raw body, then to
/// `fallback` when the body is empty.
pub fn extract_provider_error(body: &str, fallback: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
            return message.to_string();
        }
        if let Some(messages) = value.get("errors").and_then(|v| v.as_array()) {
            let joined: Vec<&str> = messages
                .iter()
                .filter_map(|entry| entry.get("message").and_then(|m| m.as_str()))
                .collect();
            if !joined.is_empty() {
                return joined.join("; ");
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_field_is_surfaced_verbatim() {
        let body = r#"{"error":"Servidor não configurado com API Key do SendGrid."}"#;
        assert_eq!(
            extract_provider_error(body, "Falha ao enviar email"),
            "Servidor não configurado com API Key do SendGrid."
        );
    }

    #[test]
    fn test_sendgrid_error_list_is_joined() {
        let body = r#"{"errors":[{"message":"bad from"},{"message":"bad to","field":"to"}]}"#;
        assert_eq!(extract_provider_error(body, "x"), "bad from; bad to");
    }

    #[test]
    fn test_non_json_and_empty_bodies() {
        assert_eq!(extract_provider_error(" gateway down \n", "x"), "gateway down");
        assert_eq!(extract_provider_error("", "Falha ao enviar email"), "Falha ao enviar email");
        assert_eq!(extract_provider_error(r#"{"details":"x"}"#, "f"), r#"{"details":"x"}"#);
    }
}
