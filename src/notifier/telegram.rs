use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::error::NotifierError;
use crate::notifier::{MessageRef, Notifier};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

pub struct TelegramNotifier {
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for TelegramNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<TelegramMessageResult>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessageResult {
    message_id: i64,
}

impl Notifier for TelegramNotifier {
    fn send_text<'a>(
        &'a self,
        token: &'a str,
        chat_id: i64,
        text: &'a str,
    ) -> BoxFuture<'a, Result<Option<MessageRef>, Report<NotifierError>>> {
        Box::pin(async move {
            let url = format!("{TELEGRAM_API_BASE}/bot{token}/sendMessage");
            let body = json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            });

            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .change_context(NotifierError::Request {
                    method: "sendMessage".into(),
                })?;

            let parsed: TelegramResponse =
                response
                    .json()
                    .await
                    .change_context(NotifierError::Request {
                        method: "sendMessage".into(),
                    })?;

            if !parsed.ok {
                error!(
                    description = ?parsed.description,
                    "telegram sendMessage returned an error"
                );
                return Ok(None);
            }

            Ok(parsed.result.map(|r| MessageRef {
                message_id: r.message_id,
            }))
        })
    }

    fn edit_media<'a>(
        &'a self,
        token: &'a str,
        chat_id: i64,
        message_ref: &'a MessageRef,
        photo_bytes: Vec<u8>,
        caption: &'a str,
    ) -> BoxFuture<'a, Result<(), Report<NotifierError>>> {
        Box::pin(async move {
            let url = format!("{TELEGRAM_API_BASE}/bot{token}/editMessageMedia");

            let media = json!({
                "type": "photo",
                "media": "attach://chart.png",
                "caption": caption,
                "parse_mode": "HTML",
            });

            let photo_part = reqwest::multipart::Part::bytes(photo_bytes)
                .file_name("chart.png")
                .mime_str("image/png")
                .change_context(NotifierError::Request {
                    method: "editMessageMedia".into(),
                })?;

            let form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.to_string())
                .text("message_id", message_ref.message_id.to_string())
                .text("media", media.to_string())
                .part("chart.png", photo_part);

            let response = self
                .client
                .post(&url)
                .multipart(form)
                .send()
                .await
                .change_context(NotifierError::Request {
                    method: "editMessageMedia".into(),
                })?;

            let parsed: TelegramResponse =
                response
                    .json()
                    .await
                    .change_context(NotifierError::Request {
                        method: "editMessageMedia".into(),
                    })?;

            if !parsed.ok {
                return Err(Report::new(NotifierError::ApiError {
                    method: "editMessageMedia".into(),
                    description: parsed.description.unwrap_or_default(),
                }));
            }

            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Report<NotifierError>>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_response_parses_ok_with_message_id() {
        let raw = r#"{"ok":true,"result":{"message_id":42}}"#;
        let parsed: TelegramResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.ok);
        assert_eq!(parsed.result.unwrap().message_id, 42);
    }

    #[test]
    fn telegram_response_parses_error() {
        let raw = r#"{"ok":false,"description":"Bad Request: chat not found"}"#;
        let parsed: TelegramResponse = serde_json::from_str(raw).unwrap();
        assert!(!parsed.ok);
        assert_eq!(
            parsed.description.as_deref(),
            Some("Bad Request: chat not found")
        );
    }
}
