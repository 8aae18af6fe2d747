//! Minimal Telegram Bot API client.
//!
//! Just the four calls the bot needs, spoken directly over HTTPS:
//! `getMe`, long-polling `getUpdates`, `sendMessage` (as a reply), and
//! `sendDocument` (multipart upload). No webhook support, no retries —
//! the poll loop simply logs a failed cycle and polls again.

use std::path::Path;

use serde::Deserialize;
use serde_json::json;

use crate::{Error, Result};

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_S: u64 = 50;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// One incoming update.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// The `getUpdates` offset that acknowledges everything in `updates`.
pub fn next_offset(updates: &[Update], current: i64) -> i64 {
    updates
        .iter()
        .map(|u| u.update_id + 1)
        .max()
        .unwrap_or(current)
}

/// Bot API client bound to one token.
pub struct Bot {
    http: reqwest::Client,
    base: String,
}

impl Bot {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{token}"),
        }
    }

    /// Verify the token by asking who we are. Returns the bot username.
    pub async fn get_me(&self) -> Result<String> {
        #[derive(Debug, Deserialize)]
        struct Me {
            username: Option<String>,
        }
        let me: Me = self.call("getMe", &json!({})).await?;
        Ok(me.username.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Long-poll for updates past `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_S,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    /// Reply to a message with text.
    pub async fn reply(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<()> {
        let _: Message = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_to_message_id": reply_to,
                }),
            )
            .await?;
        Ok(())
    }

    /// Upload a file as a document.
    pub async fn send_document(&self, chat_id: i64, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let bytes = tokio::fs::read(path).await?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let response = self
            .http
            .post(format!("{}/sendDocument", self.base))
            .multipart(form)
            .send()
            .await?;
        let body: ApiResponse<Message> = response.json().await?;
        if !body.ok {
            return Err(Error::Telegram(
                body.description
                    .unwrap_or_else(|| "sendDocument failed".to_string()),
            ));
        }
        Ok(())
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(payload)
            .send()
            .await?;
        let body: ApiResponse<T> = response.json().await?;
        if !body.ok {
            return Err(Error::Telegram(
                body.description
                    .unwrap_or_else(|| format!("{method} failed")),
            ));
        }
        body.result
            .ok_or_else(|| Error::Telegram(format!("{method} returned no result")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_parsing() {
        let raw = r#"{
            "ok": true,
            "result": [
                {"update_id": 7, "message": {"message_id": 1, "chat": {"id": 42}, "text": "/start"}},
                {"update_id": 8, "message": {"message_id": 2, "chat": {"id": 42}, "text": "lofi beats"}},
                {"update_id": 9, "message": null}
            ]
        }"#;
        let parsed: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        assert!(parsed.ok);
        let updates = parsed.result.unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].message.as_ref().unwrap().text.as_deref(), Some("/start"));
        assert_eq!(updates[1].message.as_ref().unwrap().chat.id, 42);
        assert!(updates[2].message.is_none());
    }

    #[test]
    fn test_error_response_parsing() {
        let raw = r#"{"ok": false, "description": "Unauthorized", "result": null}"#;
        let parsed: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn test_next_offset_advances_past_highest() {
        let updates = vec![
            Update {
                update_id: 4,
                message: None,
            },
            Update {
                update_id: 9,
                message: None,
            },
        ];
        assert_eq!(next_offset(&updates, 3), 10);
        assert_eq!(next_offset(&[], 3), 3);
    }
}
