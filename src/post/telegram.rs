//! Telegram Bot API poster

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{PostError, PostPayload, Poster};
use crate::error::{AkariError, Result};
use crate::text::ellipsis;

/// Environment variable consulted when no token is configured.
pub const TOKEN_ENV: &str = "AKARI_TELEGRAM_TOKEN";

const TELEGRAM_API_URL: &str = "https://api.telegram.org";
const MAX_MESSAGE_LENGTH: usize = 4096;
const MAX_CAPTION_LENGTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Falls back to `AKARI_TELEGRAM_TOKEN`
    pub token: Option<String>,
    /// Chat that timeline posts go to
    pub channel: Option<String>,
    /// Override the API base URL
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    chat: ApiChat,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

pub struct TelegramPoster {
    client: Client,
    token: String,
    channel: Option<String>,
    api_url: String,
}

impl TelegramPoster {
    pub fn new(config: TelegramConfig, timeout_secs: u64) -> Result<Self> {
        let token = match config.token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => std::env::var(TOKEN_ENV)
                .map_err(|_| AkariError::Config(format!("post.telegram.token not set and {} missing", TOKEN_ENV)))?,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AkariError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token,
            channel: config.channel,
            api_url: config.api_url.unwrap_or_else(|| TELEGRAM_API_URL.to_string()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url.trim_end_matches('/'), self.token, method)
    }

    fn target_chat(&self, payload: &PostPayload) -> std::result::Result<String, PostError> {
        payload
            .conversation
            .clone()
            .or_else(|| self.channel.clone())
            .ok_or_else(|| PostError::Fatal("no chat to post into".to_string()))
    }

    async fn send_message(&self, chat_id: &str, payload: &PostPayload) -> std::result::Result<reqwest::Response, PostError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": ellipsis(&payload.text, MAX_MESSAGE_LENGTH),
        });
        if let Some(reply_to) = payload.in_reply_to.as_ref().and_then(|id| id.parse::<i64>().ok()) {
            body["reply_to_message_id"] = json!(reply_to);
        }

        self.client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)
    }

    async fn send_document(
        &self,
        chat_id: &str,
        payload: &PostPayload,
        media: &std::path::Path,
    ) -> std::result::Result<reqwest::Response, PostError> {
        let bytes = tokio::fs::read(media)
            .await
            .map_err(|e| PostError::Fatal(format!("cannot read {}: {}", media.display(), e)))?;
        let file_name = media
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "akari.png".to_string());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", Part::bytes(bytes).file_name(file_name));
        if !payload.text.is_empty() {
            form = form.text("caption", ellipsis(&payload.text, MAX_CAPTION_LENGTH));
        }
        if let Some(reply_to) = &payload.in_reply_to {
            form = form.text("reply_to_message_id", reply_to.clone());
        }

        self.client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport)
    }
}

/// Network-level failures: timeouts and refused connections are worth
/// another try, the rest are not. The URL carries the bot token and is
/// stripped before the error is formatted.
fn classify_transport(err: reqwest::Error) -> PostError {
    let err = err.without_url();
    if err.is_timeout() || err.is_connect() {
        PostError::Overloaded(err.to_string())
    } else {
        PostError::Fatal(err.to_string())
    }
}

/// 429 and 5xx are overload; any other failure is fatal.
fn classify_status(status: u16, description: Option<String>) -> PostError {
    let message = format!("{} {}", status, description.unwrap_or_default()).trim().to_string();
    if status == 429 || status >= 500 {
        PostError::Overloaded(message)
    } else {
        PostError::Fatal(message)
    }
}

fn post_url(message: &ApiMessage) -> String {
    match &message.chat.username {
        Some(username) => format!("https://t.me/{}/{}", username, message.message_id),
        None => format!("tg://chat/{}/{}", message.chat.id, message.message_id),
    }
}

fn interpret(status: u16, body: &str) -> std::result::Result<String, PostError> {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();

    if !(200..300).contains(&status) {
        return Err(classify_status(status, parsed.and_then(|p| p.description)));
    }

    match parsed {
        Some(ApiResponse {
            ok: true,
            result: Some(message),
            ..
        }) => Ok(post_url(&message)),
        Some(ApiResponse { description, .. }) => Err(PostError::Fatal(
            description.unwrap_or_else(|| "telegram rejected the request".to_string()),
        )),
        None => Err(PostError::Fatal("unreadable telegram response".to_string())),
    }
}

#[async_trait]
impl Poster for TelegramPoster {
    async fn post(&self, payload: &PostPayload) -> std::result::Result<String, PostError> {
        let chat_id = self.target_chat(payload)?;
        let response = match &payload.media {
            Some(media) => self.send_document(&chat_id, payload, media).await?,
            None => self.send_message(&chat_id, payload).await?,
        };

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_transport)?;
        interpret(status, &body)
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poster(channel: Option<&str>) -> TelegramPoster {
        TelegramPoster::new(
            TelegramConfig {
                token: Some("123:abc".to_string()),
                channel: channel.map(String::from),
                api_url: Some("http://localhost:9/".to_string()),
            },
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_method_url() {
        assert_eq!(poster(None).method_url("sendMessage"), "http://localhost:9/bot123:abc/sendMessage");
    }

    #[test]
    fn test_target_chat_prefers_conversation() {
        let poster = poster(Some("@akari_channel"));
        let reply = PostPayload::text("hi").in_reply_to("5", Some("777".to_string()));
        assert_eq!(poster.target_chat(&reply).unwrap(), "777");
        assert_eq!(poster.target_chat(&PostPayload::text("hi")).unwrap(), "@akari_channel");
    }

    #[test]
    fn test_target_chat_missing_is_fatal() {
        let err = poster(None).target_chat(&PostPayload::text("hi")).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_transport_error_hides_token() {
        let poster = TelegramPoster::new(
            TelegramConfig {
                token: Some("4242:SECRET-token".to_string()),
                channel: Some("@akari_channel".to_string()),
                api_url: Some("http://127.0.0.1:9".to_string()),
            },
            5,
        )
        .unwrap();

        let err = poster.post(&PostPayload::text("hi")).await.unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("SECRET"), "token leaked: {}", message);
        assert!(!message.contains("/bot4242"), "url leaked: {}", message);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(429, Some("Too Many Requests".into())).is_retryable());
        assert!(classify_status(502, None).is_retryable());
        assert!(!classify_status(400, Some("Bad Request: chat not found".into())).is_retryable());
        assert!(!classify_status(401, None).is_retryable());
    }

    #[test]
    fn test_interpret_success_with_username() {
        let body = r#"{"ok": true, "result": {"message_id": 42, "chat": {"id": -100, "username": "akari"}}}"#;
        assert_eq!(interpret(200, body).unwrap(), "https://t.me/akari/42");
    }

    #[test]
    fn test_interpret_success_private_chat() {
        let body = r#"{"ok": true, "result": {"message_id": 7, "chat": {"id": 555}}}"#;
        assert_eq!(interpret(200, body).unwrap(), "tg://chat/555/7");
    }

    #[test]
    fn test_interpret_errors() {
        let overloaded = interpret(429, r#"{"ok": false, "error_code": 429, "description": "Too Many Requests"}"#);
        assert_eq!(overloaded.unwrap_err(), PostError::Overloaded("429 Too Many Requests".into()));

        let fatal = interpret(400, r#"{"ok": false, "description": "Bad Request"}"#);
        assert_eq!(fatal.unwrap_err(), PostError::Fatal("400 Bad Request".into()));

        assert!(matches!(interpret(200, "not json"), Err(PostError::Fatal(_))));
        assert!(matches!(interpret(200, r#"{"ok": false}"#), Err(PostError::Fatal(_))));
    }
}
