use log::error;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

// Plain requests; long polls add their own wait on top
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin client for the parts of the Telegram Bot API the relay needs.
#[derive(Clone)]
pub struct TelegramClient {
    token: String,
    client: Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl TelegramClient {
    pub fn with_api_url(token: String, api_url: String) -> Self {
        Self {
            token,
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    /// Sends `text` to `chat_id`, optionally with a parse mode such as `MarkdownV2`.
    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            payload["parse_mode"] = serde_json::Value::from(mode);
        }

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!("Telegram API error for chat {}: {} - {}", chat_id, status, text);
            return Err(anyhow::anyhow!("Telegram API error: {}", status));
        }

        Ok(())
    }

    /// Long-polls for updates newer than `offset`, waiting up to `wait` for one to arrive.
    pub async fn get_updates(&self, offset: i64, wait: Duration) -> anyhow::Result<Vec<Update>> {
        let payload = serde_json::json!({
            "offset": offset,
            "timeout": wait.as_secs(),
            "allowed_updates": ["message"],
        });

        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .timeout(REQUEST_TIMEOUT + wait)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid getUpdates response ({}): {}", status, e))?;

        if !body.ok {
            return Err(anyhow::anyhow!(
                "Telegram getUpdates failed: {}",
                body.description.unwrap_or_else(|| status.to_string())
            ));
        }

        Ok(body.result.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_send_message_with_parse_mode() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTEST_TOKEN/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": "42",
                "text": "hi",
                "parse_mode": "MarkdownV2",
            })))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url("TEST_TOKEN".to_string(), server.url());
        let result = client.send_message("42", "hi", Some("MarkdownV2")).await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_message_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTEST_TOKEN/sendMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: can't parse entities"}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url("TEST_TOKEN".to_string(), server.url());
        let result = client.send_message("42", "oops.", Some("MarkdownV2")).await;

        assert!(result.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_updates() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTEST_TOKEN/getUpdates")
            .match_body(Matcher::PartialJson(serde_json::json!({ "offset": 10 })))
            .with_status(200)
            .with_body(
                r#"{"ok":true,"result":[
                    {"update_id":10,"message":{"chat":{"id":42},"text":"/on"}},
                    {"update_id":11,"edited_message":{"chat":{"id":42},"text":"/off"}}
                ]}"#,
            )
            .create_async()
            .await;

        let client = TelegramClient::with_api_url("TEST_TOKEN".to_string(), server.url());
        let updates = client.get_updates(10, Duration::from_secs(0)).await.unwrap();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id, 10);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 42);
        assert_eq!(message.text.as_deref(), Some("/on"));
        assert!(updates[1].message.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_updates_not_ok() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/botTEST_TOKEN/getUpdates")
            .with_status(401)
            .with_body(r#"{"ok":false,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url("TEST_TOKEN".to_string(), server.url());
        let err = client
            .get_updates(0, Duration::from_secs(0))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Unauthorized"));
    }
}
