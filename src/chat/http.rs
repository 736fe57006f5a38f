//! HTTP client for the chat platform bot bridge

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use urlencoding::encode;

use super::{Messenger, Reply};
use crate::roles::RoleGateway;
use crate::types::{BailiffError, Result};

#[derive(Debug, Deserialize)]
struct SentResponse {
    id: String,
}

/// Messenger and role gateway backed by the bridge's REST API
pub struct HttpChatGateway {
    base_url: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpChatGateway {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("bailiff/0.1")
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .http_client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BailiffError::Chat(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BailiffError::Chat(format!("{} returned {}", what, status)));
        }
        Ok(response)
    }

    fn member_label_path(community_id: &str, actor_id: &str, label: &str) -> String {
        format!(
            "/communities/{}/members/{}/labels/{}",
            encode(community_id),
            encode(actor_id),
            encode(label)
        )
    }
}

#[async_trait]
impl Messenger for HttpChatGateway {
    async fn send(&self, channel_id: &str, reply: &Reply) -> Result<String> {
        let path = format!("/channels/{}/messages", encode(channel_id));
        let response = self
            .execute(self.request(Method::POST, &path).json(reply), "Send message")
            .await?;

        let sent: SentResponse = response
            .json()
            .await
            .map_err(|e| BailiffError::Chat(format!("Invalid send response: {}", e)))?;
        debug!(channel_id, message_id = %sent.id, "Message sent");
        Ok(sent.id)
    }
}

#[async_trait]
impl RoleGateway for HttpChatGateway {
    async fn member_labels(&self, community_id: &str, actor_id: &str) -> Result<Vec<String>> {
        let path = format!(
            "/communities/{}/members/{}/labels",
            encode(community_id),
            encode(actor_id)
        );
        let response = self
            .execute(self.request(Method::GET, &path), "List member labels")
            .await?;

        response
            .json()
            .await
            .map_err(|e| BailiffError::Chat(format!("Invalid label list: {}", e)))
    }

    async fn ensure_label(&self, community_id: &str, label: &str) -> Result<()> {
        let path = format!("/communities/{}/labels/{}", encode(community_id), encode(label));
        self.execute(self.request(Method::PUT, &path), "Ensure label")
            .await?;
        Ok(())
    }

    async fn add_label(&self, community_id: &str, actor_id: &str, label: &str) -> Result<()> {
        let path = Self::member_label_path(community_id, actor_id, label);
        self.execute(self.request(Method::PUT, &path), "Add label")
            .await?;
        Ok(())
    }

    async fn remove_label(&self, community_id: &str, actor_id: &str, label: &str) -> Result<()> {
        let path = Self::member_label_path(community_id, actor_id, label);
        self.execute(self.request(Method::DELETE, &path), "Remove label")
            .await?;
        Ok(())
    }
}
