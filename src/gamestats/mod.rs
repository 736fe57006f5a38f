//! Game statistics API client
//!
//! The upstream API enforces a strict global rate limit, so every call in
//! the process goes through one shared [`RateGate`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::types::{BailiffError, Result};

/// Global minimum-interval gate.
///
/// The lock is held across the wait, so concurrent callers queue up and
/// leave the gate one interval apart.
pub struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until a call is allowed and reserve the slot
    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let ready_at = last + self.min_interval;
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Rate gate wait");
                sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// One participant of a war
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarMember {
    pub player_tag: String,
    pub name: String,

    /// Linked chat member id, if the player has linked an account
    #[serde(default)]
    pub member_id: Option<String>,

    #[serde(default)]
    pub attacks_used: u32,
}

/// Current war of a clan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarReport {
    pub clan_tag: String,

    /// `preparation`, `inWar`, `warEnded` or `notInWar`
    pub state: String,

    pub attacks_per_member: u32,

    #[serde(default)]
    pub members: Vec<WarMember>,
}

impl WarReport {
    pub fn has_ended(&self) -> bool {
        self.state == "warEnded"
    }
}

#[async_trait]
pub trait GameStatsClient: Send + Sync {
    async fn current_war(&self, clan_tag: &str) -> Result<WarReport>;
}

/// HTTP client for the game statistics API
pub struct HttpGameStatsClient {
    base_url: String,
    token: Option<String>,
    gate: RateGate,
    http_client: reqwest::Client,
}

impl HttpGameStatsClient {
    pub fn new(base_url: &str, token: Option<String>, min_interval: Duration, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("bailiff/0.1")
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            gate: RateGate::new(min_interval),
            http_client,
        }
    }
}

#[async_trait]
impl GameStatsClient for HttpGameStatsClient {
    async fn current_war(&self, clan_tag: &str) -> Result<WarReport> {
        let url = format!(
            "{}/clans/{}/currentwar",
            self.base_url,
            urlencoding::encode(clan_tag)
        );

        self.gate.acquire().await;
        debug!(clan_tag, url = %url, "Fetching current war");

        let mut request = self.http_client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BailiffError::GameApi(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BailiffError::NotFound(format!("Clan {}", clan_tag)));
        }
        if !status.is_success() {
            return Err(BailiffError::GameApi(format!(
                "Current war for {} returned {}",
                clan_tag, status
            )));
        }

        response
            .json::<WarReport>()
            .await
            .map_err(|e| BailiffError::GameApi(format!("Invalid war response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_rate_gate_spaces_calls() {
        let gate = Arc::new(RateGate::new(Duration::from_millis(1000)));
        let start = Instant::now();

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut times = Vec::new();
        for call in calls {
            times.push(call.await.unwrap() - start);
        }
        times.sort();
        assert_eq!(times[0], Duration::ZERO);
        assert!(times[1] >= Duration::from_millis(1000));
        assert!(times[2] >= Duration::from_millis(2000));
    }

    #[test]
    fn test_war_report_parses_bridge_payload() {
        let report: WarReport = serde_json::from_value(serde_json::json!({
            "clanTag": "#ABC",
            "state": "warEnded",
            "attacksPerMember": 2,
            "members": [
                { "playerTag": "#P1", "name": "one", "memberId": "u1", "attacksUsed": 1 },
                { "playerTag": "#P2", "name": "two" }
            ]
        }))
        .unwrap();

        assert!(report.has_ended());
        assert_eq!(report.members[1].member_id, None);
        assert_eq!(report.members[1].attacks_used, 0);
    }
}
