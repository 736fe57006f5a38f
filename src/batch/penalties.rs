//! Automatic penalties for missed war attacks

use serde_json::json;
use tracing::info;

use super::{BatchRunner, BatchSummary, BulkEntry};
use crate::gamestats::WarReport;
use crate::types::{BailiffError, Result};

/// Derive one bulk entry per linked member who left attacks unused
pub fn missed_attack_entries(report: &WarReport, penalty_per_attack: f64) -> Vec<BulkEntry> {
    report
        .members
        .iter()
        .filter_map(|member| {
            let actor_id = member.member_id.as_ref()?;
            let missed = report.attacks_per_member.saturating_sub(member.attacks_used);
            if missed == 0 {
                return None;
            }
            Some(
                BulkEntry::new(actor_id, f64::from(missed) * penalty_per_attack).with_metadata(json!({
                    "clanTag": report.clan_tag,
                    "playerTag": member.player_tag,
                    "playerName": member.name,
                    "attacksUsed": member.attacks_used,
                    "attacksAllowed": report.attacks_per_member,
                    "missed": missed,
                })),
            )
        })
        .collect()
}

impl BatchRunner {
    /// Penalize missed attacks of the clan's last finished war
    pub async fn missed_attack_penalty(
        &self,
        community_id: &str,
        clan_tag: &str,
        moderator_id: &str,
    ) -> Result<BatchSummary> {
        let client = self
            .game
            .as_ref()
            .ok_or_else(|| BailiffError::Config("Game statistics API is not configured".to_string()))?;

        let report = client.current_war(clan_tag).await?;
        if !report.has_ended() {
            return Err(BailiffError::InvalidInput(format!(
                "War for {} has not ended (state: {})",
                clan_tag, report.state
            )));
        }
        if self.config.missed_attack_penalty <= 0.0 {
            return Err(BailiffError::Config("Missed attack penalty is disabled".to_string()));
        }

        let entries = missed_attack_entries(&report, self.config.missed_attack_penalty);
        let unlinked = report.members.iter().filter(|m| m.member_id.is_none()).count();
        info!(
            community_id,
            clan_tag,
            penalized = entries.len(),
            unlinked,
            "Applying missed attack penalties"
        );

        let reason = format!("Missed war attacks ({})", report.clan_tag);
        self.bulk_ledger(community_id, entries, &reason, moderator_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::fixture;
    use crate::gamestats::{GameStatsClient, WarMember};
    use crate::store::StrikeKey;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedWar(WarReport);

    #[async_trait]
    impl GameStatsClient for FixedWar {
        async fn current_war(&self, _clan_tag: &str) -> Result<WarReport> {
            Ok(self.0.clone())
        }
    }

    fn member(tag: &str, member_id: Option<&str>, attacks_used: u32) -> WarMember {
        WarMember {
            player_tag: tag.to_string(),
            name: tag.to_string(),
            member_id: member_id.map(str::to_string),
            attacks_used,
        }
    }

    fn report(state: &str) -> WarReport {
        WarReport {
            clan_tag: "#CLAN".to_string(),
            state: state.to_string(),
            attacks_per_member: 2,
            members: vec![
                member("#P1", Some("u1"), 0),
                member("#P2", Some("u2"), 1),
                member("#P3", Some("u3"), 2),
                member("#P4", None, 0),
            ],
        }
    }

    #[test]
    fn test_entries_skip_unlinked_and_complete_members() {
        let entries = missed_attack_entries(&report("warEnded"), 0.5);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].actor_id, "u1");
        assert_eq!(entries[0].delta, 1.0);
        assert_eq!(entries[1].delta, 0.5);
        assert_eq!(entries[1].metadata.as_ref().unwrap()["attacksUsed"], 1);
    }

    #[tokio::test]
    async fn test_penalty_applies_as_bulk_operation() {
        let fx = fixture();
        let runner = fx.runner.clone().with_game_stats(Arc::new(FixedWar(report("warEnded"))));

        let summary = runner.missed_attack_penalty("g1", "#CLAN", "mod").await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(runner.ledger().read_total(&StrikeKey::new("u1", "g1")).await.unwrap(), 1.0);
        assert_eq!(runner.ledger().read_total(&StrikeKey::new("u3", "g1")).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_penalty_waits_for_war_end() {
        let fx = fixture();
        let runner = fx.runner.clone().with_game_stats(Arc::new(FixedWar(report("inWar"))));
        assert!(runner.missed_attack_penalty("g1", "#CLAN", "mod").await.is_err());
    }

    #[tokio::test]
    async fn test_penalty_requires_game_client() {
        let fx = fixture();
        let result = fx.runner.missed_attack_penalty("g1", "#CLAN", "mod").await;
        assert!(matches!(result, Err(BailiffError::Config(_))));
    }
}
