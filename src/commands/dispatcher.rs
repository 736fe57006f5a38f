//! Command dispatcher
//!
//! Glue between inbound chat events and the core: every message command
//! goes through the dispatch guard, destructive mutations through a
//! confirmation flow, and batch commands through the batch runner.
//!
//! Confirmation and batch work runs in spawned tasks. The command handler
//! itself only posts the prompt and returns, so the in-flight marker is not
//! held while a moderator decides.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{parse, Command, DispatchConfig, ViolationCategory};
use crate::batch::BatchRunner;
use crate::chat::{Actor, ChatEvent, MessageEvent, Messenger, ReactionEvent, Reply};
use crate::confirm::registry::{APPROVE_EMOJI, CANCEL_EMOJI};
use crate::confirm::{
    only, ConfirmationFlow, ConfirmationOutcome, DecisionAck, PromptRegistry, ProposedMutation,
    Reaction, Selection, SelectionFlow,
};
use crate::guard::{CommandKey, DispatchGuard, DispatchOutcome};
use crate::ledger::StrikeLedger;
use crate::recovery::OperationStatusView;
use crate::roles::RoleSynchronizer;
use crate::store::StrikeKey;
use crate::types::{BailiffError, Result};

/// What the dispatcher did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Not a command, or a reaction on a message that is not a prompt
    Ignored,
    Replied,
    /// A prompt was posted; its flow runs in the background
    Prompted { prompt_id: String },
    /// A batch operation was started in the background
    Started { task_id: String },
    Reaction(DecisionAck),
}

/// Routes chat events to command handlers
#[derive(Clone)]
pub struct Dispatcher {
    guard: Arc<DispatchGuard>,
    ledger: StrikeLedger,
    roles: RoleSynchronizer,
    batch: Arc<BatchRunner>,
    messenger: Arc<dyn Messenger>,
    prompts: Arc<PromptRegistry>,
    config: Arc<DispatchConfig>,
    background: Arc<DashMap<String, JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        guard: Arc<DispatchGuard>,
        batch: Arc<BatchRunner>,
        messenger: Arc<dyn Messenger>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            guard,
            ledger: batch.ledger().clone(),
            roles: batch.roles().clone(),
            batch,
            messenger,
            prompts: Arc::new(PromptRegistry::new()),
            config: Arc::new(config),
            background: Arc::new(DashMap::new()),
        }
    }

    pub fn prompts(&self) -> &Arc<PromptRegistry> {
        &self.prompts
    }

    /// Handle one inbound event. Never returns an error.
    pub async fn handle(&self, event: ChatEvent) -> DispatchOutcome<Handled> {
        match event {
            ChatEvent::Message(message) => self.handle_message(message).await,
            ChatEvent::Reaction(reaction) => self.handle_reaction(reaction),
        }
    }

    /// Wait for a background flow or batch started by `handle`
    pub async fn join_flow(&self, id: &str) -> bool {
        match self.background.remove(id) {
            Some((_, handle)) => handle.await.is_ok(),
            None => false,
        }
    }

    async fn handle_message(&self, message: MessageEvent) -> DispatchOutcome<Handled> {
        let command = match parse(&self.config.prefix, &message.content) {
            None => return DispatchOutcome::Completed(Handled::Ignored),
            Some(Ok(command)) => command,
            Some(Err(usage)) => {
                if self.guard.admit_event(&message.event_id).is_err() {
                    return DispatchOutcome::Completed(Handled::Ignored);
                }
                self.reply(&message.channel_id, Reply::text(usage)).await;
                return DispatchOutcome::Completed(Handled::Replied);
            }
        };

        let key = CommandKey::new(&message.author.id, command.name());
        let channel_id = message.channel_id.clone();
        let outcome = self
            .guard
            .run(&message.event_id, key, self.execute(&message, command))
            .await;

        if let DispatchOutcome::Failed(reason) = &outcome {
            self.reply(&channel_id, Reply::text(format!("⚠️ Command failed: {}", reason)))
                .await;
        }
        outcome
    }

    fn handle_reaction(&self, reaction: ReactionEvent) -> DispatchOutcome<Handled> {
        if let Err(rejection) = self.guard.admit_event(&reaction.event_id) {
            return DispatchOutcome::Rejected(rejection);
        }
        let handled = match self
            .prompts
            .route(&reaction.message_id, &reaction.actor, &reaction.emoji)
        {
            Some(ack) => Handled::Reaction(ack),
            None => Handled::Ignored,
        };
        DispatchOutcome::Completed(handled)
    }

    async fn execute(&self, message: &MessageEvent, command: Command) -> Result<Handled> {
        let author = &message.author;
        if command.requires_moderator() && !author.is_moderator {
            self.reply(
                &message.channel_id,
                Reply::text("You need moderator permissions for that command."),
            )
            .await;
            return Ok(Handled::Replied);
        }

        let community_id = message.community_id.as_str();
        let channel_id = message.channel_id.as_str();

        match command {
            Command::Strike {
                target,
                amount: Some(amount),
                reason,
            } => {
                let reason = reason.unwrap_or_else(|| "No reason given".to_string());
                let mutation = StrikeRequest {
                    community_id: community_id.to_string(),
                    channel_id: channel_id.to_string(),
                    target,
                    delta: amount,
                    reason,
                };
                self.propose_strike(author, mutation).await
            }
            Command::Strike {
                target,
                amount: None,
                reason,
            } => self.select_category(message, target, reason).await,
            Command::Unstrike {
                target,
                amount,
                reason,
            } => {
                let mutation = StrikeRequest {
                    community_id: community_id.to_string(),
                    channel_id: channel_id.to_string(),
                    target,
                    delta: -amount,
                    reason: reason.unwrap_or_else(|| "Strike removed".to_string()),
                };
                self.propose_strike(author, mutation).await
            }
            Command::Warn { target, reason } => {
                let key = StrikeKey::new(&target, community_id);
                self.ledger.warn(&key, &reason, &author.id).await?;
                self.reply(channel_id, Reply::text(format!("<@{}> has been warned: {}", target, reason)))
                    .await;
                Ok(Handled::Replied)
            }
            Command::Strikes { target } => {
                let target = target.unwrap_or_else(|| author.id.clone());
                if target != author.id && !author.is_moderator {
                    self.reply(channel_id, Reply::text("You can only view your own strikes."))
                        .await;
                    return Ok(Handled::Replied);
                }
                let body = self.describe_record(community_id, &target).await?;
                self.reply(channel_id, Reply::text(body)).await;
                Ok(Handled::Replied)
            }
            Command::SeasonReset { amount } => {
                let proposal = ProposedMutation::new(
                    "Season reset",
                    format!("Remove {} strike(s) from every member with strikes.", amount),
                );
                let batch = self.batch.clone();
                let community = community_id.to_string();
                let reason = format!("Season reset (-{})", amount);
                self.propose(author, channel_id, proposal, move |approver| async move {
                    let summary = batch
                        .mass_reduction(&community, amount, &reason, &approver)
                        .await?;
                    Ok::<_, BailiffError>(format!(
                        "Season reset done: {} member(s) reduced by {}.",
                        summary.processed, amount
                    ))
                })
                .await
            }
            Command::WarPenalty { clan_tag } => {
                let proposal = ProposedMutation::new(
                    "War penalty",
                    format!("Apply missed-attack strikes from the last war of {}.", clan_tag),
                );
                let batch = self.batch.clone();
                let community = community_id.to_string();
                self.propose(author, channel_id, proposal, move |approver| async move {
                    let summary = batch
                        .missed_attack_penalty(&community, &clan_tag, &approver)
                        .await?;
                    Ok::<_, BailiffError>(format!(
                        "War penalty applied to {} member(s) of {}.",
                        summary.processed, clan_tag
                    ))
                })
                .await
            }
            Command::Decay => {
                let batch = self.batch.clone();
                let community = community_id.to_string();
                let moderator = author.id.clone();
                self.start_batch(channel_id, "Strike decay", async move {
                    let summary = batch.scheduled_decay(&community, &moderator).await?;
                    Ok::<_, BailiffError>(format!("Strike decay done: {} member(s) decayed.", summary.processed))
                })
                .await
            }
            Command::Resync => {
                let batch = self.batch.clone();
                let community = community_id.to_string();
                let moderator = author.id.clone();
                self.start_batch(channel_id, "Role resync", async move {
                    let summary = batch.role_resync(&community, &moderator).await?;
                    Ok::<_, BailiffError>(format!(
                        "Role resync done: {} member(s) synced, {} label failure(s).",
                        summary.processed, summary.role_failures
                    ))
                })
                .await
            }
            Command::OpStatus { operation } => {
                let status = self
                    .batch
                    .recovery()
                    .get_operation_status(community_id, operation)
                    .await?;
                let body = match status {
                    OperationStatusView::Active(record) => format!(
                        "{} is running (started by <@{}>, {} recovery attempt(s)).",
                        operation, record.metadata.initiated_by, record.recovery_attempts
                    ),
                    OperationStatusView::Completed(done) => format!(
                        "{} last completed{} (started by <@{}>).",
                        operation,
                        if done.recovered { " after recovery" } else { "" },
                        done.metadata.initiated_by
                    ),
                    OperationStatusView::Unknown => format!("{} has never run here.", operation),
                };
                self.reply(channel_id, Reply::text(body)).await;
                Ok(Handled::Replied)
            }
        }
    }

    async fn describe_record(&self, community_id: &str, actor_id: &str) -> Result<String> {
        let key = StrikeKey::new(actor_id, community_id);
        let Some(record) = self.ledger.record(&key).await? else {
            return Ok(format!("<@{}> has no strikes.", actor_id));
        };

        let mut body = format!(
            "<@{}> has {} strike(s) (tier: {}), {} warning(s).",
            actor_id,
            record.strikes,
            self.roles.tier_for(record.strikes),
            record.warnings.len()
        );
        for event in record.history.iter().rev().take(5) {
            body.push_str(&format!("\n{:+} {} (<@{}>)", event.delta, event.reason, event.moderator_id));
        }
        Ok(body)
    }

    /// Post a confirmation prompt for a single-member mutation
    async fn propose_strike(&self, author: &Actor, request: StrikeRequest) -> Result<Handled> {
        let verb = if request.delta > 0.0 { "Add" } else { "Remove" };
        let proposal = ProposedMutation::new(
            format!("{} strikes", verb),
            format!(
                "{} {} strike(s) for <@{}>: {}",
                verb,
                request.delta.abs(),
                request.target,
                request.reason
            ),
        );

        let ledger = self.ledger.clone();
        let roles = self.roles.clone();
        let channel_id = request.channel_id.clone();
        self.propose(author, &channel_id, proposal, move |approver| async move {
            apply_strike(&ledger, &roles, &request, &approver).await
        })
        .await
    }

    /// Post a confirmation prompt and run `on_confirm` in the background if approved
    async fn propose<F, Fut>(
        &self,
        author: &Actor,
        channel_id: &str,
        proposal: ProposedMutation,
        on_confirm: F,
    ) -> Result<Handled>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let (prompt_id, flow) = self.post_confirmation(&author.id, channel_id, proposal).await?;

        let this = self.clone();
        let channel = channel_id.to_string();
        let id = prompt_id.clone();
        let task = tokio::spawn(async move {
            this.finish_confirmation(&id, &channel, flow, on_confirm).await;
        });
        self.track(prompt_id.clone(), task);
        Ok(Handled::Prompted { prompt_id })
    }

    async fn post_confirmation(
        &self,
        author_id: &str,
        channel_id: &str,
        proposal: ProposedMutation,
    ) -> Result<(String, Arc<ConfirmationFlow>)> {
        let reply = Reply::prompt(
            format!("Confirm: {}", proposal.title),
            format!(
                "{}\nReact {} to confirm or {} to cancel.",
                proposal.description, APPROVE_EMOJI, CANCEL_EMOJI
            ),
            vec![APPROVE_EMOJI.to_string(), CANCEL_EMOJI.to_string()],
        );
        let prompt_id = self.messenger.send(channel_id, &reply).await?;

        let flow = Arc::new(ConfirmationFlow::new(
            &prompt_id,
            proposal,
            only(author_id),
            self.config.confirm_timeout,
        ));
        self.prompts.register(&prompt_id, flow.clone());
        Ok((prompt_id, flow))
    }

    async fn finish_confirmation<F, Fut>(
        &self,
        prompt_id: &str,
        channel_id: &str,
        flow: Arc<ConfirmationFlow>,
        on_confirm: F,
    ) where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let outcome = flow.run(on_confirm).await;
        self.prompts.remove(prompt_id);

        let body = match outcome {
            Ok(ConfirmationOutcome::Confirmed(summary)) => summary,
            Ok(ConfirmationOutcome::Cancelled) => "Cancelled, nothing was changed.".to_string(),
            Ok(ConfirmationOutcome::Expired) => "Confirmation timed out, nothing was changed.".to_string(),
            Err(e) => {
                error!(prompt_id, error = %e, "Confirmed mutation failed");
                format!("⚠️ {} failed: {}", flow.proposal().title, e)
            }
        };
        self.reply(channel_id, Reply::text(body)).await;
    }

    /// Category selection followed by the usual confirmation
    async fn select_category(
        &self,
        message: &MessageEvent,
        target: String,
        note: Option<String>,
    ) -> Result<Handled> {
        let categories: Vec<ViolationCategory> = self
            .config
            .categories
            .iter()
            .take(9)
            .cloned()
            .collect();
        if categories.is_empty() {
            self.reply(&message.channel_id, Reply::text("Usage: strike @user amount [reason]"))
                .await;
            return Ok(Handled::Replied);
        }

        let mut body = format!("Pick a violation for <@{}>:", target);
        let mut reactions = Vec::with_capacity(categories.len() + 1);
        for (index, category) in categories.iter().enumerate() {
            if let Some(emoji) = Reaction::option_emoji(index) {
                body.push_str(&format!("\n{} {} ({})", emoji, category.name, category.amount));
                reactions.push(emoji.to_string());
            }
        }
        reactions.push(CANCEL_EMOJI.to_string());

        let prompt_id = self
            .messenger
            .send(&message.channel_id, &Reply::prompt("Select violation", body, reactions))
            .await?;
        let selection = Arc::new(SelectionFlow::new(
            &prompt_id,
            categories,
            only(&message.author.id),
            self.config.selection_timeout,
        ));
        self.prompts.register(&prompt_id, selection.clone());

        let this = self.clone();
        let author = message.author.clone();
        let community_id = message.community_id.clone();
        let channel_id = message.channel_id.clone();
        let id = prompt_id.clone();
        let task = tokio::spawn(async move {
            let chosen = selection.outcome().await;
            this.prompts.remove(&id);

            let category = match chosen {
                Selection::Chosen(category) => category,
                Selection::Cancelled => {
                    this.reply(&channel_id, Reply::text("Cancelled, nothing was changed.")).await;
                    return;
                }
                Selection::Expired => {
                    this.reply(&channel_id, Reply::text("Selection timed out, nothing was changed."))
                        .await;
                    return;
                }
            };

            let reason = match note {
                Some(note) => format!("{}: {}", category.name, note),
                None => category.name.clone(),
            };
            let request = StrikeRequest {
                community_id,
                channel_id: channel_id.clone(),
                target,
                delta: category.amount,
                reason,
            };

            // The confirmation step runs inside this task, so joining the
            // selection prompt waits for the whole chain
            let proposal = ProposedMutation::new(
                "Add strikes",
                format!("Add {} strike(s) for <@{}>: {}", request.delta, request.target, request.reason),
            );
            match this.post_confirmation(&author.id, &channel_id, proposal).await {
                Ok((confirm_id, flow)) => {
                    let ledger = this.ledger.clone();
                    let roles = this.roles.clone();
                    this.finish_confirmation(&confirm_id, &channel_id, flow, move |approver| async move {
                        apply_strike(&ledger, &roles, &request, &approver).await
                    })
                    .await;
                }
                Err(e) => warn!(error = %e, "Failed to post confirmation prompt"),
            }
        });
        self.track(prompt_id.clone(), task);
        Ok(Handled::Prompted { prompt_id })
    }

    async fn start_batch<Fut>(&self, channel_id: &str, label: &str, work: Fut) -> Result<Handled>
    where
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.reply(channel_id, Reply::text(format!("{} started.", label)))
            .await;

        let this = self.clone();
        let channel = channel_id.to_string();
        let label = label.to_string();
        let task_id = Uuid::new_v4().to_string();
        let task = tokio::spawn(async move {
            let body = match work.await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(operation = %label, error = %e, "Batch command failed");
                    format!("⚠️ {} failed: {}", label, e)
                }
            };
            this.reply(&channel, Reply::text(body)).await;
        });
        self.track(task_id.clone(), task);
        Ok(Handled::Started { task_id })
    }

    fn track(&self, id: String, task: JoinHandle<()>) {
        self.background.retain(|_, handle| !handle.is_finished());
        self.background.insert(id, task);
    }

    /// Best-effort reply; a failed send is logged, never raised
    async fn reply(&self, channel_id: &str, reply: Reply) {
        if let Err(e) = self.messenger.send(channel_id, &reply).await {
            warn!(channel_id, error = %e, "Failed to send reply");
        }
    }
}

/// Single-member ledger change awaiting confirmation
struct StrikeRequest {
    community_id: String,
    channel_id: String,
    target: String,
    delta: f64,
    reason: String,
}

async fn apply_strike(
    ledger: &StrikeLedger,
    roles: &RoleSynchronizer,
    request: &StrikeRequest,
    approver: &str,
) -> Result<String> {
    let key = StrikeKey::new(&request.target, &request.community_id);
    let applied = if request.delta > 0.0 {
        ledger.add_strikes(&key, request.delta, &request.reason, approver).await?
    } else {
        ledger.remove_strikes(&key, -request.delta, &request.reason, approver).await?
    };

    let tier = match roles.sync(&request.community_id, &request.target, applied.total).await {
        Ok(sync) => sync.tier,
        Err(e) => {
            // The ledger change stands; labels catch up on the next resync
            warn!(key = %key, error = %e, "Tier sync failed after strike change");
            roles.tier_for(applied.total)
        }
    };
    info!(key = %key, total = applied.total, tier = %tier, approver, "Strike change applied");
    debug!(key = %key, requested = applied.requested, applied = applied.applied(), "Strike delta detail");

    Ok(format!(
        "<@{}> now has {} strike(s) (tier: {}).",
        request.target, applied.total, tier
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::{fixture, Fixture};
    use crate::chat::MemoryChatGateway;
    use crate::guard::{GuardConfig, Rejection};
    use std::time::Duration;

    fn dispatcher(fx: &Fixture) -> Dispatcher {
        dispatcher_with(fx, GuardConfig::default())
    }

    fn dispatcher_with(fx: &Fixture, guard: GuardConfig) -> Dispatcher {
        let config = DispatchConfig {
            confirm_timeout: Duration::from_secs(5),
            selection_timeout: Duration::from_secs(5),
            ..DispatchConfig::default()
        };
        Dispatcher::new(
            DispatchGuard::new(&guard),
            Arc::new(fx.runner.clone()),
            fx.chat.clone(),
            config,
        )
    }

    fn moderator() -> Actor {
        Actor::new("mod-1", "Mod", true)
    }

    fn message(event_id: &str, author: Actor, content: &str) -> ChatEvent {
        ChatEvent::Message(MessageEvent {
            event_id: event_id.to_string(),
            community_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            author,
            content: content.to_string(),
        })
    }

    fn reaction(event_id: &str, message_id: &str, actor: Actor, emoji: &str) -> ChatEvent {
        ChatEvent::Reaction(ReactionEvent {
            event_id: event_id.to_string(),
            community_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            message_id: message_id.to_string(),
            actor,
            emoji: emoji.to_string(),
        })
    }

    fn prompt_id(outcome: DispatchOutcome<Handled>) -> String {
        match outcome {
            DispatchOutcome::Completed(Handled::Prompted { prompt_id }) => prompt_id,
            other => panic!("expected a prompt, got {:?}", other),
        }
    }

    fn last_body(chat: &MemoryChatGateway) -> String {
        chat.last_sent().map(|m| m.reply.body).unwrap_or_default()
    }

    async fn total(fx: &Fixture, actor: &str) -> f64 {
        fx.runner.ledger().read_total(&StrikeKey::new(actor, "g1")).await.unwrap()
    }

    #[tokio::test]
    async fn test_confirmed_strike_is_applied() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);

        let id = prompt_id(dispatcher.handle(message("e1", moderator(), "!strike <@u2> 1.5 spam")).await);
        assert_eq!(total(&fx, "u2").await, 0.0);

        let ack = dispatcher.handle(reaction("e2", &id, moderator(), APPROVE_EMOJI)).await;
        assert_eq!(ack, DispatchOutcome::Completed(Handled::Reaction(DecisionAck::Accepted)));
        assert!(dispatcher.join_flow(&id).await);

        assert_eq!(total(&fx, "u2").await, 1.5);
        assert!(last_body(&fx.chat).contains("now has 1.5"));
        assert!(dispatcher.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_only_invoker_can_approve() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);
        let other_mod = Actor::new("mod-2", "Other", true);

        let id = prompt_id(dispatcher.handle(message("e1", moderator(), "!strike <@u2> 2")).await);
        let ack = dispatcher.handle(reaction("e2", &id, other_mod, APPROVE_EMOJI)).await;
        assert_eq!(ack, DispatchOutcome::Completed(Handled::Reaction(DecisionAck::Unauthorized)));

        dispatcher.handle(reaction("e3", &id, moderator(), CANCEL_EMOJI)).await;
        assert!(dispatcher.join_flow(&id).await);

        assert_eq!(total(&fx, "u2").await, 0.0);
        assert!(last_body(&fx.chat).contains("Cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_confirmation_changes_nothing() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);

        let id = prompt_id(dispatcher.handle(message("e1", moderator(), "!unstrike <@u2> 1")).await);
        assert!(dispatcher.join_flow(&id).await);

        assert_eq!(total(&fx, "u2").await, 0.0);
        assert!(last_body(&fx.chat).contains("timed out"));
        // A late approval finds no prompt
        let late = dispatcher.handle(reaction("e2", &id, moderator(), APPROVE_EMOJI)).await;
        assert_eq!(late, DispatchOutcome::Completed(Handled::Ignored));
    }

    #[tokio::test]
    async fn test_category_selection_then_confirmation() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);

        let selection_id = prompt_id(dispatcher.handle(message("e1", moderator(), "!strike <@u2>")).await);
        let pick = Reaction::option_emoji(1).unwrap();
        dispatcher.handle(reaction("e2", &selection_id, moderator(), pick)).await;

        let mut confirm_id = None;
        for _ in 0..100 {
            if let Some(sent) = fx.chat.last_sent() {
                if sent.id != selection_id && sent.reply.title.as_deref() == Some("Confirm: Add strikes") {
                    confirm_id = Some(sent.id);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
        let confirm_id = confirm_id.expect("confirmation prompt was posted");

        dispatcher.handle(reaction("e3", &confirm_id, moderator(), APPROVE_EMOJI)).await;
        assert!(dispatcher.join_flow(&selection_id).await);

        // "Missed both attacks" is worth two strikes
        assert_eq!(total(&fx, "u2").await, 2.0);
        let record = fx.runner.ledger().record(&StrikeKey::new("u2", "g1")).await.unwrap().unwrap();
        assert_eq!(record.history[0].reason, "Missed both attacks");
    }

    #[tokio::test]
    async fn test_member_commands_are_gated() {
        let fx = fixture();
        // e2 and e3 are the same command from the same member
        let dispatcher = dispatcher_with(
            &fx,
            GuardConfig {
                cooldown: Duration::ZERO,
                ..GuardConfig::default()
            },
        );
        let member = Actor::new("u3", "Member", false);

        let outcome = dispatcher.handle(message("e1", member.clone(), "!strike <@u2> 1")).await;
        assert_eq!(outcome, DispatchOutcome::Completed(Handled::Replied));
        assert!(dispatcher.prompts().is_empty());

        dispatcher.handle(message("e2", member.clone(), "!strikes <@u2>")).await;
        assert!(last_body(&fx.chat).contains("only view your own"));

        let own = dispatcher.handle(message("e3", member, "!strikes")).await;
        assert!(own.is_completed());
        assert!(last_body(&fx.chat).contains("<@u3> has no strikes"));
    }

    #[tokio::test]
    async fn test_duplicate_and_cooldown_rejections() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);

        let first = dispatcher.handle(message("e1", moderator(), "!warn <@u2> be nice")).await;
        assert_eq!(first, DispatchOutcome::Completed(Handled::Replied));

        let duplicate = dispatcher.handle(message("e1", moderator(), "!warn <@u2> be nice")).await;
        assert_eq!(duplicate, DispatchOutcome::Rejected(Rejection::DuplicateEvent));

        let again = dispatcher.handle(message("e2", moderator(), "!warn <@u2> be nice")).await;
        assert!(matches!(again, DispatchOutcome::Rejected(Rejection::CoolingDown { .. })));

        let record = fx.runner.ledger().record(&StrikeKey::new("u2", "g1")).await.unwrap().unwrap();
        assert_eq!(record.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_command_replies_with_error() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);
        fx.store.set_ledger_unavailable(true);

        let outcome = dispatcher.handle(message("e1", moderator(), "!warn <@u2> spam")).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));
        assert!(last_body(&fx.chat).starts_with("⚠️ Command failed"));
    }

    #[tokio::test]
    async fn test_decay_runs_in_background() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);

        let outcome = dispatcher.handle(message("e1", moderator(), "!decay")).await;
        let task_id = match outcome {
            DispatchOutcome::Completed(Handled::Started { task_id }) => task_id,
            other => panic!("expected a started batch, got {:?}", other),
        };
        assert!(dispatcher.join_flow(&task_id).await);
        assert!(last_body(&fx.chat).contains("Strike decay done"));

        let status = dispatcher.handle(message("e2", moderator(), "!opstatus scheduled_decay")).await;
        assert_eq!(status, DispatchOutcome::Completed(Handled::Replied));
        assert!(last_body(&fx.chat).contains("last completed"));
    }

    #[tokio::test]
    async fn test_usage_and_foreign_messages() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx);

        let ignored = dispatcher.handle(message("e1", moderator(), "good game everyone")).await;
        assert_eq!(ignored, DispatchOutcome::Completed(Handled::Ignored));

        let usage = dispatcher.handle(message("e2", moderator(), "!unstrike <@u2>")).await;
        assert_eq!(usage, DispatchOutcome::Completed(Handled::Replied));
        assert!(last_body(&fx.chat).starts_with("Usage"));
    }
}
