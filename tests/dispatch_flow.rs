//! End-to-end command flows: guard, confirmation, ledger, roles

mod common;

use std::time::Duration;

use bailiff::chat::{Actor, ChatEvent, MessageEvent, ReactionEvent};
use bailiff::commands::Handled;
use bailiff::confirm::registry::{APPROVE_EMOJI, CANCEL_EMOJI};
use bailiff::guard::{DispatchOutcome, GuardConfig, Rejection};
use bailiff::store::StrikeKey;

fn moderator() -> Actor {
    Actor::new("mod-1", "Mod", true)
}

fn message(event_id: &str, content: &str) -> ChatEvent {
    ChatEvent::Message(MessageEvent {
        event_id: event_id.to_string(),
        community_id: "g1".to_string(),
        channel_id: "c1".to_string(),
        author: moderator(),
        content: content.to_string(),
    })
}

fn reaction(event_id: &str, message_id: &str, emoji: &str) -> ChatEvent {
    ChatEvent::Reaction(ReactionEvent {
        event_id: event_id.to_string(),
        community_id: "g1".to_string(),
        channel_id: "c1".to_string(),
        message_id: message_id.to_string(),
        actor: moderator(),
        emoji: emoji.to_string(),
    })
}

fn prompted(outcome: DispatchOutcome<Handled>) -> String {
    match outcome {
        DispatchOutcome::Completed(Handled::Prompted { prompt_id }) => prompt_id,
        other => panic!("expected a prompt, got {:?}", other),
    }
}

fn no_cooldown() -> GuardConfig {
    GuardConfig {
        cooldown: Duration::ZERO,
        ..GuardConfig::default()
    }
}

#[tokio::test]
async fn test_two_confirmed_strikes_reach_block_tier() {
    let h = common::harness();
    let dispatcher = h.dispatcher(no_cooldown());

    let first = prompted(dispatcher.handle(message("e1", "!strike <@u2> 1.5 missed attack")).await);
    dispatcher.handle(reaction("r1", &first, APPROVE_EMOJI)).await;
    assert!(dispatcher.join_flow(&first).await);
    assert_eq!(h.chat.labels_of("g1", "u2"), Vec::<String>::new());

    let second = prompted(dispatcher.handle(message("e2", "!strike <@u2> 2 missed both")).await);
    dispatcher.handle(reaction("r2", &second, APPROVE_EMOJI)).await;
    assert!(dispatcher.join_flow(&second).await);

    let key = StrikeKey::new("u2", "g1");
    assert_eq!(h.ledger().read_total(&key).await.unwrap(), 3.5);
    assert_eq!(h.chat.labels_of("g1", "u2"), vec!["Strike Block".to_string()]);
}

#[tokio::test]
async fn test_cooldown_rejection_does_not_mutate() {
    let h = common::harness();
    let dispatcher = h.dispatcher(GuardConfig::default());

    let first = dispatcher.handle(message("e1", "!warn <@u2> spam")).await;
    assert_eq!(first, DispatchOutcome::Completed(Handled::Replied));

    let second = dispatcher.handle(message("e2", "!warn <@u2> more spam")).await;
    assert!(matches!(second, DispatchOutcome::Rejected(Rejection::CoolingDown { .. })));

    let record = h.ledger().record(&StrikeKey::new("u2", "g1")).await.unwrap().unwrap();
    assert_eq!(record.warnings.len(), 1);
    assert_eq!(record.warnings[0].reason, "spam");
}

#[tokio::test]
async fn test_cancelled_confirmation_leaves_ledger_unchanged() {
    let h = common::harness();
    let dispatcher = h.dispatcher(no_cooldown());

    let id = prompted(dispatcher.handle(message("e1", "!seasonreset 5")).await);
    dispatcher.handle(reaction("r1", &id, CANCEL_EMOJI)).await;
    assert!(dispatcher.join_flow(&id).await);

    // A late approval is ignored
    let late = dispatcher.handle(reaction("r2", &id, APPROVE_EMOJI)).await;
    assert_eq!(late, DispatchOutcome::Completed(Handled::Ignored));
    assert!(h
        .recovery
        .completed_operations("g1", bailiff::db::schemas::OperationKind::MassReduction)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expired_confirmation_leaves_ledger_unchanged() {
    let h = common::harness();
    let dispatcher = h.dispatcher(no_cooldown());
    let key = StrikeKey::new("u2", "g1");
    h.ledger().add_strikes(&key, 3.0, "seed", "mod-1").await.unwrap();

    let id = prompted(dispatcher.handle(message("e1", "!unstrike <@u2> 2 appeal")).await);
    assert!(dispatcher.join_flow(&id).await);

    assert_eq!(h.ledger().read_total(&key).await.unwrap(), 3.0);
    let last = h.chat.last_sent().unwrap();
    assert!(last.reply.body.contains("timed out"));
}

#[tokio::test]
async fn test_duplicate_reaction_event_is_rejected() {
    let h = common::harness();
    let dispatcher = h.dispatcher(no_cooldown());

    let id = prompted(dispatcher.handle(message("e1", "!strike <@u2> 1")).await);
    dispatcher.handle(reaction("r1", &id, APPROVE_EMOJI)).await;
    let replay = dispatcher.handle(reaction("r1", &id, APPROVE_EMOJI)).await;
    assert_eq!(replay, DispatchOutcome::Rejected(Rejection::DuplicateEvent));

    assert!(dispatcher.join_flow(&id).await);
    assert_eq!(h.ledger().read_total(&StrikeKey::new("u2", "g1")).await.unwrap(), 1.0);
}
