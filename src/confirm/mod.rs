//! Confirmation and selection flows for destructive mutations
//!
//! A proposed mutation is only applied after an authorized actor approves
//! it. Cancellation and timeout both end the flow without touching the
//! ledger. A selection step (pick one of N options) may precede the
//! confirmation; the two compose sequentially.

pub mod prompt;
pub mod registry;

pub use prompt::{moderators_only, only, Authorizer, Decision, DecisionAck, Prompt, PromptState};
pub use registry::{PromptRegistry, Reaction, Respond};

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::chat::Actor;
use crate::types::Result;

/// Human-readable description of a pending mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedMutation {
    pub title: String,
    pub description: String,
}

impl ProposedMutation {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Terminal result of a confirmation flow
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationOutcome<R> {
    Confirmed(R),
    Cancelled,
    Expired,
}

impl<R> ConfirmationOutcome<R> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmationOutcome::Confirmed(_))
    }
}

/// Approve/cancel prompt guarding one proposed mutation
pub struct ConfirmationFlow {
    prompt: Prompt<String>,
    proposal: ProposedMutation,
}

impl ConfirmationFlow {
    pub fn new(
        id: impl Into<String>,
        proposal: ProposedMutation,
        authorizer: Authorizer,
        timeout: Duration,
    ) -> Self {
        Self {
            prompt: Prompt::new(id, authorizer, timeout),
            proposal,
        }
    }

    pub fn id(&self) -> &str {
        self.prompt.id()
    }

    pub fn proposal(&self) -> &ProposedMutation {
        &self.proposal
    }

    pub fn approve(&self, actor: &Actor) -> DecisionAck {
        self.prompt.decide(actor, Decision::Resolve(actor.id.clone()))
    }

    pub fn cancel(&self, actor: &Actor) -> DecisionAck {
        self.prompt.decide(actor, Decision::Cancel)
    }

    /// Wait for the decision and run `on_confirm` only if approved.
    ///
    /// `on_confirm` receives the id of the approving actor.
    pub async fn run<R, F, Fut>(&self, on_confirm: F) -> Result<ConfirmationOutcome<R>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self.prompt.outcome().await {
            PromptState::Resolved(approver) => {
                info!(prompt = self.id(), approver = %approver, title = %self.proposal.title, "Mutation confirmed");
                Ok(ConfirmationOutcome::Confirmed(on_confirm(approver).await?))
            }
            PromptState::Cancelled => {
                debug!(prompt = self.id(), "Mutation cancelled");
                Ok(ConfirmationOutcome::Cancelled)
            }
            PromptState::Expired | PromptState::Awaiting => {
                debug!(prompt = self.id(), "Confirmation timed out");
                Ok(ConfirmationOutcome::Expired)
            }
        }
    }
}

/// Terminal result of a selection step
#[derive(Debug, Clone, PartialEq)]
pub enum Selection<O> {
    Chosen(O),
    Cancelled,
    Expired,
}

/// One-of-N choice with its own timeout
pub struct SelectionFlow<O> {
    prompt: Prompt<usize>,
    options: Vec<O>,
}

impl<O> SelectionFlow<O>
where
    O: Clone + Send + Sync,
{
    pub fn new(id: impl Into<String>, options: Vec<O>, authorizer: Authorizer, timeout: Duration) -> Self {
        Self {
            prompt: Prompt::new(id, authorizer, timeout),
            options,
        }
    }

    pub fn id(&self) -> &str {
        self.prompt.id()
    }

    pub fn options(&self) -> &[O] {
        &self.options
    }

    /// Pick the option at zero-based `index`
    pub fn select(&self, actor: &Actor, index: usize) -> DecisionAck {
        if index >= self.options.len() {
            return DecisionAck::Invalid;
        }
        self.prompt.decide(actor, Decision::Resolve(index))
    }

    pub fn cancel(&self, actor: &Actor) -> DecisionAck {
        self.prompt.decide(actor, Decision::Cancel)
    }

    pub async fn outcome(&self) -> Selection<O> {
        match self.prompt.outcome().await {
            PromptState::Resolved(index) => match self.options.get(index) {
                Some(option) => Selection::Chosen(option.clone()),
                None => Selection::Cancelled,
            },
            PromptState::Cancelled => Selection::Cancelled,
            PromptState::Expired | PromptState::Awaiting => Selection::Expired,
        }
    }
}
