//! Chat command parsing
//!
//! ```text
//! !strike @user [amount] [reason]   add strikes (no amount: pick a category)
//! !unstrike @user amount [reason]   remove strikes
//! !warn @user reason                formal warning, no strikes
//! !strikes [@user]                  show a strike record
//! !seasonreset amount               subtract amount from everyone
//! !decay                            run strike decay now
//! !resync                           re-apply tier labels to everyone
//! !warpenalty #CLAN                 penalize missed attacks of the last war
//! !opstatus type                    show batch operation status
//! ```

pub mod dispatcher;

pub use dispatcher::{Dispatcher, Handled};

use std::time::Duration;

use crate::db::schemas::OperationKind;

/// Offered when `!strike` is used without an amount
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationCategory {
    pub name: String,
    pub amount: f64,
}

/// Command dispatch configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub prefix: String,
    pub confirm_timeout: Duration,
    pub selection_timeout: Duration,
    pub categories: Vec<ViolationCategory>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            confirm_timeout: Duration::from_secs(120),
            selection_timeout: Duration::from_secs(300),
            categories: vec![
                ViolationCategory {
                    name: "Missed war attack".to_string(),
                    amount: 1.0,
                },
                ViolationCategory {
                    name: "Missed both attacks".to_string(),
                    amount: 2.0,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Strike {
        target: String,
        amount: Option<f64>,
        reason: Option<String>,
    },
    Unstrike {
        target: String,
        amount: f64,
        reason: Option<String>,
    },
    Warn {
        target: String,
        reason: String,
    },
    Strikes {
        target: Option<String>,
    },
    SeasonReset {
        amount: f64,
    },
    Decay,
    Resync,
    WarPenalty {
        clan_tag: String,
    },
    OpStatus {
        operation: OperationKind,
    },
}

impl Command {
    /// Stable command name, used for in-flight and cooldown tracking
    pub fn name(&self) -> &'static str {
        match self {
            Command::Strike { .. } => "strike",
            Command::Unstrike { .. } => "unstrike",
            Command::Warn { .. } => "warn",
            Command::Strikes { .. } => "strikes",
            Command::SeasonReset { .. } => "seasonreset",
            Command::Decay => "decay",
            Command::Resync => "resync",
            Command::WarPenalty { .. } => "warpenalty",
            Command::OpStatus { .. } => "opstatus",
        }
    }

    /// Whether only moderators may invoke the command
    pub fn requires_moderator(&self) -> bool {
        !matches!(self, Command::Strikes { .. })
    }
}

/// Extract a member id from a mention (`<@123>`, `<@!123>`) or a bare id
pub fn parse_mention(token: &str) -> Option<String> {
    let id = token
        .strip_prefix("<@")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(|inner| inner.trim_start_matches('!'))
        .unwrap_or(token);

    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .then(|| id.to_string())
}

fn parse_amount(token: &str) -> Option<f64> {
    token
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite() && *amount > 0.0)
}

fn rest_of(tokens: &[&str]) -> Option<String> {
    let joined = tokens.join(" ");
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse a message.
///
/// `None` when the message is not one of our commands. `Some(Err(usage))`
/// when it is, but the arguments are wrong.
pub fn parse(prefix: &str, content: &str) -> Option<Result<Command, String>> {
    let body = content.trim().strip_prefix(prefix)?;
    let tokens: Vec<&str> = body.split_whitespace().collect();
    let (name, args) = tokens.split_first()?;

    let parsed = match name.to_ascii_lowercase().as_str() {
        "strike" => {
            let target = args.first().and_then(|t| parse_mention(t));
            match target {
                None => Err("Usage: strike @user [amount] [reason]".to_string()),
                Some(target) => {
                    let amount = args.get(1).and_then(|t| parse_amount(t));
                    let reason_from = if amount.is_some() { 2 } else { 1 };
                    Ok(Command::Strike {
                        target,
                        amount,
                        reason: rest_of(args.get(reason_from..).unwrap_or_default()),
                    })
                }
            }
        }
        "unstrike" => {
            let target = args.first().and_then(|t| parse_mention(t));
            let amount = args.get(1).and_then(|t| parse_amount(t));
            match (target, amount) {
                (Some(target), Some(amount)) => Ok(Command::Unstrike {
                    target,
                    amount,
                    reason: rest_of(args.get(2..).unwrap_or_default()),
                }),
                _ => Err("Usage: unstrike @user amount [reason]".to_string()),
            }
        }
        "warn" => {
            let target = args.first().and_then(|t| parse_mention(t));
            let reason = rest_of(args.get(1..).unwrap_or_default());
            match (target, reason) {
                (Some(target), Some(reason)) => Ok(Command::Warn { target, reason }),
                _ => Err("Usage: warn @user reason".to_string()),
            }
        }
        "strikes" => match args.first() {
            None => Ok(Command::Strikes { target: None }),
            Some(token) => parse_mention(token)
                .map(|target| Command::Strikes { target: Some(target) })
                .ok_or_else(|| "Usage: strikes [@user]".to_string()),
        },
        "seasonreset" => args
            .first()
            .and_then(|t| parse_amount(t))
            .map(|amount| Command::SeasonReset { amount })
            .ok_or_else(|| "Usage: seasonreset amount".to_string()),
        "decay" => Ok(Command::Decay),
        "resync" => Ok(Command::Resync),
        "warpenalty" => match args.first() {
            Some(tag) if tag.starts_with('#') && tag.len() > 1 => Ok(Command::WarPenalty {
                clan_tag: tag.to_ascii_uppercase(),
            }),
            _ => Err("Usage: warpenalty #CLANTAG".to_string()),
        },
        "opstatus" => args
            .first()
            .and_then(|t| OperationKind::parse(t))
            .map(|operation| Command::OpStatus { operation })
            .ok_or_else(|| {
                "Usage: opstatus mass_reduction|scheduled_decay|role_resync|bulk_ledger".to_string()
            }),
        _ => return None,
    };
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strike_variants() {
        assert_eq!(
            parse("!", "!strike <@123> 1.5 missed both attacks"),
            Some(Ok(Command::Strike {
                target: "123".to_string(),
                amount: Some(1.5),
                reason: Some("missed both attacks".to_string()),
            }))
        );
        assert_eq!(
            parse("!", "!strike <@!123>"),
            Some(Ok(Command::Strike {
                target: "123".to_string(),
                amount: None,
                reason: None,
            }))
        );
        // A non-numeric second token starts the reason
        assert_eq!(
            parse("!", "!strike 123 spamming links"),
            Some(Ok(Command::Strike {
                target: "123".to_string(),
                amount: None,
                reason: Some("spamming links".to_string()),
            }))
        );
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(matches!(parse("!", "!strike"), Some(Err(_))));
        assert!(matches!(parse("!", "!unstrike <@1> -2"), Some(Err(_))));
        assert!(matches!(parse("!", "!warn <@1>"), Some(Err(_))));
        assert!(matches!(parse("!", "!warpenalty CLAN"), Some(Err(_))));
        assert!(matches!(parse("!", "!opstatus cleanup"), Some(Err(_))));
    }

    #[test]
    fn test_parse_ignores_foreign_messages() {
        assert_eq!(parse("!", "hello there"), None);
        assert_eq!(parse("!", "!play some music"), None);
        assert_eq!(parse("!", "!"), None);
    }

    #[test]
    fn test_parse_batch_commands() {
        assert_eq!(parse("!", "!seasonreset 2"), Some(Ok(Command::SeasonReset { amount: 2.0 })));
        assert_eq!(
            parse("!", "!warpenalty #abc123"),
            Some(Ok(Command::WarPenalty {
                clan_tag: "#ABC123".to_string()
            }))
        );
        assert_eq!(
            parse("!", "!OpStatus role_resync"),
            Some(Ok(Command::OpStatus {
                operation: OperationKind::RoleResync
            }))
        );
    }

    #[test]
    fn test_parse_mention() {
        assert_eq!(parse_mention("<@42>"), Some("42".to_string()));
        assert_eq!(parse_mention("<@!42>"), Some("42".to_string()));
        assert_eq!(parse_mention("@everyone!"), None);
    }
}
