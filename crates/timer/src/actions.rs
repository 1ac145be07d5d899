//! The closed table of fallback actions a timer may apply on expiry.
//!
//! Adding a default action means adding a variant here.

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackAction {
    /// `I.Fallback.high`: keep the higher-quality option.
    High,
    /// `I.Fallback.usual`: repeat the usual choice.
    Usual,
    /// `B.Fallback.fair`: split the difference.
    Fair,
    /// `O.Fallback.comply`: meet the obligation as stated.
    Comply,
    /// Anything else.  Resolves to a `{status: "unknown"}` result.
    Unknown(String),
}

impl FallbackAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "I.Fallback.high" => FallbackAction::High,
            "I.Fallback.usual" => FallbackAction::Usual,
            "B.Fallback.fair" => FallbackAction::Fair,
            "O.Fallback.comply" => FallbackAction::Comply,
            other => FallbackAction::Unknown(other.to_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FallbackAction::High => "I.Fallback.high",
            FallbackAction::Usual => "I.Fallback.usual",
            FallbackAction::Fair => "B.Fallback.fair",
            FallbackAction::Comply => "O.Fallback.comply",
            FallbackAction::Unknown(name) => name,
        }
    }

    /// Compute the result recorded when this action is applied.  Never fails.
    pub fn resolve(&self) -> Value {
        let (strategy, description) = match self {
            FallbackAction::High => ("high", "Kept the higher-quality option"),
            FallbackAction::Usual => ("usual", "Repeated the usual choice"),
            FallbackAction::Fair => ("fair", "Applied the fair split"),
            FallbackAction::Comply => ("comply", "Complied with the stated obligation"),
            FallbackAction::Unknown(name) => {
                return json!({ "status": "unknown", "action": name });
            }
        };
        json!({
            "status": "applied",
            "applied": true,
            "action": self.name(),
            "strategy": strategy,
            "description": description,
        })
    }
}
