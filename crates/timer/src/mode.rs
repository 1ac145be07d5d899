//! Node modes: the first segment of a node type such as `"I.Default"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fairness mode of a node.  Used to namespace events and pick defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "V")]
    Value,
    #[serde(rename = "I")]
    Immediate,
    #[serde(rename = "B")]
    Balanced,
    #[serde(rename = "O")]
    Obligated,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Value => "V",
            Mode::Immediate => "I",
            Mode::Balanced => "B",
            Mode::Obligated => "O",
        }
    }

    /// Mode of a `"<Mode>.<Kind>"` node type, if its first segment is one.
    pub fn of_node_type(node_type: &str) -> Option<Self> {
        node_type.split('.').next()?.parse().ok()
    }

    /// `"<mode>.default.<phase>"`, e.g. `"I.default.applied"`.
    pub fn default_event(self, phase: &str) -> String {
        format!("{}.default.{}", self.as_str(), phase)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "V" => Ok(Mode::Value),
            "I" => Ok(Mode::Immediate),
            "B" => Ok(Mode::Balanced),
            "O" => Ok(Mode::Obligated),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_comes_from_first_segment() {
        assert_eq!(Mode::of_node_type("I.Default"), Some(Mode::Immediate));
        assert_eq!(Mode::of_node_type("B.Sweep"), Some(Mode::Balanced));
        assert_eq!(Mode::of_node_type("X.Default"), None);
        assert_eq!(Mode::of_node_type(""), None);
    }

    #[test]
    fn default_event_names_are_namespaced() {
        assert_eq!(Mode::Obligated.default_event("cancelled"), "O.default.cancelled");
    }
}
