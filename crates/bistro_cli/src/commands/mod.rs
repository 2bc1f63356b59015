//! CLI command implementations.

pub mod backup;
pub mod reconcile;
pub mod restaurant;
pub mod review;
pub mod snapshot;
pub mod stats;

use serde::Serialize;

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Output {
    /// Parses the `--format` flag. Anything but `json` is text.
    pub fn parse(format: &str) -> Self {
        match format {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }

    /// Prints `value` as JSON, or calls `text` for text output.
    pub fn emit<T: Serialize>(
        self,
        value: &T,
        text: impl FnOnce(&T),
    ) -> Result<(), Box<dyn std::error::Error>> {
        match self {
            Self::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Self::Text => text(value),
        }
        Ok(())
    }
}

/// Refuses a destructive action unless `--yes` was given.
pub fn require_confirmation(yes: bool, action: &str) -> Result<(), Box<dyn std::error::Error>> {
    if yes {
        Ok(())
    } else {
        Err(format!("{action} is destructive; re-run with --yes to confirm").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_formats_fall_back_to_text() {
        assert_eq!(Output::parse("json"), Output::Json);
        assert_eq!(Output::parse("text"), Output::Text);
        assert_eq!(Output::parse("yaml"), Output::Text);
    }

    #[test]
    fn destructive_actions_need_yes() {
        assert!(require_confirmation(true, "x").is_ok());
        let err = require_confirmation(false, "deleting a backup").unwrap_err();
        assert!(err.to_string().contains("--yes"));
    }
}
