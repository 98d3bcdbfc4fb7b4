//! Trigger labels: requests for an action, consumed when processed.

use std::fmt;

use super::CIRCUS_PREFIX;

const START: &str = "trigger-start";
const STOP: &str = "trigger-stop";
const SYNC: &str = "trigger-sync";
const CONF_PREFIX: &str = "conf-";

/// An action requested through a PR label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// `🎪 trigger-start`: create an environment.
    Start,
    /// `🎪 trigger-stop`: destroy the environment and clear state labels.
    Stop,
    /// `🎪 trigger-sync`: move the environment to the latest commit.
    Sync,
    /// `🎪 conf-<command>`: change the environment configuration.
    Config(String),
}

impl Trigger {
    /// Parse a raw label. Returns `None` for anything that is not a trigger.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let body = label.strip_prefix(CIRCUS_PREFIX)?;
        match body {
            START => Some(Self::Start),
            STOP => Some(Self::Stop),
            SYNC => Some(Self::Sync),
            _ => body
                .strip_prefix(CONF_PREFIX)
                .filter(|command| !command.is_empty())
                .map(|command| Self::Config(command.to_string())),
        }
    }

    /// The label text that requests this trigger.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Start => format!("{CIRCUS_PREFIX}{START}"),
            Self::Stop => format!("{CIRCUS_PREFIX}{STOP}"),
            Self::Sync => format!("{CIRCUS_PREFIX}{SYNC}"),
            Self::Config(command) => format!("{CIRCUS_PREFIX}{CONF_PREFIX}{command}"),
        }
    }

    /// Short name used in logs and reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Sync => "sync",
            Self::Config(_) => "config",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
