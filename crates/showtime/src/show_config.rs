//! Environment configuration tokens and the `conf-*` command algebra.
//!
//! A show's configuration is a set of lowercase tokens such as `alerts`,
//! `no-dashboard_rbac`, `debug` or `size-large`. It is stored on the PR as a
//! single sorted, comma-joined label value. The empty set is spelled
//! `standard`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::ShowtimeError;

/// Sentinel spelling of the empty configuration.
pub const STANDARD: &str = "standard";

const DEBUG_TOKEN: &str = "debug";
const NEGATION_PREFIX: &str = "no-";
const SIZE_PREFIX: &str = "size-";
const FEATURE_ENV_PREFIX: &str = "SUPERSET_FEATURE_";
const DEBUG_ENV: &str = "FLASK_DEBUG";

/// Canonical configuration token set.
///
/// Tokens are kept lowercase, sorted and de-duplicated. `standard` is never
/// stored as a token; it is only the textual form of the empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShowConfig {
    tokens: BTreeSet<String>,
}

impl ShowConfig {
    /// The empty (`standard`) configuration.
    #[must_use]
    pub fn standard() -> Self {
        Self::default()
    }

    /// Parse a comma-joined token list. Blank tokens and `standard` are dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let tokens = raw
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty() && t != STANDARD)
            .collect();
        Self { tokens }
    }

    #[must_use]
    pub fn is_standard(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// The `size-*` token value, if any.
    #[must_use]
    pub fn size(&self) -> Option<&str> {
        self.tokens().find_map(|t| t.strip_prefix(SIZE_PREFIX))
    }

    /// Apply one command and return the resulting configuration.
    #[must_use]
    pub fn apply(&self, command: &ConfigCommand) -> Self {
        let mut tokens = self.tokens.clone();
        match command {
            ConfigCommand::Enable(feature) => {
                tokens.remove(&format!("{NEGATION_PREFIX}{feature}"));
                tokens.insert(feature.clone());
            }
            ConfigCommand::Disable(feature) => {
                tokens.remove(feature);
                tokens.insert(format!("{NEGATION_PREFIX}{feature}"));
            }
            ConfigCommand::DebugOn => {
                tokens.insert(DEBUG_TOKEN.to_string());
            }
            ConfigCommand::DebugOff => {
                tokens.remove(DEBUG_TOKEN);
            }
            ConfigCommand::Size(size) => {
                tokens.retain(|t| !t.starts_with(SIZE_PREFIX));
                tokens.insert(format!("{SIZE_PREFIX}{size}"));
            }
        }
        Self { tokens }
    }

    /// Environment variables that realise this configuration on a running
    /// service.
    ///
    /// Every enabled feature maps to `SUPERSET_FEATURE_<NAME>=true`, every
    /// `no-<name>` token to `false`. `FLASK_DEBUG` is always present so that
    /// `debug-off` actually switches debugging off. Size tokens have no
    /// runtime flag.
    #[must_use]
    pub fn feature_flags(&self) -> BTreeMap<String, bool> {
        let mut flags = BTreeMap::new();
        for token in self.tokens() {
            if token == DEBUG_TOKEN || token.starts_with(SIZE_PREFIX) {
                continue;
            }
            let (feature, enabled) = match token.strip_prefix(NEGATION_PREFIX) {
                Some(feature) => (feature, false),
                None => (token, true),
            };
            flags.insert(
                format!("{FEATURE_ENV_PREFIX}{}", feature.to_uppercase()),
                enabled,
            );
        }
        flags.insert(DEBUG_ENV.to_string(), self.contains(DEBUG_TOKEN));
        flags
    }
}

impl fmt::Display for ShowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tokens.is_empty() {
            return f.write_str(STANDARD);
        }
        let joined: Vec<&str> = self.tokens().collect();
        f.write_str(&joined.join(","))
    }
}

impl FromStr for ShowConfig {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// A parsed `conf-*` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// `enable-<FEATURE>`
    Enable(String),
    /// `disable-<FEATURE>`
    Disable(String),
    /// `debug-on`
    DebugOn,
    /// `debug-off`
    DebugOff,
    /// `size-<SIZE>`
    Size(String),
}

impl ConfigCommand {
    /// Parse a command string such as `enable-ALERTS`.
    ///
    /// The first matching rule wins; anything unrecognised is
    /// `InvalidCommand`. Arguments are lowercased and limited to
    /// `[a-z0-9_]` since they end up in environment variable names.
    pub fn parse(command: &str) -> Result<Self, ShowtimeError> {
        let invalid = || ShowtimeError::InvalidCommand(command.to_string());
        let argument = |rest: &str| {
            let rest = rest.to_lowercase();
            let valid = !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if valid {
                Ok(rest)
            } else {
                Err(invalid())
            }
        };

        if let Some(feature) = command.strip_prefix("enable-") {
            Ok(Self::Enable(argument(feature)?))
        } else if let Some(feature) = command.strip_prefix("disable-") {
            Ok(Self::Disable(argument(feature)?))
        } else if command == "debug-on" {
            Ok(Self::DebugOn)
        } else if command == "debug-off" {
            Ok(Self::DebugOff)
        } else if let Some(size) = command.strip_prefix(SIZE_PREFIX) {
            Ok(Self::Size(argument(size)?))
        } else {
            Err(invalid())
        }
    }
}

/// Whether an environment variable is owned by [`ShowConfig::feature_flags`].
#[must_use]
pub fn is_flag_env(name: &str) -> bool {
    name.starts_with(FEATURE_ENV_PREFIX) || name == DEBUG_ENV
}

/// Merge a command into a textual configuration.
pub fn merge_config(current: &str, command: &str) -> Result<ShowConfig, ShowtimeError> {
    let command = ConfigCommand::parse(command)?;
    Ok(ShowConfig::parse(current).apply(&command))
}
