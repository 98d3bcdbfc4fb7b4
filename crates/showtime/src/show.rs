//! The `Show`: one ephemeral environment tied to a PR and a commit.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::show_config::ShowConfig;

/// Length of the short commit id carried in labels and resource names.
pub const SHORT_SHA_LEN: usize = 7;

/// Label-safe creation timestamp format (`2024-01-15T14-30`).
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H-%M";

/// Port the environment serves on.
pub const SERVICE_PORT: u16 = 8080;

/// Lifecycle status of a show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowStatus {
    /// Image is being built or the service is deploying.
    Building,
    /// Serving traffic.
    Running,
    /// A replacement for a newer commit is in flight.
    Updating,
    /// Creation or deployment failed.
    Failed,
    /// Torn down.
    Stopped,
}

impl ShowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Emoji used when rendering the status to humans.
    #[must_use]
    pub fn emoji(self) -> &'static str {
        match self {
            Self::Building => "🏗️",
            Self::Running => "🟢",
            Self::Updating => "🔄",
            Self::Failed => "❌",
            Self::Stopped => "🛑",
        }
    }
}

impl fmt::Display for ShowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(Self::Building),
            "running" => Ok(Self::Running),
            "updating" => Ok(Self::Updating),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Retention policy for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    /// Keep for a fixed duration after creation.
    For { amount: u32, unit: DurationUnit },
    /// Keep until the PR is closed.
    Close,
}

/// Units accepted in TTL and age tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl DurationUnit {
    fn suffix(self) -> char {
        match self {
            Self::Minutes => 'm',
            Self::Hours => 'h',
            Self::Days => 'd',
            Self::Weeks => 'w',
        }
    }

    fn seconds(self) -> u64 {
        match self {
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
            Self::Weeks => 604_800,
        }
    }
}

/// Parse a `<n><unit>` token such as `48h` or `1w`.
pub(crate) fn parse_duration_token(token: &str) -> Option<(u32, DurationUnit)> {
    let unit = match token.chars().last()? {
        'm' => DurationUnit::Minutes,
        'h' => DurationUnit::Hours,
        'd' => DurationUnit::Days,
        'w' => DurationUnit::Weeks,
        _ => return None,
    };
    let digits = &token[..token.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u32 = digits.parse().ok()?;
    (amount > 0).then_some((amount, unit))
}

impl Ttl {
    /// Default retention for new environments.
    pub const DEFAULT: Self = Self::For {
        amount: 24,
        unit: DurationUnit::Hours,
    };

    /// Retention window, `None` for `close`.
    #[must_use]
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::For { amount, unit } => {
                Some(Duration::from_secs(u64::from(amount) * unit.seconds()))
            }
            Self::Close => None,
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::For { amount, unit } => write!(f, "{amount}{}", unit.suffix()),
            Self::Close => f.write_str("close"),
        }
    }
}

impl FromStr for Ttl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "close" {
            return Ok(Self::Close);
        }
        parse_duration_token(s)
            .map(|(amount, unit)| Self::For { amount, unit })
            .ok_or_else(|| format!("invalid ttl '{s}' (expected e.g. 24h, 48h, 1w, close)"))
    }
}

/// Truncate a commit id to its short form.
#[must_use]
pub fn short_sha(sha: &str) -> String {
    sha.chars().take(SHORT_SHA_LEN).collect::<String>().to_lowercase()
}

/// Whether `sha` is a well-formed short commit id.
#[must_use]
pub fn is_short_sha(sha: &str) -> bool {
    sha.len() == SHORT_SHA_LEN
        && sha
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Format a creation time the way it is stored in labels.
#[must_use]
pub fn format_created_at(time: DateTime<Utc>) -> String {
    time.format(CREATED_AT_FORMAT).to_string()
}

/// Parse a label-format creation timestamp.
#[must_use]
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// One environment instance.
///
/// A show has no identity outside its label encoding: it is rebuilt from the
/// PR's labels on every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Show {
    pub pr_number: u64,
    /// Short commit id.
    pub sha: String,
    pub status: ShowStatus,
    pub ip: Option<Ipv4Addr>,
    /// Creation timestamp in label format.
    pub created_at: Option<String>,
    pub ttl: Option<Ttl>,
    pub requested_by: Option<String>,
    pub config: ShowConfig,
}

impl Show {
    /// A new show in `building` state, created now.
    #[must_use]
    pub fn building(pr_number: u64, sha: &str, now: DateTime<Utc>) -> Self {
        Self {
            pr_number,
            sha: short_sha(sha),
            status: ShowStatus::Building,
            ip: None,
            created_at: Some(format_created_at(now)),
            ttl: Some(Ttl::DEFAULT),
            requested_by: None,
            config: ShowConfig::standard(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Ttl>) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_requester(mut self, requested_by: Option<String>) -> Self {
        self.requested_by = requested_by.filter(|r| !r.is_empty());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ShowConfig) -> Self {
        self.config = config;
        self
    }

    /// ECS service name: `pr-{pr_number}-{sha}`.
    #[must_use]
    pub fn aws_service_name(&self) -> String {
        format!("pr-{}-{}", self.pr_number, self.sha)
    }

    /// Container image tag: `{service}-ci`.
    #[must_use]
    pub fn aws_image_tag(&self) -> String {
        format!("{}-ci", self.aws_service_name())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ShowStatus::Running
    }

    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.status == ShowStatus::Updating
    }

    /// Whether the environment lags behind `latest_sha` (a full commit id).
    #[must_use]
    pub fn needs_update(&self, latest_sha: &str) -> bool {
        !latest_sha.to_lowercase().starts_with(&self.sha)
    }

    /// Public URL, once an address is known.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.ip.map(|ip| format!("http://{ip}:{SERVICE_PORT}"))
    }

    #[must_use]
    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_created_at)
    }

    /// When the TTL runs out. `None` for `close` or when unknown.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl?.duration()?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        Some(self.created_time()? + ttl)
    }

    /// Time left before the TTL expires, saturating at zero.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expires = self.expires_at()?;
        Some((expires - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn show(sha: &str) -> Show {
        Show {
            pr_number: 1234,
            sha: sha.to_string(),
            status: ShowStatus::Running,
            ip: None,
            created_at: None,
            ttl: None,
            requested_by: None,
            config: ShowConfig::standard(),
        }
    }

    #[test]
    fn test_derived_names() {
        let show = show("abc123f");
        assert_eq!(show.aws_service_name(), "pr-1234-abc123f");
        assert_eq!(show.aws_image_tag(), "pr-1234-abc123f-ci");
    }

    #[test]
    fn test_needs_update_prefix_compare() {
        let show = show("abc123f");
        assert!(show.needs_update("def456a1234567"));
        assert!(!show.needs_update("abc123f1234567"));
        assert!(!show.needs_update("ABC123F1234567"));
    }

    #[test]
    fn test_status_flags() {
        let mut show = show("abc123f");
        assert!(show.is_active());
        assert!(!show.is_updating());
        show.status = ShowStatus::Updating;
        assert!(show.is_updating());
    }

    #[test]
    fn test_ttl_parsing() {
        assert_eq!("24h".parse::<Ttl>().unwrap(), Ttl::DEFAULT);
        assert_eq!("close".parse::<Ttl>().unwrap(), Ttl::Close);
        assert_eq!(
            "1w".parse::<Ttl>().unwrap().duration(),
            Some(Duration::from_secs(604_800))
        );
        assert!("0h".parse::<Ttl>().is_err());
        assert!("h".parse::<Ttl>().is_err());
        assert!("soon".parse::<Ttl>().is_err());
        assert_eq!("48h".parse::<Ttl>().unwrap().to_string(), "48h");
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("ABC123F99"), "abc123f");
        assert!(is_short_sha("abc123f"));
        assert!(!is_short_sha("abc123"));
        assert!(!is_short_sha("xyz123f"));
    }

    #[test]
    fn test_time_remaining() {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let show = Show::building(1, "abc123f", created);
        assert_eq!(show.created_at.as_deref(), Some("2024-01-15T14-30"));
        assert_eq!(show.created_time(), Some(created));

        let now = created + chrono::Duration::hours(20);
        assert_eq!(
            show.time_remaining(now),
            Some(Duration::from_secs(4 * 3_600))
        );

        let later = created + chrono::Duration::hours(30);
        assert_eq!(show.time_remaining(later), Some(Duration::ZERO));

        let forever = show.with_ttl(Some(Ttl::Close));
        assert_eq!(forever.expires_at(), None);
    }
}
