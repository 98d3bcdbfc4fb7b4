//! Label codec: `🎪` marker labels ⇄ [`Show`] / [`PullRequestState`].
//!
//! Every state label has the form `🎪 <glyph> <value>`:
//!
//! | glyph | field        | example                 |
//! |-------|--------------|-------------------------|
//! | 🚦    | status       | `🎪 🚦 running`          |
//! | 🎯    | active sha   | `🎪 🎯 abc123f`          |
//! | 🏗️    | building sha | `🎪 🏗️ def456a`          |
//! | 📅    | created      | `🎪 📅 2024-01-15T14-30` |
//! | 🌐    | ip           | `🎪 🌐 52-1-2-3`         |
//! | ⌛    | ttl          | `🎪 ⌛ 24h`              |
//! | 👤    | requester    | `🎪 👤 maxime`           |
//! | ⚙️    | config       | `🎪 ⚙️ alerts,debug`     |
//!
//! Decoding never fails: labels that do not parse are skipped.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::trace;

use super::state::PullRequestState;
use super::trigger::Trigger;
use super::CIRCUS_PREFIX;
use crate::show::{is_short_sha, parse_created_at, short_sha, Show, ShowStatus, Ttl};
use crate::show_config::ShowConfig;

const STATUS: &str = "🚦";
const ACTIVE_SHA: &str = "🎯";
const BUILDING_SHA: &str = "\u{1f3d7}\u{fe0f}";
const CREATED: &str = "📅";
const IP: &str = "🌐";
const TTL: &str = "⌛";
const REQUESTER: &str = "👤";
const LEGACY_REQUESTER: &str = "🤡";
const CONFIG: &str = "\u{2699}\u{fe0f}";

/// Why a single label was skipped during decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("not a showtime label")]
    Foreign,
    #[error("trigger label")]
    Trigger,
    #[error("unknown marker '{0}'")]
    UnknownMarker(String),
    #[error("invalid value '{value}' for {marker} marker")]
    InvalidValue { marker: &'static str, value: String },
}

/// One decoded state label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Marker {
    Status(ShowStatus),
    ActiveSha(String),
    BuildingSha(String),
    CreatedAt(String),
    Ip(Ipv4Addr),
    Ttl(Ttl),
    Requester(String),
    Config(ShowConfig),
}

/// Whether the label belongs to the showtime namespace.
#[must_use]
pub fn is_circus_label(label: &str) -> bool {
    label.starts_with(CIRCUS_PREFIX)
}

/// Whether the label is showtime state (as opposed to a pending trigger).
///
/// State labels are rewritten wholesale on every transition; malformed ones
/// are included so that they get cleaned up.
#[must_use]
pub fn is_state_label(label: &str) -> bool {
    is_circus_label(label) && Trigger::from_label(label).is_none()
}

fn marker_label(glyph: &str, value: impl std::fmt::Display) -> String {
    format!("{CIRCUS_PREFIX}{glyph} {value}")
}

pub(crate) fn parse_marker(label: &str) -> Result<Marker, DecodeError> {
    let body = label.strip_prefix(CIRCUS_PREFIX).ok_or(DecodeError::Foreign)?;
    if Trigger::from_label(label).is_some() {
        return Err(DecodeError::Trigger);
    }
    let (glyph, value) = body
        .split_once(' ')
        .ok_or_else(|| DecodeError::UnknownMarker(body.to_string()))?;
    let value = value.trim();
    let invalid = |marker: &'static str| DecodeError::InvalidValue {
        marker,
        value: value.to_string(),
    };

    // Variation selectors are optional on input.
    match glyph.trim_end_matches('\u{fe0f}') {
        STATUS => value
            .parse()
            .map(Marker::Status)
            .map_err(|_| invalid("status")),
        ACTIVE_SHA => sha_value(value)
            .map(Marker::ActiveSha)
            .ok_or_else(|| invalid("active sha")),
        "\u{1f3d7}" => sha_value(value)
            .map(Marker::BuildingSha)
            .ok_or_else(|| invalid("building sha")),
        CREATED => parse_created_at(value)
            .map(|_| Marker::CreatedAt(value.to_string()))
            .ok_or_else(|| invalid("created")),
        IP => value
            .replace('-', ".")
            .parse()
            .map(Marker::Ip)
            .map_err(|_| invalid("ip")),
        TTL => value.parse().map(Marker::Ttl).map_err(|_| invalid("ttl")),
        REQUESTER | LEGACY_REQUESTER => {
            if value.is_empty() || value.contains(char::is_whitespace) {
                Err(invalid("requester"))
            } else {
                Ok(Marker::Requester(value.to_string()))
            }
        }
        "\u{2699}" => Ok(Marker::Config(ShowConfig::parse(value))),
        other => Err(DecodeError::UnknownMarker(other.to_string())),
    }
}

fn sha_value(value: &str) -> Option<String> {
    let sha = value.to_lowercase();
    is_short_sha(&sha).then_some(sha)
}

/// Values seen for each marker. Single-valued fields that appear more than
/// once resolve to the smallest value so the result does not depend on label
/// order.
#[derive(Default)]
struct Collected {
    status: BTreeSet<ShowStatus>,
    active: BTreeSet<String>,
    building: BTreeSet<String>,
    created_at: BTreeSet<String>,
    ip: BTreeSet<Ipv4Addr>,
    ttl: BTreeSet<String>,
    requester: BTreeSet<String>,
    config: Vec<ShowConfig>,
}

/// Decode a PR's full label set.
///
/// `override_sha` forces the current show's commit even when no active-sha
/// marker is present, e.g. right after labels were written and before the
/// store reflects them.
#[must_use]
pub fn decode<S: AsRef<str>>(
    pr_number: u64,
    labels: &[S],
    override_sha: Option<&str>,
) -> PullRequestState {
    let mut seen = Collected::default();

    for label in labels {
        let label = label.as_ref();
        match parse_marker(label) {
            Ok(Marker::Status(status)) => {
                seen.status.insert(status);
            }
            Ok(Marker::ActiveSha(sha)) => {
                seen.active.insert(sha);
            }
            Ok(Marker::BuildingSha(sha)) => {
                seen.building.insert(sha);
            }
            Ok(Marker::CreatedAt(created)) => {
                seen.created_at.insert(created);
            }
            Ok(Marker::Ip(ip)) => {
                seen.ip.insert(ip);
            }
            Ok(Marker::Ttl(ttl)) => {
                seen.ttl.insert(ttl.to_string());
            }
            Ok(Marker::Requester(user)) => {
                seen.requester.insert(user);
            }
            Ok(Marker::Config(config)) => seen.config.push(config),
            Err(DecodeError::Foreign | DecodeError::Trigger) => {}
            Err(e) => trace!(pr_number, label, error = %e, "Skipping label"),
        }
    }

    let first = |set: &BTreeSet<String>| set.iter().next().cloned();
    let created_at = first(&seen.created_at);
    let ttl = seen.ttl.iter().next().and_then(|t| t.parse::<Ttl>().ok());
    let requested_by = first(&seen.requester);
    let config = seen
        .config
        .into_iter()
        .min_by_key(ToString::to_string)
        .unwrap_or_default();

    let current_sha = override_sha.map(short_sha).or_else(|| first(&seen.active));
    let building_sha = first(&seen.building).filter(|sha| Some(sha) != current_sha.as_ref());

    let current = current_sha.map(|sha| Show {
        pr_number,
        sha,
        // A SHA without a status is a half-written start.
        status: seen
            .status
            .iter()
            .next()
            .copied()
            .unwrap_or(ShowStatus::Building),
        ip: seen.ip.iter().next().copied(),
        created_at: created_at.clone(),
        ttl,
        requested_by: requested_by.clone(),
        config: config.clone(),
    });

    let building = building_sha.map(|sha| Show {
        pr_number,
        sha,
        status: ShowStatus::Building,
        ip: None,
        created_at,
        ttl,
        requested_by,
        config,
    });

    PullRequestState::new(
        pr_number,
        labels.iter().map(|l| l.as_ref().to_string()).collect(),
        current,
        building,
    )
}

/// Encode one show as its state labels, in fixed field order.
#[must_use]
pub fn encode(show: &Show) -> Vec<String> {
    encode_fields(show, ACTIVE_SHA)
}

fn encode_fields(show: &Show, sha_glyph: &str) -> Vec<String> {
    let mut labels = vec![
        marker_label(STATUS, show.status),
        marker_label(sha_glyph, &show.sha),
    ];
    if let Some(created_at) = &show.created_at {
        labels.push(marker_label(CREATED, created_at));
    }
    if let Some(ip) = show.ip {
        labels.push(marker_label(IP, ip.to_string().replace('.', "-")));
    }
    if let Some(ttl) = show.ttl {
        labels.push(marker_label(TTL, ttl));
    }
    if let Some(user) = &show.requested_by {
        labels.push(marker_label(REQUESTER, user));
    }
    if !show.config.is_standard() {
        labels.push(marker_label(CONFIG, &show.config));
    }
    labels
}

/// Encode a PR's full show state, including an in-flight replacement.
///
/// With both shows present the current show's fields are written and the
/// building show contributes only its SHA marker; the building show shares
/// the current show's creation time, ttl, requester and config on decode.
#[must_use]
pub fn encode_state(current: Option<&Show>, building: Option<&Show>) -> Vec<String> {
    match (current, building) {
        (Some(current), Some(building)) => {
            let mut labels = encode(current);
            labels.insert(2, marker_label(BUILDING_SHA, &building.sha));
            labels
        }
        (Some(current), None) => encode(current),
        (None, Some(building)) => encode_fields(building, BUILDING_SHA),
        (None, None) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_show() -> Show {
        Show {
            pr_number: 1234,
            sha: "abc123f".to_string(),
            status: ShowStatus::Running,
            ip: Some(Ipv4Addr::new(52, 1, 2, 3)),
            created_at: Some("2024-01-15T14-30".to_string()),
            ttl: Some("48h".parse().unwrap()),
            requested_by: Some("maxime".to_string()),
            config: ShowConfig::parse("debug,alerts"),
        }
    }

    #[test]
    fn test_decode_full_label_set() {
        let labels = [
            "🎪 🚦 running",
            "🎪 🎯 abc123f",
            "🎪 📅 2024-01-15T14-30",
            "🎪 🌐 52-1-2-3",
            "🎪 ⌛ 24h",
            "🎪 👤 maxime",
            "some-other-label",
        ];

        let state = decode(1234, &labels, None);
        let show = state.current_show().expect("current show");
        assert_eq!(show.status, ShowStatus::Running);
        assert_eq!(show.sha, "abc123f");
        assert_eq!(show.created_at.as_deref(), Some("2024-01-15T14-30"));
        assert_eq!(show.ip, Some(Ipv4Addr::new(52, 1, 2, 3)));
        assert_eq!(show.ttl, Some(Ttl::DEFAULT));
        assert_eq!(show.requested_by.as_deref(), Some("maxime"));
        assert!(show.config.is_standard());
        assert_eq!(state.shows().len(), 1);
    }

    #[test]
    fn test_decode_canonicalises_config() {
        let labels = ["🎪 🚦 running", "🎪 🎯 def456a", "🎪 ⚙️ debug,alerts"];
        let state = decode(1234, &labels, Some("def456a"));
        let show = state.current_show().unwrap();
        assert_eq!(show.config.to_string(), "alerts,debug");
    }

    #[test]
    fn test_decode_dual_sha() {
        let labels = ["🎪 🚦 updating", "🎪 🎯 abc123f", "🎪 🏗️ def456a"];
        let state = decode(1234, &labels, None);

        assert_eq!(state.shows().len(), 2);
        let current = state.current_show().unwrap();
        assert_eq!(current.sha, "abc123f");
        assert_eq!(current.status, ShowStatus::Updating);
        let building = state.building_show().unwrap();
        assert_eq!(building.sha, "def456a");
        assert_eq!(building.status, ShowStatus::Building);
    }

    #[test]
    fn test_building_marker_overrides_stale_status() {
        let labels = ["🎪 🚦 running", "🎪 🏗️ def456a"];
        let state = decode(7, &labels, None);
        assert!(state.current_show().is_none());
        assert_eq!(state.building_show().unwrap().status, ShowStatus::Building);
    }

    #[test]
    fn test_decode_without_circus_labels() {
        let labels = ["bug", "enhancement", "documentation"];
        let state = decode(1234, &labels, None);
        assert!(state.shows().is_empty());
        assert!(state.current_show().is_none());
        assert!(!state.has_shows());
    }

    #[test]
    fn test_decode_ignores_malformed_labels() {
        let labels = [
            "🎪 🚦 exploding",
            "🎪 🎯 not-a-sha",
            "🎪 🌐 999-1-2-3",
            "🎪 📅 yesterday",
            "🎪 🦄 unicorn",
            "🎪 🎯 abc123f",
        ];
        let state = decode(5, &labels, None);
        let show = state.current_show().unwrap();
        assert_eq!(show.sha, "abc123f");
        assert_eq!(show.status, ShowStatus::Building);
        assert_eq!(show.ip, None);
        assert_eq!(show.created_at, None);
    }

    #[test]
    fn test_override_sha_without_marker() {
        let labels = ["🎪 🚦 building", "🎪 ⌛ 24h"];
        let state = decode(9, &labels, Some("ABC123F0000000"));
        assert_eq!(state.current_show().unwrap().sha, "abc123f");
    }

    #[test]
    fn test_decode_is_order_independent() {
        let mut labels = encode(&sample_show());
        labels.push("🎪 🚦 failed".to_string());
        let forward = decode(1234, &labels, None);
        labels.reverse();
        let backward = decode(1234, &labels, None);
        assert_eq!(forward.current_show(), backward.current_show());
    }

    #[test]
    fn test_legacy_requester_glyph() {
        let labels = ["🎪 🎯 abc123f", "🎪 🤡 maxime"];
        let state = decode(1, &labels, None);
        assert_eq!(
            state.current_show().unwrap().requested_by.as_deref(),
            Some("maxime")
        );
    }

    #[test]
    fn test_encode_field_order() {
        let labels = encode(&sample_show());
        assert_eq!(
            labels,
            vec![
                "🎪 🚦 running",
                "🎪 🎯 abc123f",
                "🎪 📅 2024-01-15T14-30",
                "🎪 🌐 52-1-2-3",
                "🎪 ⌛ 48h",
                "🎪 👤 maxime",
                "🎪 ⚙️ alerts,debug",
            ]
        );
    }

    #[test]
    fn test_encode_omits_unset_fields() {
        let show = Show {
            ip: None,
            created_at: None,
            ttl: None,
            requested_by: None,
            config: ShowConfig::standard(),
            ..sample_show()
        };
        assert_eq!(encode(&show), vec!["🎪 🚦 running", "🎪 🎯 abc123f"]);
    }

    #[test]
    fn test_encode_state_dual_window() {
        let current = Show {
            status: ShowStatus::Updating,
            ..sample_show()
        };
        let building = Show {
            sha: "def456a".to_string(),
            status: ShowStatus::Building,
            ip: None,
            ..sample_show()
        };

        let labels = encode_state(Some(&current), Some(&building));
        assert_eq!(labels[2], "🎪 🏗️ def456a");

        let state = decode(1234, &labels, None);
        assert_eq!(state.current_show(), Some(&current));
        assert_eq!(state.building_show(), Some(&building));
    }

    #[test]
    fn test_encode_state_building_only() {
        let building = Show::building(3, "def456a", chrono::Utc::now());
        let labels = encode_state(None, Some(&building));
        let state = decode(3, &labels, None);
        assert!(state.current_show().is_none());
        assert_eq!(state.building_show(), Some(&building));
    }

    #[test]
    fn test_state_label_classification() {
        assert!(is_state_label("🎪 🚦 running"));
        assert!(is_state_label("🎪 🦄 unicorn"));
        assert!(!is_state_label("🎪 trigger-start"));
        assert!(!is_state_label("🎪 conf-debug-on"));
        assert!(!is_state_label("bug"));
    }

    fn arb_show() -> impl Strategy<Value = Show> {
        let status = prop_oneof![
            Just(ShowStatus::Building),
            Just(ShowStatus::Running),
            Just(ShowStatus::Updating),
            Just(ShowStatus::Failed),
            Just(ShowStatus::Stopped),
        ];
        let ttl = prop_oneof![
            Just(Ttl::Close),
            (1u32..500, 0usize..4).prop_map(|(n, unit)| {
                format!("{n}{}", ['m', 'h', 'd', 'w'][unit]).parse().unwrap()
            }),
        ];
        let config = prop::collection::vec(
            prop_oneof![
                "[a-z_]{1,12}",
                "no-[a-z_]{1,12}",
                Just("debug".to_string()),
                "size-[a-z]{1,6}",
            ],
            0..4,
        )
        .prop_map(|tokens| ShowConfig::parse(&tokens.join(",")));
        let created = (2000i32..2100, 1u32..13, 1u32..29, 0u32..24, 0u32..60)
            .prop_map(|(y, mo, d, h, mi)| format!("{y:04}-{mo:02}-{d:02}T{h:02}-{mi:02}"));

        (
            1u64..1_000_000,
            "[0-9a-f]{7}",
            status,
            prop::option::of(any::<[u8; 4]>().prop_map(Ipv4Addr::from)),
            prop::option::of(created),
            prop::option::of(ttl),
            prop::option::of("[A-Za-z0-9-]{1,20}"),
            config,
        )
            .prop_map(
                |(pr_number, sha, status, ip, created_at, ttl, requested_by, config)| Show {
                    pr_number,
                    sha,
                    status,
                    ip,
                    created_at,
                    ttl,
                    requested_by,
                    config,
                },
            )
    }

    proptest! {
        #[test]
        fn prop_encode_decode_round_trip(show in arb_show()) {
            let labels = encode(&show);
            let state = decode(show.pr_number, &labels, Some(&show.sha));
            prop_assert_eq!(state.current_show(), Some(&show));
            prop_assert_eq!(state.shows().len(), 1);
        }
    }
}
