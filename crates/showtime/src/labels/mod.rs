//! # PR label state
//!
//! Showtime keeps no database. Everything it knows about an environment lives
//! in the PR's labels, all prefixed with the circus tent (`🎪`):
//!
//! - **State labels** (`🎪 🚦 running`, `🎪 🎯 abc123f`, ...) describe the
//!   current and in-flight environments. They are decoded into a
//!   [`PullRequestState`] and rewritten as a whole after each transition.
//! - **Trigger labels** (`🎪 trigger-start`, `🎪 conf-enable-ALERTS`, ...)
//!   request an action and are removed when the action is claimed.

pub mod codec;
pub mod state;
pub mod trigger;

/// Prefix shared by every showtime label.
pub const CIRCUS_PREFIX: &str = "🎪 ";

pub use codec::{decode, encode, encode_state, is_circus_label, is_state_label};
pub use state::PullRequestState;
pub use trigger::Trigger;
