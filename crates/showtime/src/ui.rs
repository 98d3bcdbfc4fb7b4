//! Console output helpers for the CLI.

use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::labels::PullRequestState;
use crate::show::{Show, ShowStatus, Ttl};

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
    println!("{}", "─".repeat(60).bright_black());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an informational line.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

fn colored_status(status: ShowStatus) -> String {
    let text = format!("{} {}", status.emoji(), status);
    match status {
        ShowStatus::Running => text.green().to_string(),
        ShowStatus::Building | ShowStatus::Updating => text.yellow().to_string(),
        ShowStatus::Failed => text.red().to_string(),
        ShowStatus::Stopped => text.bright_black().to_string(),
    }
}

/// Human readable remaining time, e.g. `3h 20m`.
#[must_use]
pub fn format_remaining(show: &Show, now: DateTime<Utc>) -> String {
    if show.ttl == Some(Ttl::Close) {
        return "until PR closes".to_string();
    }
    match show.time_remaining(now) {
        Some(remaining) if remaining.is_zero() => "expired".to_string(),
        Some(remaining) => {
            let minutes = remaining.as_secs() / 60;
            format!("{}h {}m", minutes / 60, minutes % 60)
        }
        None => "unknown".to_string(),
    }
}

/// Print one show.
pub fn print_show(label: &str, show: &Show, verbose: bool) {
    println!("{:<10} {}", label.bold(), colored_status(show.status));
    println!("  {:<12} {}", "sha".bright_black(), show.sha);
    if let Some(url) = show.url() {
        println!("  {:<12} {}", "url".bright_black(), url.cyan());
    }
    if let Some(user) = &show.requested_by {
        println!("  {:<12} {user}", "requested by".bright_black());
    }
    if verbose {
        println!("  {:<12} {}", "service".bright_black(), show.aws_service_name());
        if let Some(created) = &show.created_at {
            println!("  {:<12} {created}", "created".bright_black());
        }
        if let Some(ttl) = show.ttl {
            println!(
                "  {:<12} {ttl} ({})",
                "ttl".bright_black(),
                format_remaining(show, Utc::now())
            );
        }
        println!("  {:<12} {}", "config".bright_black(), show.config);
    }
}

/// Print the decoded state of a PR.
pub fn print_state(state: &PullRequestState, verbose: bool) {
    print_section(&format!("🎪 PR #{}", state.pr_number));
    if !state.has_shows() {
        print_info("No environment");
    }
    if let Some(current) = state.current_show() {
        print_show("current", current, verbose);
    }
    if let Some(building) = state.building_show() {
        print_show("building", building, verbose);
    }
    let triggers = state.triggers();
    if !triggers.is_empty() {
        let pending: Vec<String> = triggers.iter().map(ToString::to_string).collect();
        print_warning(&format!("Pending triggers: {}", pending.join(", ")));
    }
}

/// Print the label reference.
pub fn print_label_reference() {
    print_section("🎪 Trigger labels");
    for (label, meaning) in [
        ("🎪 trigger-start", "Create an environment for the PR head"),
        ("🎪 trigger-stop", "Destroy the environment and clear its labels"),
        ("🎪 trigger-sync", "Move the environment to the latest commit"),
        ("🎪 conf-enable-<FEATURE>", "Turn a feature flag on"),
        ("🎪 conf-disable-<FEATURE>", "Turn a feature flag off"),
        ("🎪 conf-debug-on / conf-debug-off", "Toggle debug mode"),
        ("🎪 conf-size-<SIZE>", "Record the environment size"),
    ] {
        println!("  {:<36} {}", label.cyan(), meaning);
    }

    print_section("🎪 State labels (managed by showtime)");
    for (label, meaning) in [
        ("🎪 🚦 <status>", "building, running, updating, failed, stopped"),
        ("🎪 🎯 <sha>", "Commit of the live environment"),
        ("🎪 🏗️ <sha>", "Commit being deployed as a replacement"),
        ("🎪 📅 <timestamp>", "Creation time (YYYY-MM-DDTHH-MM)"),
        ("🎪 🌐 <ip>", "Public address, dots written as dashes"),
        ("🎪 ⌛ <ttl>", "24h, 48h, 1w, close"),
        ("🎪 👤 <user>", "Who requested the environment"),
        ("🎪 ⚙️ <config>", "Non-default configuration tokens"),
    ] {
        println!("  {:<36} {}", label.cyan(), meaning);
    }
}
