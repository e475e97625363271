//! Human-readable output

use chrono::{DateTime, Utc};
use colored::Colorize;

use carecircle_sync::{
    ChannelStatus, ErrorKind, LastError, PendingAction, SyncConfig, SyncReport, SyncState,
};

/// "3m ago" style age of a timestamp.
pub fn relative(at: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(at);
    if age.num_seconds() < 0 {
        return format!("at {}", at.to_rfc3339());
    }
    match age.num_seconds() {
        0..=59 => format!("{}s ago", age.num_seconds()),
        60..=3599 => format!("{}m ago", age.num_minutes()),
        3600..=86_399 => format!("{}h ago", age.num_hours()),
        _ => format!("{}d ago", age.num_days()),
    }
}

fn error_kind(kind: ErrorKind) -> colored::ColoredString {
    match kind {
        ErrorKind::Transient => kind.to_string().yellow(),
        ErrorKind::Permanent | ErrorKind::Exhausted => kind.to_string().red(),
    }
}

pub fn print_last_error(error: &LastError) {
    println!(
        "  {} {} {} ({}): {}",
        "last error".bold(),
        error_kind(error.kind),
        error.action_type,
        error.action_id,
        error.message
    );
}

pub fn print_state(state: &SyncState, config: &SyncConfig) {
    println!("{}", "Sync status".bold().cyan());
    println!("  database     {}", config.database_path);
    println!("  api          {}", config.api_base_url);
    println!(
        "  pending      {}",
        if state.pending_count == 0 {
            "0".green()
        } else {
            state.pending_count.to_string().yellow()
        }
    );
    println!(
        "  last sync    {}",
        state
            .last_sync_at
            .map_or_else(|| "never".dimmed().to_string(), relative)
    );
    if let Some(error) = &state.last_error {
        print_last_error(error);
    }
}

pub fn print_actions(actions: &[PendingAction]) {
    println!(
        "{:<4} {:<30} {:<22} {:>7}  {}",
        "#".bold(),
        "ID".bold(),
        "TYPE".bold(),
        "RETRIES".bold(),
        "NEXT ATTEMPT".bold()
    );
    for (position, action) in actions.iter().enumerate() {
        let next = action
            .next_attempt_at
            .map_or_else(|| "due".to_string(), |at| at.to_rfc3339());
        println!(
            "{:<4} {:<30} {:<22} {:>7}  {}",
            position + 1,
            action.id,
            action.action_type,
            action.retry_count,
            next
        );
        if let Some(error) = &action.last_error {
            println!("     {}", error.dimmed());
        }
    }
}

pub fn print_report(report: &SyncReport, last_error: Option<&LastError>) {
    let headline = if report.halted {
        "⏸ Sync halted".yellow().bold()
    } else {
        "✓ Sync complete".green().bold()
    };
    println!(
        "{headline}: {} replayed, {} dropped, {} remaining",
        report.replayed, report.dropped, report.remaining
    );
    if let Some(at) = report.deferred_until {
        println!("  next attempt {}", at.to_rfc3339());
    }
    if let Some(error) = last_error {
        print_last_error(error);
    }
}

pub fn print_channel_status(status: &ChannelStatus) {
    match status {
        ChannelStatus::Connecting => println!("{}", "connecting".dimmed()),
        ChannelStatus::Connected => println!("{}", "connected".green()),
        ChannelStatus::Reconnecting { attempt, delay } => println!(
            "{} attempt {} in {:?}",
            "reconnecting".yellow(),
            attempt,
            delay
        ),
        ChannelStatus::Closed => println!("{}", "closed".dimmed()),
    }
}
