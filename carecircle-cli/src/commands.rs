//! Command implementations

use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use serde_json::Value;

use carecircle_sync::{
    ActionType, ChannelStatus, Connectivity, EntityKind, Submission, SyncConfig, SyncCore,
    SyncOutcome,
};

use crate::display;

pub struct Context {
    pub config: SyncConfig,
    pub connectivity: Connectivity,
    pub json: bool,
}

impl Context {
    async fn open(&self) -> Result<SyncCore> {
        SyncCore::open(self.config.clone(), self.connectivity)
            .await
            .with_context(|| format!("Failed to open sync database {}", self.config.database_path))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn status(ctx: &Context) -> Result<()> {
    let core = ctx.open().await?;
    let state = core.state();

    if ctx.json {
        print_json(&state)?;
    } else {
        display::print_state(&state, &ctx.config);
    }

    core.shutdown().await;
    Ok(())
}

pub async fn queue(ctx: &Context) -> Result<()> {
    let core = ctx.open().await?;
    let actions = core.queue().list().await?;

    if ctx.json {
        print_json(&actions)?;
    } else if actions.is_empty() {
        println!("{}", "Queue is empty".dimmed());
    } else {
        display::print_actions(&actions);
    }

    core.shutdown().await;
    Ok(())
}

pub async fn enqueue(ctx: &Context, action_type: ActionType, payload: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("--payload is not valid JSON")?;
    if !payload.is_object() {
        bail!("--payload must be a JSON object");
    }

    let core = ctx.open().await?;
    let submission = core.submit(action_type, payload).await?;

    if ctx.json {
        print_json(&submission)?;
    } else {
        match &submission {
            Submission::Sent { action_id, .. } => {
                println!("{} {} ({})", "✓ Sent".green().bold(), action_type, action_id);
            }
            Submission::Queued { action_id } => {
                println!("{} {} ({})", "⏸ Queued".yellow().bold(), action_type, action_id);
                println!("  {} pending", core.state().pending_count);
            }
        }
    }

    core.shutdown().await;
    Ok(())
}

pub async fn sync(ctx: &Context) -> Result<()> {
    let core = ctx.open().await?;
    let outcome = core.sync().await?;
    let state = core.state();

    if ctx.json {
        let report = outcome.report();
        print_json(&serde_json::json!({
            "outcome": match outcome {
                SyncOutcome::Completed(_) => "completed",
                SyncOutcome::AlreadyRunning => "already-running",
                SyncOutcome::Offline => "offline",
                SyncOutcome::Closed => "closed",
            },
            "report": report,
            "lastError": state.last_error,
        }))?;
    } else {
        match &outcome {
            SyncOutcome::Completed(report) => display::print_report(report, state.last_error.as_ref()),
            SyncOutcome::AlreadyRunning => println!("{}", "Another sync is running".yellow()),
            SyncOutcome::Offline => println!("{}", "Offline, nothing replayed".yellow()),
            SyncOutcome::Closed => println!("{}", "Sync core is shutting down".yellow()),
        }
    }

    core.shutdown().await;
    Ok(())
}

pub async fn cache_get(ctx: &Context, kind: EntityKind, scope: &str) -> Result<()> {
    let core = ctx.open().await?;
    let entry = core.cache().get::<Value>(kind, scope).await?;

    match (&entry, ctx.json) {
        (_, true) => print_json(&entry)?,
        (Some(entry), false) => {
            println!(
                "{} {} cached {}",
                kind.to_string().cyan().bold(),
                scope,
                display::relative(entry.cached_at)
            );
            println!("{}", serde_json::to_string_pretty(&entry.data)?);
        }
        (None, false) => println!("{}", format!("No cached {kind} for {scope}").dimmed()),
    }

    core.shutdown().await;
    Ok(())
}

pub async fn listen(ctx: &Context, scope: &str, seconds: Option<u64>) -> Result<()> {
    let core = ctx.open().await?;
    let subscription = core.subscribe_realtime(scope);
    let mut status = subscription.status_watch();

    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    println!("{} {}", "Listening on".bold(), scope.cyan());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = &mut deadline => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if ctx.json {
                    println!("{}", serde_json::json!({ "status": format!("{current:?}") }));
                } else {
                    display::print_channel_status(&current);
                }
                if current == ChannelStatus::Closed {
                    break;
                }
            }
        }
    }

    subscription.unsubscribe().await;
    core.shutdown().await;
    Ok(())
}

pub async fn logout(ctx: &Context, yes: bool) -> Result<()> {
    if !yes {
        bail!("logout erases all pending actions and cached data; pass --yes to confirm");
    }

    let core = ctx.open().await?;
    let pending = core.state().pending_count;
    core.logout().await?;

    if ctx.json {
        print_json(&serde_json::json!({ "discardedActions": pending }))?;
    } else {
        println!("{} ({} pending actions discarded)", "✓ Local data erased".green().bold(), pending);
    }
    Ok(())
}

pub fn show_config(ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();
    if config.auth_token.is_some() {
        config.auth_token = Some("********".to_string());
    }

    if ctx.json {
        print_json(&config)?;
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}
