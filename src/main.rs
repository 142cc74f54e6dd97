//! `portal-call` command line client.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use portal_call::bridge::BridgeEvent;
use portal_call::directory::{Directory, DirectoryEntry, EntryKind};
use portal_call::session::LocalUser;
use portal_call::{AppConfig, CallApp, CallEvent};

#[derive(Parser)]
#[command(name = "portal-call", version, about = "Citizen portal calls from the terminal")]
struct Cli {
    /// Config file (defaults to ./portal-call.toml when present)
    #[arg(long, env = "PORTAL_CALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Portal user id to register as
    #[arg(long, env = "PORTAL_CALL_USER", global = true)]
    user: Option<String>,

    /// Display name shown to the people you call
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stay online and answer incoming calls
    Listen {
        #[arg(long)]
        auto_accept: bool,
    },
    /// Call someone from the directory
    Call {
        name: String,
        #[arg(long)]
        video: bool,
    },
    /// Manage the local directory
    Contacts {
        #[command(subcommand)]
        action: ContactsCommand,
    },
}

#[derive(Subcommand)]
enum ContactsCommand {
    Add {
        id: String,
        name: String,
        #[arg(long, value_parser = parse_kind, default_value = "person")]
        kind: EntryKind,
    },
    Search {
        query: String,
    },
}

fn parse_kind(raw: &str) -> Result<EntryKind, String> {
    match raw {
        "person" => Ok(EntryKind::Person),
        "group" => Ok(EntryKind::Group),
        "service" => Ok(EntryKind::Service),
        other => Err(format!("unknown kind '{other}' (person, group, service)")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    portal_call::init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load_from(cli.config.clone()).context("Failed to load configuration")?;

    match cli.command {
        Command::Contacts { action } => contacts(&config, action),
        Command::Listen { auto_accept } => {
            let app = CallApp::start(config, local_user(cli.user, cli.name)?).await?;
            println!("Online as {}. Commands: a=accept r=reject m=mute v=video s=speaker h=hang up", app.local().id);
            run(app, auto_accept, false).await
        }
        Command::Call { name, video } => {
            let app = CallApp::start(config, local_user(cli.user, cli.name)?).await?;
            let session = app
                .dispatch(BridgeEvent::StartCall {
                    recipient_name: name.clone(),
                    video,
                })
                .await
                .with_context(|| format!("Could not call {name}"))?;
            println!("Calling {name}... (h to hang up)");
            tracing::debug!(?session, "Outgoing call started");
            run(app, false, true).await
        }
    }
}

fn local_user(user: Option<String>, name: Option<String>) -> anyhow::Result<LocalUser> {
    let id = user.context("--user (or PORTAL_CALL_USER) is required")?;
    Ok(LocalUser {
        display_name: name.unwrap_or_else(|| id.clone()),
        id,
        avatar: None,
    })
}

fn contacts(config: &AppConfig, action: ContactsCommand) -> anyhow::Result<()> {
    let directory = CallApp::open_directory(&config.storage)?;
    match action {
        ContactsCommand::Add { id, name, kind } => {
            directory.upsert(&DirectoryEntry {
                id: id.clone(),
                name,
                kind,
                avatar: None,
            })?;
            println!("Saved {id}");
        }
        ContactsCommand::Search { query } => {
            let hits = directory.search(&query)?;
            if hits.is_empty() {
                println!("No matches for '{query}'");
            }
            for entry in hits {
                println!("{:<24} {:<32} {}", entry.id, entry.name, entry.kind.as_str());
            }
        }
    }
    Ok(())
}

/// Prints call events and maps keyboard input onto the call surface until
/// Ctrl-C, or until the call ends when `exit_on_end` is set.
async fn run(app: CallApp, auto_accept: bool, exit_on_end: bool) -> anyhow::Result<()> {
    let surface = app.surface();
    let mut events = app.service().subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, hanging up");
                break;
            }
            event = events.recv() => match event {
                Ok(CallEvent::IncomingCall { .. }) => {
                    if let Some(prompt) = surface.incoming() {
                        println!("{prompt}");
                    }
                    surface.on_shown().await?;
                    if auto_accept {
                        surface.on_accept().await?;
                    }
                }
                Ok(CallEvent::StateChanged { state, .. }) => println!("Call {state:?}"),
                Ok(CallEvent::InviteAutoRejected { from, .. }) => println!("{from} called while busy"),
                Ok(CallEvent::ParticipantJoined { participant_id, .. }) => println!("{participant_id} joined"),
                Ok(CallEvent::ParticipantLeft { participant_id, .. }) => println!("{participant_id} left"),
                Ok(CallEvent::Reconnecting { participant_id, attempt, .. }) => {
                    println!("Reconnecting to {participant_id} (attempt {attempt})")
                }
                Ok(CallEvent::ControlsChanged(controls)) => println!(
                    "muted={} video_off={} speaker={}",
                    controls.muted, controls.video_off, controls.speaker_on
                ),
                Ok(CallEvent::Ended { reason, .. }) => {
                    match reason.as_error() {
                        Some(error) => println!("Call ended: {error}"),
                        None => println!("Call ended ({reason:?})"),
                    }
                    if exit_on_end {
                        break;
                    }
                }
                Ok(CallEvent::InviteQueued { from, .. }) => println!("{from} is waiting"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                let result = match line.trim() {
                    "a" => surface.on_accept().await,
                    "r" => surface.on_reject().await,
                    "m" => surface.on_toggle_mute().await.map(|_| ()),
                    "v" => surface.on_toggle_video().await.map(|_| ()),
                    "s" => surface.on_toggle_speaker().await.map(|_| ()),
                    "h" => surface.on_end_call().await,
                    "" => Ok(()),
                    other => {
                        println!("Unknown command '{other}'");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    println!("{e}");
                }
            }
        }
    }

    app.shutdown().await;
    Ok(())
}
