use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::{ActorId, RoomId};
use sync_core::{
    AuthServiceCredentials, Credential, CredentialProvider, GameSession, SessionContext,
    StaticCredentials, StoreEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::Command;

#[derive(Parser, Debug)]
#[command(about = "Join a territory room and play from the terminal")]
struct Args {
    #[arg(long, default_value = "console.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    room: Option<String>,
    /// Bearer token issued by the auth service.
    #[arg(long)]
    token: Option<String>,
    /// Session cookie; exchanged for a fresh token before every connection.
    #[arg(long)]
    session_cookie: Option<String>,
    #[arg(long)]
    actor_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config);
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.room {
        settings.room = v;
    }
    if args.token.is_some() {
        settings.token = args.token;
    }
    if args.session_cookie.is_some() {
        settings.session_cookie = args.session_cookie;
    }
    if args.actor_id.is_some() {
        settings.actor_id = args.actor_id;
    }

    let sync_config = settings.sync_config()?;
    let (credentials, local_actor) = credentials_for(&settings).await?;
    match &local_actor {
        Some(actor) => info!(actor = %actor, "console: playing"),
        None => warn!("console: no identity configured, joining as spectator"),
    }

    let context = SessionContext::new(local_actor.clone(), RoomId::new(settings.room.clone()));
    let session = GameSession::join(sync_config, context, credentials)
        .await
        .with_context(|| format!("failed to join room '{}'", settings.room))?;
    println!("joined room '{}'", settings.room);
    println!("{}", commands::HELP);
    println!(
        "{}",
        commands::render_board(&session.store().board().await, local_actor.as_ref())
    );

    let printer = tokio::spawn(print_changes(
        session.store(),
        session.watch_connection(),
        local_actor.clone(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match commands::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let outcome = match command {
            Command::Capture(coord) => session.capture(coord).await,
            Command::Defend(coord) => session.defend(coord).await,
            Command::Reset => session.reset().await,
            Command::Board => {
                let board = session.store().board().await;
                println!("{}", commands::render_board(&board, local_actor.as_ref()));
                continue;
            }
            Command::Status => {
                let status = session.connection_status();
                let view = session.store().view().await;
                println!(
                    "connection: {:?}{}; processing: {}; resetting: {}",
                    status.state,
                    status
                        .last_error
                        .map(|err| format!(" ({err})"))
                        .unwrap_or_default(),
                    view.processing,
                    view.resetting
                );
                continue;
            }
            Command::Help => {
                println!("{}", commands::HELP);
                continue;
            }
            Command::Quit => break,
        };
        match outcome {
            Ok(status) => println!("{status:?}"),
            Err(err) => println!("error: {err}"),
        }
    }

    session.leave().await;
    printer.abort();
    Ok(())
}

async fn credentials_for(
    settings: &config::Settings,
) -> Result<(Arc<dyn CredentialProvider>, Option<ActorId>)> {
    if let Some(cookie) = &settings.session_cookie {
        let auth = AuthServiceCredentials::new(&settings.auth_base()?, cookie.clone())
            .context("failed to configure auth service")?;
        let actor = match &settings.actor_id {
            Some(actor) => ActorId::new(actor.clone()),
            None => auth
                .actor_id()
                .await
                .context("failed to resolve the session's user")?,
        };
        let provider: Arc<dyn CredentialProvider> = Arc::new(auth);
        return Ok((provider, Some(actor)));
    }

    let credential = match &settings.token {
        Some(token) => Credential::bearer(token.clone()),
        None => Credential::anonymous(),
    };
    let actor = settings.actor_id.clone().map(ActorId::new);
    let provider: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials(credential));
    Ok((provider, actor))
}

async fn print_changes(
    store: Arc<sync_core::BoardStore>,
    mut connection: tokio::sync::watch::Receiver<sync_core::ConnectionStatus>,
    me: Option<ActorId>,
) {
    let mut events = store.subscribe();
    loop {
        tokio::select! {
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = connection.borrow_and_update().clone();
                match status.last_error {
                    Some(err) => println!("[connection] {:?}: {err}", status.state),
                    None => println!("[connection] {:?}", status.state),
                }
            }
            event = events.recv() => match event {
                Ok(StoreEvent::BoardReplaced { .. }) => {
                    println!("{}", commands::render_board(&store.board().await, me.as_ref()));
                }
                Ok(StoreEvent::CellUpdated { cell, .. }) => {
                    let owner = cell.owner_id.as_ref().map_or("nobody", ActorId::as_str);
                    println!(
                        "[cell] ({}, {}) owner={owner} defense={}",
                        cell.x, cell.y, cell.defense_bonus
                    );
                }
                Ok(StoreEvent::ResettingChanged(true)) => println!("[world] resetting..."),
                Ok(StoreEvent::ErrorChanged(Some(message))) => println!("[error] {message}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console: display fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
