mod app;
mod config;
mod dcc;
mod irc;
mod logging;

use crate::app::action::Action;
use crate::app::event::AppEvent;
use crate::app::handler;
use crate::app::state::RunState;
use crate::config::{Cli, Settings};
use crate::dcc::manager::DccManager;
use crate::irc::manager::IrcManager;
use anyhow::Result;
use clap::Parser;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long to wait for the server to close the link after QUIT.
const QUIT_GRACE: Duration = Duration::from_secs(2);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = config::load_config()?;
    let settings = Settings::resolve(cli, file)?;

    logging::init_logging(settings.log_level);
    for warning in &settings.warnings {
        warn!("{}", warning);
    }

    // The irc crate may pull in a second rustls provider; pin ours.
    let _ = rustls::crypto::ring::default_provider().install_default();

    dcc::security::ensure_download_dir(&settings.dcc.download_dir)?;

    match run_app(&settings).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Drive one run to the end. Returns whether every requested download
/// finished successfully.
async fn run_app(settings: &Settings) -> Result<bool> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AppEvent>();

    let mut state = RunState::new(settings, Instant::now());
    let mut irc_manager = IrcManager::new(event_tx);
    let mut dcc = DccManager::new(settings.dcc.clone(), settings.downloads.len());

    info!(
        "Connecting to {}:{} as {}",
        settings.irc.server, settings.irc.port, settings.irc.nickname
    );
    irc_manager.connect(&settings.irc).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut quit_sent: Option<Instant> = None;
    let mut disconnected = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, stopping all transfers");
                dcc.cancel_all();
                irc_manager.send_quit("Interrupted");
                return Ok(false);
            }
            event = event_rx.recv(), if !disconnected => {
                match event {
                    Some(AppEvent::IrcMessage { message }) => {
                        if let Err(e) = handler::handle_irc_message(&mut state, &mut dcc, message) {
                            dcc.cancel_all();
                            irc_manager.send_quit("Goodbye!");
                            return Err(e);
                        }
                    }
                    Some(AppEvent::IrcConnected) => debug!("Connected, waiting for registration"),
                    Some(AppEvent::IrcError { error }) => warn!("IRC error: {}", error),
                    Some(AppEvent::IrcDisconnected { reason }) => {
                        if quit_sent.is_none() {
                            warn!("Disconnected from server: {}", reason);
                        }
                        disconnected = true;
                    }
                    None => disconnected = true,
                }
            }
            _ = dcc.tick() => {}
        }

        handler::poll_send_delay(&mut state, Instant::now());
        let actions = state.take_actions().into_iter().chain(dcc.take_actions());
        for action in actions {
            if let Err(e) = irc_manager.execute(action) {
                warn!("Failed to send to server: {}", e);
            }
        }

        if quit_sent.is_none() && dcc.is_settled() {
            info!(
                "{} of {} downloads finished successfully",
                dcc.succeeded(),
                settings.downloads.len()
            );
            let _ = irc_manager.execute(Action::Quit {
                message: "Goodbye!".to_string(),
            });
            quit_sent = Some(Instant::now());
        }

        if quit_sent.is_some_and(|at| disconnected || at.elapsed() >= QUIT_GRACE) {
            break;
        }
        // Transfers outlive the IRC link, but nothing new can arrive.
        if disconnected && quit_sent.is_none() && dcc.active_sessions() == 0 && !dcc.checksums_pending() {
            dcc.cancel_all();
            break;
        }
    }

    Ok(dcc.is_run_complete())
}
