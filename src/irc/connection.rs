use crate::app::event::AppEvent;
use crate::config::IrcSettings;
use anyhow::{Context, Result};
use futures::StreamExt;
use irc::client::prelude::*;
use tokio::sync::mpsc;

pub struct IrcConnection {
    pub sender: irc::client::Sender,
    pub nickname: String,
}

/// Connect, register, and forward everything the server says into `event_tx`
/// from a background reader task. Channels are joined by the handler, not
/// here, so the login flow can run first.
pub async fn spawn_connection(
    settings: &IrcSettings,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) -> Result<IrcConnection> {
    let config = Config {
        server: Some(settings.server.clone()),
        port: Some(settings.port),
        use_tls: Some(settings.tls),
        nickname: Some(settings.nickname.clone()),
        username: Some(settings.nickname.clone()),
        realname: Some(settings.nickname.clone()),
        dangerously_accept_invalid_certs: Some(settings.accept_invalid_certs),
        ..Config::default()
    };

    let mut client = Client::from_config(config)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", settings.server, settings.port))?;
    client.identify()?;

    let sender = client.sender();
    let mut stream = client.stream()?;

    let event_tx_clone = event_tx.clone();
    let _ = event_tx.send(AppEvent::IrcConnected);

    tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(message) => {
                    if event_tx_clone.send(AppEvent::IrcMessage { message }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = event_tx_clone.send(AppEvent::IrcError {
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
        let _ = event_tx_clone.send(AppEvent::IrcDisconnected {
            reason: "Connection closed".to_string(),
        });
    });

    Ok(IrcConnection {
        sender,
        nickname: settings.nickname.clone(),
    })
}
