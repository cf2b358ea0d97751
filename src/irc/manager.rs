use crate::app::action::Action;
use crate::app::event::AppEvent;
use crate::config::IrcSettings;
use crate::irc::connection::{spawn_connection, IrcConnection};
use anyhow::Result;
use irc::client::prelude::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Owns the single server connection and turns [`Action`]s into IRC commands.
pub struct IrcManager {
    connection: Option<IrcConnection>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
}

impl IrcManager {
    pub fn new(event_tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            connection: None,
            event_tx,
        }
    }

    pub async fn connect(&mut self, settings: &IrcSettings) -> Result<()> {
        let conn = spawn_connection(settings, self.event_tx.clone()).await?;
        self.connection = Some(conn);
        Ok(())
    }

    fn sender(&self) -> Option<&irc::client::Sender> {
        self.connection.as_ref().map(|c| &c.sender)
    }

    pub fn execute(&mut self, action: Action) -> Result<()> {
        debug!("irc <- {:?}", action);
        match action {
            Action::SendPrivmsg { target, text } => self.send_privmsg(&target, &text),
            Action::SendCtcp { target, command } => self.send_ctcp(&target, &command),
            Action::JoinChannel { channel } => self.send_join(&channel),
            Action::SetUserMode { modes } => self.send_user_mode(&modes),
            Action::Quit { message } => {
                self.send_quit(&message);
                Ok(())
            }
        }
    }

    pub fn send_privmsg(&self, target: &str, text: &str) -> Result<()> {
        if let Some(sender) = self.sender() {
            // No CTCP injection through plain messages.
            let clean = text.replace('\x01', "");
            sender.send_privmsg(target, &clean)?;
        }
        Ok(())
    }

    pub fn send_ctcp(&self, target: &str, command: &str) -> Result<()> {
        if let Some(sender) = self.sender() {
            let ctcp = format!("\x01{}\x01", command);
            sender.send_privmsg(target, &ctcp)?;
        }
        Ok(())
    }

    pub fn send_join(&self, channel: &str) -> Result<()> {
        if let Some(sender) = self.sender() {
            sender.send_join(channel)?;
        }
        Ok(())
    }

    /// `MODE <own nick> <modes>`.
    pub fn send_user_mode(&self, modes: &str) -> Result<()> {
        if let Some(conn) = &self.connection {
            let raw = format!("MODE {} {}", conn.nickname, modes);
            conn.sender.send(Command::Raw(raw, vec![]))?;
        }
        Ok(())
    }

    /// Send QUIT and drop the connection. Errors are ignored since the
    /// socket may already be gone.
    pub fn send_quit(&mut self, message: &str) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.sender.send_quit(message);
        }
    }
}
