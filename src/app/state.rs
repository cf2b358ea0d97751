use crate::app::action::Action;
use crate::config::{split_login_command, Settings, XdccRequest};
use std::time::Instant;
use tracing::info;

/// IRC-side progress of a run: who we are, what to ask for, and which of
/// the one-shot steps already happened.
#[derive(Debug)]
pub struct RunState {
    pub nickname: String,
    pub channels: Vec<String>,
    pub downloads: Vec<XdccRequest>,
    pub login_command: Option<String>,
    pub accept_all_nicks: bool,
    /// XDCC requests go out no earlier than this when a delay is set.
    pub send_at: Option<Instant>,
    pub requests_sent: bool,
    pub channels_joined: bool,
    pub pending_actions: Vec<Action>,
}

impl RunState {
    pub fn new(settings: &Settings, started: Instant) -> Self {
        Self {
            nickname: settings.irc.nickname.clone(),
            channels: settings.channels.clone(),
            downloads: settings.downloads.clone(),
            login_command: settings.login_command.clone(),
            accept_all_nicks: settings.accept_all_nicks,
            send_at: settings.send_delay.map(|delay| started + delay),
            requests_sent: false,
            channels_joined: false,
            pending_actions: Vec::new(),
        }
    }

    pub fn is_own_nick(&self, nick: &str) -> bool {
        self.nickname.eq_ignore_ascii_case(nick)
    }

    /// DCC offers are only taken from the bots we asked, unless told otherwise.
    pub fn is_trusted(&self, nick: &str) -> bool {
        self.accept_all_nicks
            || self
                .downloads
                .iter()
                .any(|d| d.bot.eq_ignore_ascii_case(nick))
    }

    pub fn send_login_command(&mut self) {
        let Some((target, text)) = self.login_command.as_deref().and_then(split_login_command)
        else {
            return;
        };
        info!("Sending login command to {}", target);
        self.pending_actions.push(Action::SendPrivmsg {
            target: target.to_string(),
            text: text.to_string(),
        });
    }

    /// Join every configured channel, once.
    pub fn join_channels(&mut self) {
        if self.channels_joined {
            return;
        }
        self.channels_joined = true;
        for channel in &self.channels {
            info!("Joining {}", channel);
            self.pending_actions.push(Action::JoinChannel {
                channel: channel.clone(),
            });
        }
    }

    /// `/msg <bot> <command>` for every download, once per run.
    pub fn send_xdcc_requests(&mut self) {
        if self.requests_sent {
            return;
        }
        self.requests_sent = true;
        for request in &self.downloads {
            info!("/msg {} {}", request.bot, request.command);
            self.pending_actions.push(Action::SendPrivmsg {
                target: request.bot.clone(),
                text: request.command.clone(),
            });
        }
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }
}
