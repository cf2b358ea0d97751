use crate::app::action::Action;
use crate::app::state::RunState;
use crate::dcc::manager::DccManager;
use anyhow::Result;
use irc::client::prelude::{ChannelMode, Command, Message, Mode, Response, UserMode};
use std::time::Instant;
use tracing::{debug, info, warn};

/// NOTICE fragments services send once the login command was accepted.
const LOGIN_ACCEPTED: &[&str] = &[
    "Password accepted",
    "You are now identified",
    "I recognize you",
];

/// Route one message from the server. Outgoing traffic is queued on
/// `state.pending_actions` and on the DCC manager. Only errors that should
/// end the run are returned.
pub fn handle_irc_message(state: &mut RunState, dcc: &mut DccManager, message: Message) -> Result<()> {
    let nick_from = message.source_nickname().unwrap_or_default().to_string();

    match &message.command {
        Command::Response(Response::RPL_WELCOME, _) => {
            info!("Registered as {}", state.nickname);
            if state.login_command.is_some() {
                state.send_login_command();
            } else {
                join_or_request(state);
            }
        }

        Command::PRIVMSG(_, text) => {
            let Some(ctcp) = ctcp_body(text) else {
                debug!("<{}> {}", nick_from, text);
                return Ok(());
            };
            if !ctcp.starts_with("DCC ") {
                debug!("Ignoring CTCP {} from {}", ctcp, nick_from);
                return Ok(());
            }
            let trusted = state.is_trusted(&nick_from);
            if let Err(e) = dcc.handle_ctcp(&nick_from, ctcp, trusted) {
                if e.is_fatal() {
                    return Err(e.into());
                }
                warn!("Rejected DCC request from {}: {}", nick_from, e);
            }
        }

        Command::NOTICE(_, text) => {
            if ctcp_body(text).is_some() {
                return Ok(());
            }
            info!("-{}- {}", nick_from, text);
            if state.login_command.is_some() && LOGIN_ACCEPTED.iter().any(|p| text.contains(p)) {
                join_or_request(state);
            }
            dcc.handle_notice(text);
        }

        Command::UserMODE(_, modes) => {
            let registered = modes
                .iter()
                .any(|m| matches!(m, Mode::Plus(UserMode::Restricted, _)));
            if registered && state.login_command.is_some() {
                join_or_request(state);
            }
        }

        Command::JOIN(channel, _, _) if state.is_own_nick(&nick_from) => {
            info!("Joined {}", channel);
            state.pending_actions.push(Action::SetUserMode {
                modes: "+i".to_string(),
            });
            if state.send_at.is_none() && state.login_command.is_none() {
                state.send_xdcc_requests();
            }
        }

        Command::ChannelMODE(channel, modes) if state.login_command.is_some() => {
            let voiced = modes.iter().any(|m| match m {
                Mode::Plus(ChannelMode::Voice, Some(nick)) => state.is_own_nick(nick),
                _ => false,
            });
            if voiced {
                info!("Voiced in {}", channel);
                if state.send_at.is_none() {
                    state.send_xdcc_requests();
                }
            }
        }

        Command::ERROR(reason) => {
            warn!("Server error: {}", reason);
        }

        _ => {}
    }
    Ok(())
}

/// Join the configured channels. Without channels to wait for, the requests
/// can go out right away.
fn join_or_request(state: &mut RunState) {
    if state.channels.is_empty() {
        if state.send_at.is_none() {
            state.send_xdcc_requests();
        }
        return;
    }
    state.join_channels();
}

/// Send the XDCC requests once the configured delay has passed.
pub fn poll_send_delay(state: &mut RunState, now: Instant) {
    if state.requests_sent {
        return;
    }
    if state.send_at.is_some_and(|at| now >= at) {
        state.send_xdcc_requests();
    }
}

fn ctcp_body(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\x01')?;
    Some(inner.strip_suffix('\x01').unwrap_or(inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Cli, Settings};
    use clap::Parser;
    use std::time::Duration;

    struct Fixture {
        state: RunState,
        dcc: DccManager,
        _dir: tempfile::TempDir,
    }

    fn fixture(extra: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut args = vec![
            "dccfetch".to_string(),
            "irc.example.net".to_string(),
            "#a".to_string(),
            "Bot xdcc send #1".to_string(),
            "-n".to_string(),
            "me".to_string(),
            "-d".to_string(),
            dir.path().display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        let settings =
            Settings::resolve(Cli::try_parse_from(args).unwrap(), AppConfig::default()).unwrap();
        Fixture {
            state: RunState::new(&settings, Instant::now()),
            dcc: DccManager::new(settings.dcc.clone(), settings.downloads.len()),
            _dir: dir,
        }
    }

    fn feed(f: &mut Fixture, raw: &str) -> Result<()> {
        let message: Message = raw.parse().unwrap();
        handle_irc_message(&mut f.state, &mut f.dcc, message)
    }

    fn request() -> Action {
        Action::SendPrivmsg {
            target: "Bot".into(),
            text: "xdcc send #1".into(),
        }
    }

    #[test]
    fn test_plain_flow_joins_then_requests() {
        let mut f = fixture(&[]);
        feed(&mut f, ":server 001 me :Welcome\r\n").unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![Action::JoinChannel { channel: "#a".into() }]
        );

        feed(&mut f, ":someone!u@h JOIN #a\r\n").unwrap();
        assert!(f.state.take_actions().is_empty());

        feed(&mut f, ":me!u@h JOIN #a\r\n").unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![
                Action::SetUserMode { modes: "+i".into() },
                request(),
            ]
        );
    }

    #[test]
    fn test_login_flow_waits_for_voice() {
        let mut f = fixture(&["-l", "NickServ IDENTIFY pw"]);
        feed(&mut f, ":server 001 me :Welcome\r\n").unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![Action::SendPrivmsg {
                target: "NickServ".into(),
                text: "IDENTIFY pw".into()
            }]
        );

        feed(&mut f, ":NickServ!s@services NOTICE me :Password accepted - you are now recognized.\r\n")
            .unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![Action::JoinChannel { channel: "#a".into() }]
        );

        feed(&mut f, ":me!u@h JOIN #a\r\n").unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![Action::SetUserMode { modes: "+i".into() }]
        );

        feed(&mut f, ":ChanServ!s@services MODE #a +v other\r\n").unwrap();
        assert!(f.state.take_actions().is_empty());

        feed(&mut f, ":ChanServ!s@services MODE #a +v me\r\n").unwrap();
        assert_eq!(f.state.take_actions(), vec![request()]);
    }

    #[test]
    fn test_registered_user_mode_joins() {
        let mut f = fixture(&["-l", "NickServ IDENTIFY pw"]);
        feed(&mut f, ":me MODE me :+r\r\n").unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![Action::JoinChannel { channel: "#a".into() }]
        );
    }

    #[test]
    fn test_delay_holds_requests() {
        let mut f = fixture(&["--delay", "5"]);
        feed(&mut f, ":me!u@h JOIN #a\r\n").unwrap();
        assert_eq!(
            f.state.take_actions(),
            vec![Action::SetUserMode { modes: "+i".into() }]
        );

        poll_send_delay(&mut f.state, Instant::now());
        assert!(f.state.take_actions().is_empty());

        poll_send_delay(&mut f.state, Instant::now() + Duration::from_secs(6));
        assert_eq!(f.state.take_actions(), vec![request()]);

        poll_send_delay(&mut f.state, Instant::now() + Duration::from_secs(7));
        assert!(f.state.take_actions().is_empty());
    }

    #[test]
    fn test_ctcp_from_stranger_is_ignored() {
        let mut f = fixture(&[]);
        feed(
            &mut f,
            ":Stranger!u@h PRIVMSG me :\x01DCC SEND ../evil 2130706433 1 10\x01\r\n",
        )
        .unwrap();
        assert_eq!(f.dcc.active_sessions(), 0);
    }

    #[test]
    fn test_illegal_filename_is_fatal() {
        let mut f = fixture(&[]);
        let outcome = feed(
            &mut f,
            ":Bot!u@h PRIVMSG me :\x01DCC SEND ../evil 2130706433 1 10\x01\r\n",
        );
        assert!(outcome.is_err());
    }

    #[test]
    fn test_malformed_ctcp_is_not_fatal() {
        let mut f = fixture(&[]);
        feed(&mut f, ":Bot!u@h PRIVMSG me :\x01DCC SEND\x01\r\n").unwrap();
        feed(&mut f, ":Bot!u@h PRIVMSG me :\x01VERSION\x01\r\n").unwrap();
        assert_eq!(f.dcc.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_passive_offer_is_answered() {
        let mut f = fixture(&[]);
        feed(
            &mut f,
            ":Bot!u@h PRIVMSG me :\x01DCC SEND movie.mkv 2130706433 0 100 7\x01\r\n",
        )
        .unwrap();
        let actions = f.dcc.take_actions();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::SendCtcp { target, command } => {
                assert_eq!(target, "Bot");
                assert!(command.starts_with("DCC SEND movie.mkv 2130706433 "));
                assert!(command.ends_with(" 100 7"));
            }
            other => panic!("unexpected action {:?}", other),
        }
        f.dcc.cancel_all();
    }
}
