#[derive(Debug)]
pub enum AppEvent {
    /// IRC message received from the server
    IrcMessage { message: irc::client::prelude::Message },

    /// IRC connection state changed
    IrcConnected,
    IrcDisconnected { reason: String },
    IrcError { error: String },
}
