/// Outgoing IRC traffic, produced by the handler and the DCC engine and
/// executed by the driver against the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendPrivmsg { target: String, text: String },
    /// `command` is sent verbatim inside `\x01` delimiters.
    SendCtcp { target: String, command: String },
    JoinChannel { channel: String },
    SetUserMode { modes: String },
    Quit { message: String },
}
