//! IRC protocol layer: the server connection and outgoing commands.

pub mod connection;
pub mod manager;
