//! IPC module for daemon-UI communication

pub mod protocol;
mod server;

pub use server::Server;
