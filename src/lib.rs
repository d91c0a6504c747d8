//! Shared-memory broadcast channel manager: a rendezvous broker that
//! hands writers and readers the file descriptor of a shared datagram
//! buffer for a named channel, then gets out of the data path.

pub mod auth;
pub mod buffer;
pub mod config;
pub mod link;
pub mod logger;
pub mod manager;
pub mod reactor;
pub mod registry;
pub mod session;
pub mod wire;

pub use config::{Cli, Config};
pub use manager::{Manager, Ready};
