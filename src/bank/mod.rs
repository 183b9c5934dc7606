//! Banking ledger over a remote document store with a local file fallback.
mod account;
mod command;
mod config;
mod connection;
mod error;
mod fallback;
mod ledger;
mod primary;
mod state;
mod store;
mod types;

pub use account::*;
pub use command::*;
pub use config::*;
pub use connection::{ConnectionMonitor, ConnectionState, Connector, DisconnectNotifier};
pub use error::*;
pub use fallback::*;
pub use ledger::*;
pub use primary::*;
pub use state::*;
pub use store::*;
pub use types::*;
