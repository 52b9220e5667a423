//! Reliable file transfer over UDP: stop-and-wait GET and PUT of 2048-byte
//! chunks, plus delete, list, chat and exit commands.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod shutdown_mgr;
pub mod store;
pub mod transport;
pub mod wire;

pub use client::{Client, Reply};
pub use config::{Config, RetryPolicy};
pub use engine::TransferReport;
pub use error::{Error, Result};
pub use protocol::{CommandRequest, DeleteStatus, Verb};
pub use server::Server;
pub use shutdown_mgr::ShutdownManager;
pub use store::FileStore;
