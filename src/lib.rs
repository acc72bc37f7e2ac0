//! gecho: a TCP line-protocol echo server.
//!
//! Clients connect over plain TCP and send newline-terminated lines. A few
//! words are recognized as commands:
//! - `help`: list the commands
//! - `time`: current server time
//! - `status`: uptime and connection counters
//! - `quit`: say goodbye and close the connection
//!
//! Anything else is sent back as `ECHO [<line>]`. Connections that stay
//! silent longer than the idle timeout are closed by the server.
//!
//! ```no_run
//! # async fn run() -> Result<(), gecho::ServerError> {
//! let server = gecho::Server::new("0.0.0.0", 8080);
//! server.start().await
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod listener;
pub mod server;
pub mod session;
pub mod status;
pub mod wait_group;

pub use commands::CommandDispatcher;
pub use config::Config;
pub use server::{Server, ServerError, ServerState};
pub use status::{StatusSnapshot, StatusSource};
