/**
 * Client-side STUN/TURN session layer.
 *
 * The crate is organised bottom-up:
 * - `stun`: message codec, client transactions and the STUN session
 * - `auth`: credentials and the MESSAGE-INTEGRITY digest
 * - `turn`: the relay allocation state machine built on the STUN session
 * - `net`: tokio glue that drives a session over a real socket
 *
 * The protocol core never touches sockets or clocks directly, it talks to the
 * host through the `Transport` and `TimerService` traits.
 */
use slog::Logger;

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod stun;
pub mod transport;
pub mod turn;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/**
 * Shared context handed to every session.
 *
 * Fields:
 * - `config`: The loaded settings.
 * - `logger`: The root logger, sessions derive child loggers from it.
 */
#[derive(Debug)]
pub struct Context {
    pub config: config::Settings,
    pub logger: Logger,
}
