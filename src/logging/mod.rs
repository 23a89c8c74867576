/**
 * Initializes the logger
 *
 * https://docs.rs/slog/latest/slog/
 *
 * Sessions never log through the root directly, they derive child loggers
 * carrying the transport and the server address.
 */
use std::sync::Mutex;

use crate::config::Settings;
use slog::{Drain, LevelFilter, Logger};
use slog_async::Async;
use slog_term::FullFormat;

/**
 * Initializes the root logger.
 *
 * Terminal output goes through an async drain so that logging from the
 * event loop never blocks on stderr. Records below `cfg.log_level` are
 * filtered before they reach the channel.
 *
 * @param cfg The configuration settings containing the log level.
 * @return A `Logger` instance configured with the specified log level.
 */
pub fn init_logger(cfg: &Settings) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();

    let drain = LevelFilter::new(drain, cfg.log_level).fuse();
    Logger::root(
        Mutex::new(drain).fuse(),
        slog::o!("version" => env!("CARGO_PKG_VERSION")),
    )
}
