/**
 * This module defines the main entry point for the SYN TURN client: it
 * allocates a relay on the configured server, logs what happens to it and
 * releases it on Ctrl-C.
 */
use std::{net::SocketAddr, process, sync::Arc};

use slog::{error, info, warn, Logger};
use synturn::{
    config::Settings,
    logging,
    net::{ClientCommand, TurnClient},
    turn::{Operation, TurnObserver, TurnState},
    Context, Error,
};
use tokio::sync::mpsc;

/**
 * Observer that reports session events to the log.
 */
struct LogObserver {
    logger: Logger,
}

impl TurnObserver for LogObserver {
    fn on_state_changed(&mut self, old: TurnState, new: TurnState) {
        info!(self.logger, "TURN session {} -> {}", old, new);
    }

    fn on_rx_data(&mut self, peer: SocketAddr, payload: &[u8]) {
        info!(self.logger, "{} bytes from {}", payload.len(), peer);
    }

    fn on_channel_bound(&mut self, peer: SocketAddr, channel: u16) {
        info!(self.logger, "Channel 0x{:04X} bound to {}", channel, peer);
    }

    fn on_operation_failed(&mut self, op: Operation, error: &Error) {
        warn!(self.logger, "{:?} failed: {}", op, error);
    }
}

pub struct SynTurn {
    context: Arc<Context>,
}

impl SynTurn {
    /**
     * Creates a new `SynTurn` instance from the hierarchical configuration.
     *
     * @return The client, or the configuration error.
     */
    pub fn new() -> Result<Self, config::ConfigError> {
        let cfg = Settings::new()?;
        let context = Context {
            logger: logging::init_logger(&cfg),
            config: cfg,
        };
        Ok(Self {
            context: Arc::new(context),
        })
    }

    /**
     * Run the client until the allocation is released. Ctrl-C starts a
     * graceful shutdown, a second Ctrl-C destroys the session at once.
     */
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let logger = self.context.logger.clone();
        info!(logger, "Starting TURN client"; "config" => ?self.context.config);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for command in [ClientCommand::Shutdown, ClientCommand::Destroy] {
                if tokio::signal::ctrl_c().await.is_err() || tx.send(command).is_err() {
                    return;
                }
            }
        });

        let observer = LogObserver {
            logger: logger.clone(),
        };
        let info = TurnClient::new(&self.context)
            .run(Box::new(observer), rx)
            .await?;
        if let Some(e) = info.last_error {
            error!(logger, "TURN session ended with error: {}", e);
        }
        Ok(())
    }
}

/**
 * The main entry point for the application, it creates
 * the client object and passes control to it.
 */
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let client = match SynTurn::new() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = client.run().await {
        eprintln!("TURN client failed: {}", e);
        process::exit(1);
    }
}
