/**
 * STUN client transaction: delivers one request and reports exactly one
 * outcome. See RFC 5389 Section 7.2.1 for the retransmission rules.
 * https://datatracker.ietf.org/doc/html/rfc5389#section-7.2.1
 */
use std::{net::SocketAddr, time::Duration, time::Instant};

use super::{MessageClass, StunMessage, TransactionId};
use crate::{
    error::Error,
    transport::{TimerHandle, TimerService, Transport},
    Result,
};

/// The final wait never exceeds this multiple of the initial RTO.
pub const MAX_RTO_MULTIPLIER: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsxState {
    Init,
    /// Request sent, `transmit_count` transmissions so far.
    Sent,
    /// A provisional (1xx) response stopped retransmissions.
    Proceeding,
    Completed,
    TimedOut,
    Cancelled,
}

impl TsxState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TsxState::Completed | TsxState::TimedOut | TsxState::Cancelled
        )
    }
}

/**
 * Retransmission parameters.
 *
 * Fields:
 * - `rto`: The initial retransmission timeout.
 * - `max_transmit`: Total number of transmissions, the first one included.
 */
#[derive(Debug, Clone, Copy)]
pub struct RetransmitConfig {
    pub rto: Duration,
    pub max_transmit: u32,
}

impl RetransmitConfig {
    /**
     * Wait after the given transmission (1-based): the RTO doubles after each
     * transmission and is capped at `MAX_RTO_MULTIPLIER` times the initial RTO.
     */
    pub fn wait_after(&self, transmission: u32) -> Duration {
        let multiplier = 1u32
            .checked_shl(transmission.saturating_sub(1))
            .unwrap_or(u32::MAX)
            .min(MAX_RTO_MULTIPLIER);
        self.rto * multiplier
    }

    /**
     * Time from the first transmission until the transaction gives up.
     */
    pub fn total_timeout(&self) -> Duration {
        (1..=self.max_transmit.max(1)).map(|n| self.wait_after(n)).sum()
    }
}

#[derive(Debug)]
pub struct ClientTransaction {
    id: TransactionId,
    dest: SocketAddr,
    config: RetransmitConfig,
    retransmit: bool,
    state: TsxState,
    packet: Vec<u8>,
    transmit_count: u32,
    last_sent: Option<Instant>,
    timer: Option<TimerHandle>,
    integrity_failed: bool,
}

impl ClientTransaction {
    /**
     * Create a transaction. `retransmit` is false over reliable transports,
     * where a single timer bounds the wait.
     */
    pub fn new(
        id: TransactionId,
        dest: SocketAddr,
        config: RetransmitConfig,
        retransmit: bool,
    ) -> Self {
        Self {
            id,
            dest,
            config,
            retransmit,
            state: TsxState::Init,
            packet: Vec::new(),
            transmit_count: 0,
            last_sent: None,
            timer: None,
            integrity_failed: false,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn state(&self) -> TsxState {
        self.state
    }

    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /**
     * Send the encoded request and arm the retransmission timer.
     */
    pub fn send(
        &mut self,
        packet: Vec<u8>,
        transport: &dyn Transport,
        timers: &dyn TimerService,
    ) -> Result<()> {
        if self.state != TsxState::Init {
            return Err(Error::InvalidOperation("transaction already sent"));
        }
        transport.send(&packet, self.dest)?;
        self.packet = packet;
        self.transmit_count = 1;
        self.last_sent = Some(timers.now());
        self.state = TsxState::Sent;

        let wait = if self.retransmit {
            self.config.wait_after(1)
        } else {
            self.config.total_timeout()
        };
        self.timer = Some(timers.schedule(wait));
        Ok(())
    }

    /**
     * Handle expiry of this transaction's timer: retransmit, or give up.
     *
     * @return The outcome when the transaction finished, `None` while it is
     *         still pending.
     */
    pub fn on_timer(
        &mut self,
        transport: &dyn Transport,
        timers: &dyn TimerService,
    ) -> Option<Result<()>> {
        self.timer = None;
        match self.state {
            TsxState::Sent if self.retransmit && self.transmit_count < self.config.max_transmit => {
                if let Err(e) = transport.send(&self.packet, self.dest) {
                    self.state = TsxState::Completed;
                    return Some(Err(e));
                }
                self.transmit_count += 1;
                self.last_sent = Some(timers.now());
                self.timer = Some(timers.schedule(self.config.wait_after(self.transmit_count)));
                None
            }
            TsxState::Sent | TsxState::Proceeding => {
                self.state = TsxState::TimedOut;
                if self.integrity_failed {
                    Some(Err(Error::Auth(
                        "responses failed the MESSAGE-INTEGRITY check".into(),
                    )))
                } else {
                    Some(Err(Error::Timeout))
                }
            }
            _ => None,
        }
    }

    /**
     * Handle a response carrying this transaction's ID.
     *
     * @return The outcome for a final response, `None` for a provisional one.
     */
    pub fn on_response(&mut self, msg: &StunMessage, timers: &dyn TimerService) -> Option<Result<()>> {
        if self.state.is_terminal() || self.state == TsxState::Init {
            return None;
        }

        let code = msg.error_code().map(|(code, reason)| (code, reason.to_string()));
        if let Some((code, _)) = &code {
            if (100..200).contains(code) {
                self.cancel_timer(timers);
                self.state = TsxState::Proceeding;
                self.timer = Some(timers.schedule(self.config.rto * MAX_RTO_MULTIPLIER));
                return None;
            }
        }

        self.cancel_timer(timers);
        self.state = TsxState::Completed;
        match (msg.class, code) {
            (MessageClass::SuccessResponse, _) => Some(Ok(())),
            (_, Some((code, reason))) => Some(Err(Error::ErrorResponse { code, reason })),
            (_, None) => Some(Err(Error::malformed("error response without ERROR-CODE"))),
        }
    }

    /**
     * Remember that a response was dropped for failing integrity, so a later
     * timeout is reported as an authentication failure.
     */
    pub fn mark_integrity_failure(&mut self) {
        self.integrity_failed = true;
    }

    /**
     * Stop the transaction. No outcome is ever reported after this.
     */
    pub fn cancel(&mut self, timers: &dyn TimerService) {
        if !self.state.is_terminal() {
            self.cancel_timer(timers);
            self.state = TsxState::Cancelled;
        }
    }

    fn cancel_timer(&mut self, timers: &dyn TimerService) {
        if let Some(handle) = self.timer.take() {
            timers.cancel(handle);
        }
    }
}
