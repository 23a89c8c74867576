/**
 * Capabilities the protocol core needs from its host: a way to put bytes on
 * the wire and a timer service. Both are shared by reference between the TURN
 * session and the STUN session below it, implementations use interior
 * mutability where they need it.
 */
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::Result;

/**
 * Outbound packet sink.
 */
pub trait Transport {
    /**
     * Send one packet (a STUN message or a ChannelData frame) to `dest`.
     */
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()>;
}

/// Opaque identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/**
 * One-shot timers. When a timer expires the host calls `on_timer(handle)` on
 * the session that scheduled it.
 */
pub trait TimerService {
    fn schedule(&self, delay: Duration) -> TimerHandle;

    /// Cancelling an unknown or already fired timer is a no-op.
    fn cancel(&self, handle: TimerHandle);

    fn now(&self) -> Instant;
}
