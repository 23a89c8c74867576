/**
 * TURN client: the allocation state machine and ChannelData framing.
 * See RFC 5766.
 * https://datatracker.ietf.org/doc/html/rfc5766
 */
use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::{error::Error, stun::HEADER_LENGTH, Result};

pub mod session;

pub use crate::config::ConnType;
pub use session::{AllocParams, Operation, SessionHandle, TurnInfo, TurnObserver, TurnSession};

/// Lowest channel number a client may bind.
pub const CHANNEL_MIN: u16 = 0x4000;

/// Highest channel number a client may bind.
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// Size of the ChannelData header (channel number + length).
pub const CHANNEL_DATA_HEADER: usize = 4;

/// Server side lifetime of a permission.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Server side lifetime of a channel binding.
pub const CHANNEL_LIFETIME: Duration = Duration::from_secs(600);

/// A released channel number stays out of use this long.
pub const CHANNEL_REUSE_GUARD: Duration = Duration::from_secs(300);

/// Channel bindings and permissions are refreshed when they expire within this margin.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// REQUESTED-TRANSPORT value for UDP relaying.
pub const TRANSPORT_UDP: u8 = 17;

/**
 * States of a TURN session, in lifecycle order. A session only ever moves
 * to a later state.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TurnState {
    Null,
    Resolving,
    Resolved,
    Allocating,
    Ready,
    Deallocating,
    Deallocated,
    Destroying,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Null => "Null",
            TurnState::Resolving => "Resolving",
            TurnState::Resolved => "Resolved",
            TurnState::Allocating => "Allocating",
            TurnState::Ready => "Ready",
            TurnState::Deallocating => "Deallocating",
            TurnState::Deallocated => "Deallocated",
            TurnState::Destroying => "Destroying",
        }
    }

    /**
     * Whether `old -> new` is a transition the session may take. Besides the
     * allocation lifecycle this admits teardown before an allocation exists
     * (straight to `Deallocated`) and forceful destruction from any state.
     */
    pub fn is_valid_transition(old: TurnState, new: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (old, new),
            (Null, Resolving)
                | (Resolving, Resolved)
                | (Resolved, Allocating)
                | (Allocating, Ready)
                | (Allocating, Deallocating)
                | (Ready, Deallocating)
                | (Deallocating, Deallocated)
                | (Null | Resolving | Resolved, Deallocated)
                | (Deallocated, Destroying)
        ) || (new == Destroying && old != Destroying)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * True when the first two bits mark a ChannelData frame (STUN messages start
 * with two zero bits).
 */
pub fn is_channel_data(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes[0] & 0xC0 == 0x40
}

/**
 * Frame a payload as ChannelData. The payload is always padded to a multiple
 * of 4 bytes, which stream transports require and datagram peers accept.
 */
pub fn encode_channel_data(channel: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) {
        return Err(Error::InvalidOperation("channel number out of range"));
    }
    let length = u16::try_from(payload.len())
        .map_err(|_| Error::InvalidOperation("payload too long for ChannelData"))?;
    let padded = (payload.len() + 3) & !3;
    let mut out = Vec::with_capacity(CHANNEL_DATA_HEADER + padded);
    out.extend_from_slice(&channel.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(CHANNEL_DATA_HEADER + padded, 0);
    Ok(out)
}

/**
 * Split a ChannelData frame into its channel number and payload. Trailing
 * padding, if any, is ignored.
 */
pub fn parse_channel_data(bytes: &[u8]) -> Result<(u16, &[u8])> {
    if bytes.len() < CHANNEL_DATA_HEADER || !is_channel_data(bytes) {
        return Err(Error::malformed("not a ChannelData frame"));
    }
    let channel = u16::from_be_bytes([bytes[0], bytes[1]]);
    let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let end = CHANNEL_DATA_HEADER + length;
    if bytes.len() < end {
        return Err(Error::malformed(format!(
            "ChannelData length {} exceeds frame of {} bytes",
            length,
            bytes.len()
        )));
    }
    Ok((channel, &bytes[CHANNEL_DATA_HEADER..end]))
}

/**
 * Length of the first frame in a stream buffer: a STUN message or a padded
 * ChannelData frame.
 *
 * @return `None` until the 4 bytes carrying the length have arrived.
 */
pub fn frame_length(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 4 {
        return None;
    }
    let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if is_channel_data(bytes) {
        Some(CHANNEL_DATA_HEADER + ((length + 3) & !3))
    } else {
        Some(HEADER_LENGTH as usize + length)
    }
}

/**
 * Hands out channel numbers from a counter that wraps within
 * `CHANNEL_MIN..=CHANNEL_MAX`, skipping numbers in use and numbers released
 * less than `CHANNEL_REUSE_GUARD` ago.
 */
#[derive(Debug)]
pub(crate) struct ChannelNumbers {
    next: u16,
    retired: Vec<(u16, Instant)>,
}

impl Default for ChannelNumbers {
    fn default() -> Self {
        Self {
            next: CHANNEL_MIN,
            retired: Vec::new(),
        }
    }
}

impl ChannelNumbers {
    pub(crate) fn allocate(&mut self, in_use: impl Fn(u16) -> bool, now: Instant) -> Option<u16> {
        self.retired
            .retain(|(_, at)| now.saturating_duration_since(*at) < CHANNEL_REUSE_GUARD);

        for _ in CHANNEL_MIN..=CHANNEL_MAX {
            let candidate = self.next;
            self.next = if candidate >= CHANNEL_MAX {
                CHANNEL_MIN
            } else {
                candidate + 1
            };
            if !in_use(candidate) && !self.retired.iter().any(|(ch, _)| *ch == candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn retire(&mut self, channel: u16, now: Instant) {
        self.retired.push((channel, now));
    }
}
