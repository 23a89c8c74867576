/**
 * The STUN-specific module: wire constants, the message codec, client
 * transactions and the STUN session.
 */

mod defs;
pub mod message;
pub mod session;
pub mod transaction;
pub(crate) mod util;

pub use message::{Attribute, EncodeOptions, StunMessage};
pub use session::{Completion, SendOptions, StunConfig, StunHandler, StunSession, TxData};
pub use transaction::{ClientTransaction, TsxState};

/// length of a STUN header is 20 bytes
pub const HEADER_LENGTH: u16 = 20;

/// This value is included in STUN messages to help differentiate them from other types of network traffic and to
/// ensure that the messages are processed correctly by STUN servers and clients. The Magic Cookie value is 0x2112A442
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// XORed into the CRC32 of the message to form the FINGERPRINT value ("STUN" in ASCII).
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

/// 96-bit transaction identifier.
pub type TransactionId = [u8; 12];

/// Message methods (the 12 method bits of the message type).
pub mod method {
    /// Address discovery and keep-alive.
    pub const BINDING: u16 = 0x0001;

    /// Reserve a relayed transport address on a TURN server.
    pub const ALLOCATE: u16 = 0x0003;

    /// Extend or delete (LIFETIME=0) an allocation.
    pub const REFRESH: u16 = 0x0004;

    /// Client to server relay of application data (indication only).
    pub const SEND: u16 = 0x0006;

    /// Server to client relay of application data (indication only).
    pub const DATA: u16 = 0x0007;

    /// Install or refresh permissions for peer IP addresses.
    pub const CREATE_PERMISSION: u16 = 0x0008;

    /// Bind a channel number to a peer transport address.
    pub const CHANNEL_BIND: u16 = 0x0009;

    pub fn name(method: u16) -> &'static str {
        match method {
            BINDING => "Binding",
            ALLOCATE => "Allocate",
            REFRESH => "Refresh",
            SEND => "Send",
            DATA => "Data",
            CREATE_PERMISSION => "CreatePermission",
            CHANNEL_BIND => "ChannelBind",
            _ => "Unknown",
        }
    }
}

/// The class bits of the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageClass::SuccessResponse | MessageClass::ErrorResponse
        )
    }
}

/**
 * Build the 14-bit message type from a method and a class. The class bits
 * C0/C1 sit at bit positions 4 and 8, interleaved with the method bits.
 */
pub fn message_type(method: u16, class: MessageClass) -> u16 {
    let m = method & 0x0FFF;
    ((m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2)) | class.bits()
}

/**
 * Split a message type into its method and class.
 */
pub fn split_message_type(msg_type: u16) -> (u16, MessageClass) {
    let method = (msg_type & 0x000F) | ((msg_type & 0x00E0) >> 1) | ((msg_type & 0x3E00) >> 2);
    let class = match msg_type & 0x0110 {
        0x0000 => MessageClass::Request,
        0x0010 => MessageClass::Indication,
        0x0100 => MessageClass::SuccessResponse,
        _ => MessageClass::ErrorResponse,
    };
    (method, class)
}

/*
   Comprehension-required range (0x0000-0x7FFF):
     0x0001: MAPPED-ADDRESS
     0x0006: USERNAME
     0x0008: MESSAGE-INTEGRITY
     0x0009: ERROR-CODE
     0x000A: UNKNOWN-ATTRIBUTES
     0x000C: CHANNEL-NUMBER
     0x000D: LIFETIME
     0x0010: BANDWIDTH
     0x0012: XOR-PEER-ADDRESS
     0x0013: DATA
     0x0014: REALM
     0x0015: NONCE
     0x0016: XOR-RELAYED-ADDRESS
     0x0018: EVEN-PORT
     0x0019: REQUESTED-TRANSPORT
     0x001A: DONT-FRAGMENT
     0x0020: XOR-MAPPED-ADDRESS
     0x0022: RESERVATION-TOKEN

   Comprehension-optional range (0x8000-0xFFFF)
     0x8022: SOFTWARE
     0x8023: ALTERNATE-SERVER
     0x8028: FINGERPRINT
*/

// Attribute Types
#[allow(dead_code)]
pub mod attribute_type {
    /// The reflexive transport address of the client, in the clear (RFC 3489 style).
    pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

    /// Identifies the username and password combination used in the message-integrity check.
    pub const ATTR_USERNAME: u16 = 0x0006;

    /// HMAC-SHA1 of the STUN message. Only FINGERPRINT may follow it.
    pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;

    /// Error class and number plus a UTF-8 reason phrase, present in error responses only.
    pub const ATTR_ERROR_CODE: u16 = 0x0009;

    /// The comprehension-required attributes the server did not understand (420 responses).
    pub const ATTR_UNKNOWN_ATTRIBUTES: u16 = 0x000A;

    /// The channel number of a ChannelBind request, in the upper 16 bits.
    pub const ATTR_CHANNEL_NUMBER: u16 = 0x000C;

    /// Allocation lifetime in seconds.
    pub const ATTR_LIFETIME: u16 = 0x000D;

    /// Requested bandwidth in kbps (TURN drafts, kept for older servers).
    pub const ATTR_BANDWIDTH: u16 = 0x0010;

    /// A peer transport address, XOR-obfuscated.
    pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;

    /// Application payload of Send and Data indications.
    pub const ATTR_DATA: u16 = 0x0013;

    /// The realm used for long-term credentials, echoed from the server challenge.
    pub const ATTR_REALM: u16 = 0x0014;

    /// Server issued nonce, echoed back on authenticated requests.
    pub const ATTR_NONCE: u16 = 0x0015;

    /// The relayed transport address granted by the TURN server.
    pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;

    /// Request an even relayed port (optionally reserving the next one).
    pub const ATTR_EVEN_PORT: u16 = 0x0018;

    /// The transport protocol for the relayed address, as an IANA protocol number.
    pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

    /// Ask the server to set the DF bit on relayed packets.
    pub const ATTR_DONT_FRAGMENT: u16 = 0x001A;

    /// The reflexive transport address of the client, XOR-obfuscated.
    pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

    /// Token identifying a relayed address reserved by an earlier EVEN-PORT request.
    pub const ATTR_RESERVATION_TOKEN: u16 = 0x0022;

    /// Human-readable description of the software sending the message.
    pub const ATTR_SOFTWARE: u16 = 0x8022;

    /// Redirects the client to a different server (300 responses).
    pub const ATTR_ALTERNATE_SERVER: u16 = 0x8023;

    /// CRC32 of the message XORed with 0x5354554E, always the last attribute.
    pub const ATTR_FINGERPRINT: u16 = 0x8028;
}

// Error Codes
#[allow(dead_code)]
pub mod error_code {
    /// Try Alternate (300)
    pub const TRY_ALTERNATE: u16 = 300;

    /// Bad Request (400)
    pub const BAD_REQUEST: u16 = 400;

    /// Unauthorized (401)
    pub const UNAUTHORIZED: u16 = 401;

    /// Forbidden (403)
    pub const FORBIDDEN: u16 = 403;

    /// Unknown Attribute (420)
    pub const UNKNOWN_ATTRIBUTE: u16 = 420;

    /// Allocation Mismatch (437)
    pub const ALLOCATION_MISMATCH: u16 = 437;

    /// Stale Nonce (438)
    pub const STALE_NONCE: u16 = 438;

    /// Wrong Credentials (441)
    pub const WRONG_CREDENTIALS: u16 = 441;

    /// Unsupported Transport Protocol (442)
    pub const UNSUPPORTED_TRANSPORT_PROTOCOL: u16 = 442;

    /// Allocation Quota Reached (486)
    pub const ALLOCATION_QUOTA_REACHED: u16 = 486;

    /// Server Error (500)
    pub const SERVER_ERROR: u16 = 500;

    /// Insufficient Capacity (508)
    pub const INSUFFICIENT_CAPACITY: u16 = 508;

    pub fn reason(code: u16) -> &'static str {
        match code {
            TRY_ALTERNATE => "Try Alternate",
            BAD_REQUEST => "Bad Request",
            UNAUTHORIZED => "Unauthorized",
            FORBIDDEN => "Forbidden",
            UNKNOWN_ATTRIBUTE => "Unknown Attribute",
            ALLOCATION_MISMATCH => "Allocation Mismatch",
            STALE_NONCE => "Stale Nonce",
            WRONG_CREDENTIALS => "Wrong Credentials",
            UNSUPPORTED_TRANSPORT_PROTOCOL => "Unsupported Transport Protocol",
            ALLOCATION_QUOTA_REACHED => "Allocation Quota Reached",
            SERVER_ERROR => "Server Error",
            INSUFFICIENT_CAPACITY => "Insufficient Capacity",
            _ => "Unknown Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_encoding() {
        assert_eq!(message_type(method::BINDING, MessageClass::Request), 0x0001);
        assert_eq!(message_type(method::BINDING, MessageClass::SuccessResponse), 0x0101);
        assert_eq!(message_type(method::BINDING, MessageClass::ErrorResponse), 0x0111);
        assert_eq!(message_type(method::ALLOCATE, MessageClass::Request), 0x0003);
        assert_eq!(message_type(method::ALLOCATE, MessageClass::ErrorResponse), 0x0113);
        assert_eq!(message_type(method::SEND, MessageClass::Indication), 0x0016);
        assert_eq!(message_type(method::DATA, MessageClass::Indication), 0x0017);
        assert_eq!(message_type(method::CHANNEL_BIND, MessageClass::SuccessResponse), 0x0109);
    }

    #[test]
    fn test_message_type_split() {
        for m in [
            method::BINDING,
            method::ALLOCATE,
            method::REFRESH,
            method::CREATE_PERMISSION,
            method::CHANNEL_BIND,
            0x0ABC,
        ] {
            for c in [
                MessageClass::Request,
                MessageClass::Indication,
                MessageClass::SuccessResponse,
                MessageClass::ErrorResponse,
            ] {
                assert_eq!(split_message_type(message_type(m, c)), (m, c));
            }
        }
    }
}
