/**
 * STUN message codec. See RFC 5389 Section 6 and 15, and RFC 5766 Section 14
 * for the TURN attributes.
 * https://datatracker.ietf.org/doc/html/rfc5389#section-6
 */
use std::{
    io::{Cursor, Write},
    net::SocketAddr,
};

use rand::Rng;

use super::{
    attribute_type::*,
    defs::{decode_address, SizedAddress},
    message_type, split_message_type,
    util::{fingerprint, padding},
    MessageClass, TransactionId, HEADER_LENGTH, MAGIC_COOKIE,
};
use crate::{auth, error::Error, Result};

/// Size of an encoded MESSAGE-INTEGRITY attribute (header + HMAC-SHA1).
pub(crate) const INTEGRITY_ATTR_LENGTH: u16 = 24;

/// Size of an encoded FINGERPRINT attribute (header + CRC32).
pub(crate) const FINGERPRINT_ATTR_LENGTH: u16 = 8;

/**
 * A decoded STUN attribute. Attributes this codec does not know are kept
 * verbatim as `Unknown`.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    AlternateServer(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    ChannelNumber(u16),
    Lifetime(u32),
    Bandwidth(u32),
    RequestedTransport(u8),
    Data(Vec<u8>),
    DontFragment,
    EvenPort(bool),
    ReservationToken([u8; 8]),
    Unknown { attr_type: u16, value: Vec<u8> },
}

impl Attribute {
    pub fn attr_type(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Attribute::XorPeerAddress(_) => ATTR_XOR_PEER_ADDRESS,
            Attribute::XorRelayedAddress(_) => ATTR_XOR_RELAYED_ADDRESS,
            Attribute::AlternateServer(_) => ATTR_ALTERNATE_SERVER,
            Attribute::Username(_) => ATTR_USERNAME,
            Attribute::Realm(_) => ATTR_REALM,
            Attribute::Nonce(_) => ATTR_NONCE,
            Attribute::Software(_) => ATTR_SOFTWARE,
            Attribute::ErrorCode { .. } => ATTR_ERROR_CODE,
            Attribute::UnknownAttributes(_) => ATTR_UNKNOWN_ATTRIBUTES,
            Attribute::MessageIntegrity(_) => ATTR_MESSAGE_INTEGRITY,
            Attribute::Fingerprint(_) => ATTR_FINGERPRINT,
            Attribute::ChannelNumber(_) => ATTR_CHANNEL_NUMBER,
            Attribute::Lifetime(_) => ATTR_LIFETIME,
            Attribute::Bandwidth(_) => ATTR_BANDWIDTH,
            Attribute::RequestedTransport(_) => ATTR_REQUESTED_TRANSPORT,
            Attribute::Data(_) => ATTR_DATA,
            Attribute::DontFragment => ATTR_DONT_FRAGMENT,
            Attribute::EvenPort(_) => ATTR_EVEN_PORT,
            Attribute::ReservationToken(_) => ATTR_RESERVATION_TOKEN,
            Attribute::Unknown { attr_type, .. } => *attr_type,
        }
    }

    /**
     * The attribute value as it goes on the wire, without header or padding.
     */
    fn value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Attribute::MappedAddress(addr) | Attribute::AlternateServer(addr) => {
                SizedAddress::encode(addr, transaction_id, false).as_ref().to_vec()
            }
            Attribute::XorMappedAddress(addr)
            | Attribute::XorPeerAddress(addr)
            | Attribute::XorRelayedAddress(addr) => {
                SizedAddress::encode(addr, transaction_id, true).as_ref().to_vec()
            }
            Attribute::Username(s)
            | Attribute::Realm(s)
            | Attribute::Nonce(s)
            | Attribute::Software(s) => s.as_bytes().to_vec(),
            Attribute::ErrorCode { code, reason } => {
                let mut v = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                v.extend_from_slice(reason.as_bytes());
                v
            }
            Attribute::UnknownAttributes(types) => {
                types.iter().flat_map(|t| t.to_be_bytes()).collect()
            }
            Attribute::MessageIntegrity(hmac) => hmac.to_vec(),
            Attribute::Fingerprint(crc) => crc.to_be_bytes().to_vec(),
            Attribute::ChannelNumber(ch) => {
                let mut v = ch.to_be_bytes().to_vec();
                v.extend_from_slice(&[0, 0]);
                v
            }
            Attribute::Lifetime(secs) => secs.to_be_bytes().to_vec(),
            Attribute::Bandwidth(kbps) => kbps.to_be_bytes().to_vec(),
            Attribute::RequestedTransport(proto) => vec![*proto, 0, 0, 0],
            Attribute::Data(data) => data.clone(),
            Attribute::DontFragment => Vec::new(),
            Attribute::EvenPort(reserve) => vec![if *reserve { 0x80 } else { 0 }],
            Attribute::ReservationToken(token) => token.to_vec(),
            Attribute::Unknown { value, .. } => value.clone(),
        }
    }

    fn decode(attr_type: u16, value: &[u8], transaction_id: &TransactionId) -> Result<Self> {
        let text = |v: &[u8]| String::from_utf8_lossy(v).to_string();
        let address = |xor: bool| {
            decode_address(value, transaction_id, xor)
                .ok_or_else(|| Error::malformed(format!("bad address in attribute 0x{attr_type:04X}")))
        };
        let u32_value = || -> Result<u32> {
            let bytes: [u8; 4] = value
                .try_into()
                .map_err(|_| Error::malformed(format!("attribute 0x{attr_type:04X} must be 4 bytes")))?;
            Ok(u32::from_be_bytes(bytes))
        };

        let attr = match attr_type {
            ATTR_MAPPED_ADDRESS => Attribute::MappedAddress(address(false)?),
            ATTR_ALTERNATE_SERVER => Attribute::AlternateServer(address(false)?),
            ATTR_XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(address(true)?),
            ATTR_XOR_PEER_ADDRESS => Attribute::XorPeerAddress(address(true)?),
            ATTR_XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(address(true)?),
            ATTR_USERNAME => Attribute::Username(text(value)),
            ATTR_REALM => Attribute::Realm(text(value)),
            ATTR_NONCE => Attribute::Nonce(text(value)),
            ATTR_SOFTWARE => Attribute::Software(text(value)),
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(Error::malformed("ERROR-CODE is too short"));
                }
                let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
                Attribute::ErrorCode {
                    code,
                    reason: text(&value[4..]),
                }
            }
            ATTR_UNKNOWN_ATTRIBUTES => Attribute::UnknownAttributes(
                value
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            ),
            ATTR_MESSAGE_INTEGRITY => {
                let hmac: [u8; 20] = value
                    .try_into()
                    .map_err(|_| Error::malformed("MESSAGE-INTEGRITY must be 20 bytes"))?;
                Attribute::MessageIntegrity(hmac)
            }
            ATTR_FINGERPRINT => Attribute::Fingerprint(u32_value()?),
            ATTR_CHANNEL_NUMBER => {
                if value.len() != 4 {
                    return Err(Error::malformed("CHANNEL-NUMBER must be 4 bytes"));
                }
                Attribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            ATTR_LIFETIME => Attribute::Lifetime(u32_value()?),
            ATTR_BANDWIDTH => Attribute::Bandwidth(u32_value()?),
            ATTR_REQUESTED_TRANSPORT => {
                if value.len() != 4 {
                    return Err(Error::malformed("REQUESTED-TRANSPORT must be 4 bytes"));
                }
                Attribute::RequestedTransport(value[0])
            }
            ATTR_DATA => Attribute::Data(value.to_vec()),
            ATTR_DONT_FRAGMENT => Attribute::DontFragment,
            ATTR_EVEN_PORT => Attribute::EvenPort(value.first().map_or(false, |b| b & 0x80 != 0)),
            ATTR_RESERVATION_TOKEN => {
                let token: [u8; 8] = value
                    .try_into()
                    .map_err(|_| Error::malformed("RESERVATION-TOKEN must be 8 bytes"))?;
                Attribute::ReservationToken(token)
            }
            _ => Attribute::Unknown {
                attr_type,
                value: value.to_vec(),
            },
        };
        Ok(attr)
    }
}

/**
 * What to append when encoding: a MESSAGE-INTEGRITY computed with
 * `integrity_key`, and/or a trailing FINGERPRINT.
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions<'a> {
    pub integrity_key: Option<&'a [u8]>,
    pub fingerprint: bool,
}

/**
 * A STUN message: header fields plus an ordered attribute list.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub method: u16,
    pub class: MessageClass,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn new(method: u16, class: MessageClass, transaction_id: TransactionId) -> Self {
        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /**
     * A fresh, cryptographically random transaction ID.
     */
    pub fn new_transaction_id() -> TransactionId {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill(&mut transaction_id);
        transaction_id
    }

    /**
     * A response to `request`, sharing its method and transaction ID.
     */
    pub fn response_to(request: &StunMessage, class: MessageClass) -> Self {
        Self::new(request.method, class, request.transaction_id)
    }

    pub fn with(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn add_attribute(&mut self, attr: Attribute) {
        self.attributes.push(attr);
    }

    pub fn find_attribute(&self, attr_type: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == attr_type)
    }

    pub fn has_attribute(&self, attr_type: u16) -> bool {
        self.find_attribute(attr_type).is_some()
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        match self.find_attribute(ATTR_ERROR_CODE) {
            Some(Attribute::ErrorCode { code, reason }) => Some((*code, reason.as_str())),
            _ => None,
        }
    }

    pub fn realm(&self) -> Option<&str> {
        match self.find_attribute(ATTR_REALM) {
            Some(Attribute::Realm(realm)) => Some(realm),
            _ => None,
        }
    }

    pub fn nonce(&self) -> Option<&str> {
        match self.find_attribute(ATTR_NONCE) {
            Some(Attribute::Nonce(nonce)) => Some(nonce),
            _ => None,
        }
    }

    pub fn lifetime(&self) -> Option<u32> {
        match self.find_attribute(ATTR_LIFETIME) {
            Some(Attribute::Lifetime(secs)) => Some(*secs),
            _ => None,
        }
    }

    pub fn channel_number(&self) -> Option<u16> {
        match self.find_attribute(ATTR_CHANNEL_NUMBER) {
            Some(Attribute::ChannelNumber(ch)) => Some(*ch),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self.find_attribute(ATTR_DATA) {
            Some(Attribute::Data(data)) => Some(data),
            _ => None,
        }
    }

    /**
     * The first address-typed attribute of the given type.
     */
    pub fn address(&self, attr_type: u16) -> Option<SocketAddr> {
        match self.find_attribute(attr_type)? {
            Attribute::MappedAddress(a)
            | Attribute::XorMappedAddress(a)
            | Attribute::XorPeerAddress(a)
            | Attribute::XorRelayedAddress(a)
            | Attribute::AlternateServer(a) => Some(*a),
            _ => None,
        }
    }

    /**
     * Every XOR-PEER-ADDRESS in the message (CreatePermission may carry several).
     */
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::XorPeerAddress(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    // write stun header (20 bytes)
    fn write_header(&self, cursor: &mut Cursor<Vec<u8>>, length: u16) -> Result<()> {
        cursor.write_all(&message_type(self.method, self.class).to_be_bytes())?;
        cursor.write_all(&length.to_be_bytes())?;
        cursor.write_all(&MAGIC_COOKIE.to_be_bytes())?;
        cursor.write_all(&self.transaction_id)?;
        Ok(())
    }

    /**
     * Write an attribute header, its value and the padding to the buffer
     */
    fn write_attribute(cursor: &mut Cursor<Vec<u8>>, attr_type: u16, value: &[u8]) -> Result<()> {
        let length = u16::try_from(value.len())
            .map_err(|_| Error::InvalidOperation("attribute value too long"))?;
        cursor.write_all(&attr_type.to_be_bytes())?;
        cursor.write_all(&length.to_be_bytes())?;
        cursor.write_all(value)?;
        cursor.write_all(&[0u8; 4][..padding(value.len())])?;
        Ok(())
    }

    fn patch_length(buffer: &mut [u8], length: usize) -> Result<()> {
        let length = u16::try_from(length).map_err(|_| Error::InvalidOperation("message too long"))?;
        buffer[2..4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    /**
     * Encode the message. MESSAGE-INTEGRITY and FINGERPRINT entries in the
     * attribute list are skipped, they are computed from `options` instead.
     *
     * @param options What trailing attributes to compute
     * @return The encoded message
     */
    pub fn encode(&self, options: &EncodeOptions) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(256));
        self.write_header(&mut cursor, 0)?;

        for attr in &self.attributes {
            if matches!(
                attr,
                Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)
            ) {
                continue;
            }
            Self::write_attribute(&mut cursor, attr.attr_type(), &attr.value(&self.transaction_id))?;
        }

        let mut buffer = cursor.into_inner();

        if let Some(key) = options.integrity_key {
            // length as if MESSAGE-INTEGRITY were the last attribute
            let body = buffer.len() - HEADER_LENGTH as usize + INTEGRITY_ATTR_LENGTH as usize;
            Self::patch_length(&mut buffer, body)?;
            let hmac = auth::sign(key, &buffer)?;
            buffer.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
            buffer.extend_from_slice(&20u16.to_be_bytes());
            buffer.extend_from_slice(&hmac);
        }

        if options.fingerprint {
            let body = buffer.len() - HEADER_LENGTH as usize + FINGERPRINT_ATTR_LENGTH as usize;
            Self::patch_length(&mut buffer, body)?;
            let crc = fingerprint(&buffer);
            buffer.extend_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
            buffer.extend_from_slice(&4u16.to_be_bytes());
            buffer.extend_from_slice(&crc.to_be_bytes());
        }

        let body = buffer.len() - HEADER_LENGTH as usize;
        Self::patch_length(&mut buffer, body)?;
        Ok(buffer)
    }

    /**
     * Decode a STUN message from a byte array. The buffer must hold exactly
     * one message. A FINGERPRINT, when present, must be the last attribute
     * and must match.
     *
     * @param bytes The byte array containing the message
     * @return The decoded message
     */
    pub fn parse(bytes: &[u8]) -> Result<StunMessage> {
        if bytes.len() < HEADER_LENGTH as usize {
            return Err(Error::malformed("message is too short"));
        }

        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        if raw_type & 0xC000 != 0 {
            return Err(Error::malformed("first two bits are not zero"));
        }
        let message_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(Error::malformed(format!(
                "invalid magic cookie 0x{magic_cookie:08X}"
            )));
        }
        if message_length % 4 != 0 {
            return Err(Error::malformed("length is not a multiple of 4"));
        }
        if message_length + HEADER_LENGTH as usize != bytes.len() {
            return Err(Error::malformed(format!(
                "mismatched length, header says {} but message is {}",
                message_length,
                bytes.len() - HEADER_LENGTH as usize
            )));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);
        let (method, class) = split_message_type(raw_type);
        let mut message = StunMessage::new(method, class, transaction_id);

        let mut seen_integrity = false;
        let mut offset = HEADER_LENGTH as usize;
        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                return Err(Error::malformed("attribute header is too short"));
            }

            let attribute_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attribute_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            let value_end = offset + 4 + attribute_length;
            if value_end > bytes.len() {
                return Err(Error::malformed(format!(
                    "attribute 0x{attribute_type:04X} overruns the message"
                )));
            }
            let attribute_value = &bytes[offset + 4..value_end];

            if attribute_type == ATTR_FINGERPRINT {
                let attr = Attribute::decode(attribute_type, attribute_value, &transaction_id)?;
                if value_end != bytes.len() {
                    return Err(Error::malformed("FINGERPRINT is not the last attribute"));
                }
                if let Attribute::Fingerprint(received) = attr {
                    let calculated = fingerprint(&bytes[..offset]);
                    if calculated != received {
                        return Err(Error::malformed(format!(
                            "invalid fingerprint 0x{received:08X}, expected 0x{calculated:08X}"
                        )));
                    }
                }
                message.attributes.push(attr);
            } else if !seen_integrity {
                // anything after MESSAGE-INTEGRITY except FINGERPRINT is ignored
                let attr = Attribute::decode(attribute_type, attribute_value, &transaction_id)?;
                seen_integrity = attribute_type == ATTR_MESSAGE_INTEGRITY;
                message.attributes.push(attr);
            }

            offset = value_end + padding(attribute_length);
        }

        Ok(message)
    }

    /**
     * Quick check whether a buffer starts like a STUN message (top two bits
     * zero and the magic cookie in place).
     */
    pub fn is_stun(bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_LENGTH as usize
            && bytes[0] & 0xC0 == 0
            && u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) == MAGIC_COOKIE
    }
}
