/**
 * Credentials and the MESSAGE-INTEGRITY digest.
 *
 * Short-term credentials use the password as the HMAC key. Long-term
 * credentials use MD5(username ":" realm ":" password) as a raw 16 byte key.
 * The long-term derivation is applied to the bytes exactly as configured,
 * without SASLprep, because servers in the field expect that exact key.
 */
use std::fmt;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::{
    error::Error,
    stun::{
        attribute_type::ATTR_MESSAGE_INTEGRITY, error_code, message::INTEGRITY_ATTR_LENGTH,
        MessageClass, StunMessage, HEADER_LENGTH,
    },
    Result,
};

type HmacSha1 = Hmac<Sha1>;

/// Which credential mechanism a session applies to outgoing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// How the password bytes of a credential are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordKind {
    /// The password in the clear.
    #[default]
    Plain,
    /// The pre-computed long-term key, MD5(username:realm:password).
    Hashed,
}

/**
 * The username/password pair to use for one message.
 */
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialInfo {
    pub username: String,
    pub password: Vec<u8>,
    pub password_kind: PasswordKind,
}

impl fmt::Debug for CredentialInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialInfo")
            .field("username", &self.username)
            .field("password_kind", &self.password_kind)
            .finish_non_exhaustive()
    }
}

/**
 * A credential configured once. The realm and nonce may be left empty, the
 * session fills them in from the server challenge.
 */
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredential {
    pub realm: Option<String>,
    pub username: String,
    pub password: Vec<u8>,
    pub password_kind: PasswordKind,
    pub nonce: Option<String>,
}

impl StaticCredential {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            realm: None,
            username: username.to_string(),
            password: password.as_bytes().to_vec(),
            password_kind: PasswordKind::Plain,
            nonce: None,
        }
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredential")
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

/**
 * Credentials looked up on demand, for example from a token service that
 * rotates passwords.
 */
pub trait DynamicCredential {
    /**
     * The credential to use for the given realm. Returning `None` sends the
     * request without authentication.
     */
    fn credential(&self, realm: Option<&str>) -> Option<CredentialInfo>;
}

pub enum Credential {
    Static(StaticCredential),
    Dynamic(Box<dyn DynamicCredential>),
}

impl Credential {
    pub(crate) fn resolve(&self, realm: Option<&str>) -> Option<CredentialInfo> {
        match self {
            Credential::Static(s) => Some(CredentialInfo {
                username: s.username.clone(),
                password: s.password.clone(),
                password_kind: s.password_kind,
            }),
            Credential::Dynamic(d) => d.credential(realm),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Static(s) => f.debug_tuple("Static").field(s).finish(),
            Credential::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/**
 * The raw long-term key: MD5(username ":" realm ":" password).
 */
pub fn long_term_key(username: &str, realm: &str, password: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password);
    let mut key = [0u8; 16];
    key.copy_from_slice(&hasher.finalize());
    key
}

/**
 * The HMAC key for a credential under the given mechanism.
 */
pub fn derive_key(kind: AuthKind, realm: Option<&str>, info: &CredentialInfo) -> Vec<u8> {
    match (kind, info.password_kind) {
        (_, PasswordKind::Hashed) => info.password.clone(),
        (AuthKind::LongTerm, PasswordKind::Plain) => {
            long_term_key(&info.username, realm.unwrap_or_default(), &info.password).to_vec()
        }
        (_, PasswordKind::Plain) => info.password.clone(),
    }
}

/**
 * HMAC-SHA1 of `bytes` under `key`.
 */
pub fn sign(key: &[u8], bytes: &[u8]) -> Result<[u8; 20]> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key)
        .map_err(|_| Error::Auth("invalid HMAC key".into()))?;
    mac.update(bytes);
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

/**
 * Constant-time check of an HMAC-SHA1 signature.
 */
pub fn verify(key: &[u8], bytes: &[u8], signature: &[u8]) -> bool {
    match <HmacSha1 as Mac>::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(bytes);
            mac.verify_slice(signature).is_ok()
        }
        Err(_) => false,
    }
}

/**
 * Verify the MESSAGE-INTEGRITY attribute of a raw, already parsed message.
 * The header length is patched to end right after MESSAGE-INTEGRITY before
 * the digest is computed.
 *
 * @return `Ok(true)` when the digest matches, `Ok(false)` when it does not,
 *         and an error when the message carries no MESSAGE-INTEGRITY.
 */
pub fn verify_message_integrity(key: &[u8], raw: &[u8]) -> Result<bool> {
    let mut offset = HEADER_LENGTH as usize;
    while offset + 4 <= raw.len() {
        let attr_type = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let attr_length = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;

        if attr_type == ATTR_MESSAGE_INTEGRITY {
            if attr_length != 20 || offset + 24 > raw.len() {
                return Err(Error::malformed("truncated MESSAGE-INTEGRITY"));
            }
            let covered_length = (offset - HEADER_LENGTH as usize + INTEGRITY_ATTR_LENGTH as usize) as u16;
            let mut covered = raw[..offset].to_vec();
            covered[2..4].copy_from_slice(&covered_length.to_be_bytes());
            return Ok(verify(key, &covered, &raw[offset + 4..offset + 24]));
        }

        offset += 4 + attr_length + crate::stun::util::padding(attr_length);
    }
    Err(Error::Auth("response has no MESSAGE-INTEGRITY".into()))
}

/**
 * Whether a response to an authenticated request must carry a valid
 * MESSAGE-INTEGRITY. Challenges and the errors a server raises before it can
 * authenticate the request are exempt.
 */
pub fn requires_integrity(msg: &StunMessage) -> bool {
    match msg.class {
        MessageClass::SuccessResponse => true,
        MessageClass::ErrorResponse => !matches!(
            msg.error_code().map(|(code, _)| code),
            Some(error_code::BAD_REQUEST)
                | Some(error_code::UNAUTHORIZED)
                | Some(error_code::UNKNOWN_ATTRIBUTE)
                | Some(error_code::STALE_NONCE)
                | None
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::{method, Attribute, EncodeOptions};

    // RFC 5769 section 2.2, sample IPv4 response with short-term credentials
    const SAMPLE_RESPONSE: [u8; 80] = [
        0x01, 0x01, 0x00, 0x3c, 0x21, 0x12, 0xa4, 0x42, 0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86,
        0xfa, 0x87, 0xdf, 0xae, 0x80, 0x22, 0x00, 0x0b, 0x74, 0x65, 0x73, 0x74, 0x20, 0x76, 0x65, 0x63,
        0x74, 0x6f, 0x72, 0x20, 0x00, 0x20, 0x00, 0x08, 0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43,
        0x00, 0x08, 0x00, 0x14, 0x2b, 0x91, 0xf5, 0x99, 0xfd, 0x9e, 0x90, 0xc3, 0x8c, 0x74, 0x89, 0xf9,
        0x2a, 0xf9, 0xba, 0x53, 0xf0, 0x6b, 0xe7, 0xd7, 0x80, 0x28, 0x00, 0x04, 0xc0, 0x7d, 0x4c, 0x96,
    ];
    const SAMPLE_PASSWORD: &[u8] = b"VOkJxbRl1RmTxUk/WvJxBt";

    #[test]
    fn test_rfc5769_response_integrity() {
        let msg = StunMessage::parse(&SAMPLE_RESPONSE).unwrap();
        assert_eq!(
            msg.address(crate::stun::attribute_type::ATTR_XOR_MAPPED_ADDRESS),
            Some("192.0.2.1:32853".parse().unwrap())
        );
        assert_eq!(verify_message_integrity(SAMPLE_PASSWORD, &SAMPLE_RESPONSE), Ok(true));
        assert_eq!(verify_message_integrity(b"wrong", &SAMPLE_RESPONSE), Ok(false));
    }

    #[test]
    fn test_long_term_key() {
        let key = long_term_key("user", "realm", b"pass");
        assert_eq!(hex::encode(key), "8493fbc53ba582fb4c044c456bdc40eb");

        let info = CredentialInfo {
            username: "user".into(),
            password: b"pass".to_vec(),
            password_kind: PasswordKind::Plain,
        };
        assert_eq!(derive_key(AuthKind::LongTerm, Some("realm"), &info), key.to_vec());
        assert_eq!(derive_key(AuthKind::ShortTerm, Some("realm"), &info), b"pass".to_vec());

        let hashed = CredentialInfo {
            password: key.to_vec(),
            password_kind: PasswordKind::Hashed,
            ..info
        };
        assert_eq!(derive_key(AuthKind::LongTerm, Some("realm"), &hashed), key.to_vec());
    }

    #[test]
    fn test_sign_verify_and_single_byte_flips() {
        let keys: [&[u8]; 3] = [b"", b"short", &[0xAB; 64]];
        let messages: [&[u8]; 3] = [b"", b"abc", &SAMPLE_RESPONSE];

        for key in keys {
            for msg in messages {
                let signature = sign(key, msg).unwrap();
                assert!(verify(key, msg, &signature));

                for i in 0..msg.len() {
                    let mut tampered = msg.to_vec();
                    tampered[i] ^= 0x01;
                    assert!(!verify(key, &tampered, &signature));
                }
                for i in 0..signature.len() {
                    let mut tampered = signature;
                    tampered[i] ^= 0x80;
                    assert!(!verify(key, msg, &tampered));
                }
            }
        }
    }

    #[test]
    fn test_encoded_integrity_verifies_with_fingerprint_after() {
        let key = long_term_key("alice", "example.org", b"secret");
        let msg = StunMessage::new(method::ALLOCATE, MessageClass::Request, StunMessage::new_transaction_id())
            .with(Attribute::RequestedTransport(17))
            .with(Attribute::Username("alice".into()))
            .with(Attribute::Realm("example.org".into()))
            .with(Attribute::Nonce("abcd".into()));
        let bytes = msg
            .encode(&EncodeOptions {
                integrity_key: Some(&key),
                fingerprint: true,
            })
            .unwrap();

        assert!(StunMessage::parse(&bytes).is_ok());
        assert_eq!(verify_message_integrity(&key, &bytes), Ok(true));

        let mut tampered = bytes.clone();
        tampered[25] ^= 0x01;
        assert_eq!(verify_message_integrity(&key, &tampered), Ok(false));
    }

    #[test]
    fn test_missing_integrity() {
        let bytes = StunMessage::new(method::BINDING, MessageClass::SuccessResponse, [1; 12])
            .encode(&EncodeOptions::default())
            .unwrap();
        assert!(matches!(verify_message_integrity(b"k", &bytes), Err(Error::Auth(_))));
    }

    #[test]
    fn test_requires_integrity() {
        let ok = StunMessage::new(method::ALLOCATE, MessageClass::SuccessResponse, [0; 12]);
        assert!(requires_integrity(&ok));

        for (code, expected) in [(401, false), (438, false), (400, false), (437, true), (486, true)] {
            let err = StunMessage::new(method::ALLOCATE, MessageClass::ErrorResponse, [0; 12])
                .with(Attribute::ErrorCode {
                    code,
                    reason: String::new(),
                });
            assert_eq!(requires_integrity(&err), expected, "code {code}");
        }

        let ind = StunMessage::new(method::DATA, MessageClass::Indication, [0; 12]);
        assert!(!requires_integrity(&ind));
    }
}
