/**
 * Transport address attribute values (MAPPED-ADDRESS and the XOR family).
 */
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{TransactionId, MAGIC_COOKIE};

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/**
 * STUN addresses may be ipv4 or ipv6, and each has a different storage requirement
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SizedAddress {
    Ipv4([u8; 8]),
    Ipv6([u8; 20]),
}

impl SizedAddress {
    /**
     * Encode a socket address, XOR-obfuscating it with the magic cookie (and
     * the transaction ID for IPv6) when `use_xor` is set.
     */
    pub(crate) fn encode(addr: &SocketAddr, transaction_id: &TransactionId, use_xor: bool) -> Self {
        let x_port = if use_xor {
            addr.port() ^ ((MAGIC_COOKIE >> 16) as u16)
        } else {
            addr.port()
        };

        match addr.ip() {
            IpAddr::V4(ipv4) => {
                let ip = ipv4.octets();
                let magic_bytes = MAGIC_COOKIE.to_be_bytes();
                let mut out = [0u8; 8];
                out[1] = FAMILY_IPV4;
                out[2..4].copy_from_slice(&x_port.to_be_bytes());
                for i in 0..4 {
                    out[4 + i] = if use_xor { ip[i] ^ magic_bytes[i] } else { ip[i] };
                }
                SizedAddress::Ipv4(out)
            }
            IpAddr::V6(ipv6) => {
                let ip = ipv6.octets();
                let mut out = [0u8; 20];
                out[1] = FAMILY_IPV6;
                out[2..4].copy_from_slice(&x_port.to_be_bytes());
                out[4..20].copy_from_slice(&ip);
                if use_xor {
                    xor_v6(&mut out[4..20], transaction_id);
                }
                SizedAddress::Ipv6(out)
            }
        }
    }
}

impl AsRef<[u8]> for SizedAddress {
    fn as_ref(&self) -> &[u8] {
        match self {
            SizedAddress::Ipv4(addr) => addr,
            SizedAddress::Ipv6(addr) => addr,
        }
    }
}

fn xor_v6(ip: &mut [u8], transaction_id: &TransactionId) {
    let magic_bytes = MAGIC_COOKIE.to_be_bytes();
    for i in 0..4 {
        ip[i] ^= magic_bytes[i];
    }
    for i in 0..12 {
        ip[4 + i] ^= transaction_id[i];
    }
}

/**
 * Decode an address attribute value. Returns `None` when the family or the
 * length is wrong.
 */
pub(crate) fn decode_address(
    value: &[u8],
    transaction_id: &TransactionId,
    use_xor: bool,
) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if use_xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    match value[1] {
        FAMILY_IPV4 if value.len() == 8 => {
            let mut ip = [value[4], value[5], value[6], value[7]];
            if use_xor {
                let magic_bytes = MAGIC_COOKIE.to_be_bytes();
                for i in 0..4 {
                    ip[i] ^= magic_bytes[i];
                }
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        FAMILY_IPV6 if value.len() == 20 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&value[4..20]);
            if use_xor {
                xor_v6(&mut ip, transaction_id);
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        _ => None,
    }
}
