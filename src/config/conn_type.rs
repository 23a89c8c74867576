use serde::de::{self, Visitor};
use serde::{Deserializer, Serialize};
use std::fmt;

/**
 * How the client reaches the TURN server
 */
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash, Default)]
pub enum ConnType {
    /**
     * Datagrams, requests are retransmitted until answered
     * https://datatracker.ietf.org/doc/html/rfc5389#section-7.2.1
     */
    #[default]
    Udp,
    /**
     * A stream connection, frames are delimited by their length fields and
     * requests are sent once
     * https://datatracker.ietf.org/doc/html/rfc5766#section-2.1
     */
    Tcp,
}

impl ConnType {
    /**
     * Returns the string representation of the connection type.
     *
     * @return A string slice representing the connection type.
     */
    pub fn as_str(&self) -> &'static str {
        match *self {
            ConnType::Udp => "udp",
            ConnType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConnType {
    type Err = ();

    /**
     * Parse a string into a `ConnType`. Anything unknown means UDP.
     */
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(ConnType::Tcp),
            _ => Ok(ConnType::Udp),
        }
    }
}

/**
 * Deserialize the connection type from the configuration.
 *
 * Unknown values fall back to UDP.
 *
 */
pub fn deserialize<'de, D>(deserializer: D) -> Result<ConnType, D::Error>
where
    D: Deserializer<'de>,
{
    match deserializer.deserialize_str(ConnTypeVisitor) {
        Ok(c) => Ok(c),
        Err(_) => Ok(ConnType::Udp),
    }
}

struct ConnTypeVisitor;
/**
 * Deserialize the connection type from a string.
 *
 */
impl<'de> Visitor<'de> for ConnTypeVisitor {
    type Value = ConnType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string naming a transport (udp or tcp)")
    }

    fn visit_str<E>(self, value: &str) -> Result<ConnType, E>
    where
        E: de::Error,
    {
        match value.to_lowercase().as_str() {
            "udp" => Ok(ConnType::Udp),
            "tcp" => Ok(ConnType::Tcp),
            _ => Err(de::Error::unknown_variant(value, &["udp", "tcp"])),
        }
    }
}
