/**
 * Small wire helpers shared by the codec and the TURN framing code.
 */
use super::FINGERPRINT_XOR;

/**
 * CRC32 of the given bytes, as used by the FINGERPRINT attribute before the
 * XOR with 0x5354554E.
 */
pub(crate) fn calculate_local_fingerprint(buffer: &[u8]) -> u32 {
    crc32fast::hash(buffer)
}

/**
 * The FINGERPRINT attribute value for a message prefix.
 */
pub(crate) fn fingerprint(buffer: &[u8]) -> u32 {
    calculate_local_fingerprint(buffer) ^ FINGERPRINT_XOR
}

/// Number of padding bytes needed to reach a 4-byte boundary.
pub(crate) fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 3);
        assert_eq!(padding(5), 3);
        assert_eq!(padding(8), 0);
    }

    #[test]
    fn test_fingerprint_matches_known_request() {
        // Binding request carrying SOFTWARE "StunClient" and a FINGERPRINT
        let byte_array: [u8; 44] = [
            0x00, 0x01, 0x00, 0x18, 0x21, 0x12, 0xa4, 0x42,
            0xe5, 0x48, 0x69, 0x4c, 0x28, 0x25, 0x5c, 0xe8,
            0x55, 0x22, 0x6b, 0x3e, 0x80, 0x22, 0x00, 0x0c,
            0x53, 0x74, 0x75, 0x6e, 0x43, 0x6c, 0x69, 0x65,
            0x6e, 0x74, 0x00, 0x00, 0x80, 0x28, 0x00, 0x04,
            0x6a, 0xab, 0xe7, 0x2d
        ];
        assert_eq!(fingerprint(&byte_array[..36]), 0x6aabe72d);
    }
}
