/**
 * Various misc. utility functions
 */

/// Bytes shown by `packet_dump` before the output is cut short.
const DUMP_LIMIT: usize = 64;

/**
 * Comma separated hex dump of a packet for trace logs. Relayed payloads can
 * be large, only the first `DUMP_LIMIT` bytes are shown.
 *
 * @param buffer The packet bytes.
 * @return The dump, followed by the total length when truncated.
 */
pub(crate) fn packet_dump(buffer: &[u8]) -> String {
    let shown = &buffer[..buffer.len().min(DUMP_LIMIT)];
    let mut out = shown
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(",");
    if buffer.len() > DUMP_LIMIT {
        out.push_str(&format!(",... ({} bytes)", buffer.len()));
    }
    out
}
