//! Strip the container runtime's stream-multiplexing headers from captured output.
//!
//! When stdout and stderr share one stream, the runtime prefixes each frame with
//! an 8-byte header (stream id, padding, big-endian length). Collected output is
//! treated as line-oriented: every line longer than the header loses its first
//! 8 bytes, shorter lines are kept as-is. A short line that does carry a header
//! is therefore left with it; that imprecision is accepted.
//!
//! Apply exactly once, right after collection. Running it again over already
//! stripped text eats the first 8 bytes of every long line.

/// Size of the per-frame header the runtime prepends.
pub const FRAME_HEADER_LEN: usize = 8;

pub fn normalize(raw: &[u8]) -> String {
    raw.split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            let payload = if line.len() > FRAME_HEADER_LEN {
                &line[FRAME_HEADER_LEN..]
            } else {
                line
            };
            String::from_utf8_lossy(payload).into_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
