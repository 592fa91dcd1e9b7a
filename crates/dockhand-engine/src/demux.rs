//! Decoder for the runtime's multiplexed attach-stream framing.
//!
//! Attached streams interleave stdout and stderr as frames of
//! `[stream tag][3 reserved bytes][u32 BE payload length][payload]`. The
//! decoder is a pure function over a byte buffer so callers can feed it
//! arbitrary chunk boundaries: a truncated trailing frame comes back as
//! `remaining` and is prepended to the next chunk.

const FRAME_HEADER_LEN: usize = 8;

/// Frames longer than this are treated as corrupt rather than buffered.
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

const STREAM_STDIN: u8 = 0;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// Result of one demultiplexing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxOutput {
    pub stdout: String,
    pub stderr: String,
    /// Unconsumed trailing bytes of an incomplete frame; pass them back in
    /// front of the next buffer.
    pub remaining: Vec<u8>,
}

/// Splits a multiplexed buffer into stdout and stderr text.
///
/// Payload bytes are accumulated per stream across all complete frames and
/// decoded in a single UTF-8 pass, since a multi-byte character can straddle
/// a frame boundary. A buffer that does not start with a valid frame header
/// is returned verbatim on stdout with control characters stripped (the
/// endpoint was running a TTY, which disables multiplexing).
pub fn demultiplex(buffer: &[u8]) -> DemuxOutput {
    let mut stdout_bytes: Vec<u8> = Vec::new();
    let mut stderr_bytes: Vec<u8> = Vec::new();
    let mut offset = 0usize;

    while buffer.len() - offset >= FRAME_HEADER_LEN {
        let header = &buffer[offset..offset + FRAME_HEADER_LEN];
        let stream_type = header[0];

        if !is_valid_header(header) {
            if offset == 0 {
                // No framing at all: raw TTY output.
                return DemuxOutput {
                    stdout: strip_control_chars(&String::from_utf8_lossy(buffer)),
                    stderr: String::new(),
                    remaining: Vec::new(),
                };
            }
            // Mid-buffer corruption: emit the tail raw after what decoded.
            let tail = strip_control_chars(&String::from_utf8_lossy(&buffer[offset..]));
            let mut out = finish(stdout_bytes, stderr_bytes, Vec::new());
            out.stdout.push_str(&tail);
            return out;
        }

        let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        if payload_len > MAX_FRAME_LEN {
            // A declared length this large is corruption, not a frame.
            let tail = strip_control_chars(&String::from_utf8_lossy(&buffer[offset..]));
            let mut out = finish(stdout_bytes, stderr_bytes, Vec::new());
            out.stdout.push_str(&tail);
            return out;
        }

        let frame_end = offset + FRAME_HEADER_LEN + payload_len;
        if frame_end > buffer.len() {
            // Truncated trailing frame: hand it back for the next call.
            return finish(stdout_bytes, stderr_bytes, buffer[offset..].to_vec());
        }

        let payload = &buffer[offset + FRAME_HEADER_LEN..frame_end];
        match stream_type {
            STREAM_STDERR => stderr_bytes.extend_from_slice(payload),
            // stdin frames only appear on echoed exec sessions; fold them
            // into stdout like the runtime CLI does.
            STREAM_STDOUT | STREAM_STDIN => stdout_bytes.extend_from_slice(payload),
            _ => unreachable!("validated by is_valid_header"),
        }
        offset = frame_end;
    }

    finish(stdout_bytes, stderr_bytes, buffer[offset..].to_vec())
}

fn finish(stdout_bytes: Vec<u8>, stderr_bytes: Vec<u8>, remaining: Vec<u8>) -> DemuxOutput {
    DemuxOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        remaining,
    }
}

fn is_valid_header(header: &[u8]) -> bool {
    matches!(header[0], STREAM_STDIN | STREAM_STDOUT | STREAM_STDERR)
        && header[1] == 0
        && header[2] == 0
        && header[3] == 0
}

/// Strips C0 control characters except tab, newline and carriage return.
fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(*c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}'))
        .collect()
}
