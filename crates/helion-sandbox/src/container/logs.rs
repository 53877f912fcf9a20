//! Container log stream demultiplexing.
//!
//! Engines multiplex stdout/stderr into one stream of frames, each with an
//! 8-byte header: `[stream, 0, 0, 0, len_be32]`. TTY-mode containers skip
//! framing entirely, so a stream whose first byte is not a known stream id
//! is passed through as-is.

/// One demultiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// 0 stdin, 1 stdout, 2 stderr.
    pub stream: u8,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Split a multiplexed stream into frames.
///
/// Tolerates a truncated trailing frame by dropping it; log tails get cut
/// mid-frame all the time and that must never error.
pub fn split_frames(bytes: &[u8]) -> Vec<LogFrame> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 8 <= bytes.len() {
        let stream = bytes[pos];
        let len = u32::from_be_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let start = pos + 8;
        let Some(end) = start.checked_add(len).filter(|e| *e <= bytes.len()) else {
            break;
        };
        frames.push(LogFrame {
            stream,
            payload: bytes[start..end].to_vec(),
        });
        pos = end;
    }
    frames
}

/// Strip frame headers and return clean UTF-8 (lossy on invalid bytes).
pub fn demux_to_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    // TTY streams are unframed; a frame header always starts with 0..=2.
    if bytes[0] > 2 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut out = String::new();
    for frame in split_frames(bytes) {
        out.push_str(&String::from_utf8_lossy(&frame.payload));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn frames_are_split_and_joined() {
        let mut stream = frame(1, b"hello ");
        stream.extend(frame(2, b"warning\n"));
        stream.extend(frame(1, b"world\n"));

        let frames = split_frames(&stream);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream, 1);
        assert_eq!(frames[1].stream, 2);

        assert_eq!(demux_to_string(&stream), "hello warning\nworld\n");
    }

    #[test]
    fn truncated_trailer_is_dropped() {
        let mut stream = frame(1, b"complete\n");
        stream.extend([1, 0, 0, 0, 0, 0, 0, 64]); // header promising 64 bytes
        stream.extend(b"only a little");

        assert_eq!(demux_to_string(&stream), "complete\n");
    }

    #[test]
    fn tty_stream_passes_through() {
        let raw = b"plain tty output, no frames";
        assert_eq!(demux_to_string(raw), "plain tty output, no frames");
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(demux_to_string(b""), "");
        assert!(split_frames(b"").is_empty());
    }

    #[test]
    fn invalid_utf8_is_lossy_not_fatal() {
        let stream = frame(1, &[0xff, 0xfe, b'o', b'k']);
        let out = demux_to_string(&stream);
        assert!(out.ends_with("ok"));
    }
}
