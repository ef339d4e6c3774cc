use bytes::{Buf as _, BytesMut};

/// One server-sent event as framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE framer; frames may span any number of network chunks.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already searched for a delimiter.
    scanned: usize,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        // A delimiter may straddle the previous chunk's last three bytes.
        while let Some((len, delimiter)) = next_frame_len(&self.buf, self.scanned.saturating_sub(3))
        {
            let raw = self.buf.split_to(len);
            self.buf.advance(delimiter);
            self.scanned = 0;
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }
        self.scanned = self.buf.len();
        frames
    }

    /// Bytes held back waiting for a frame delimiter.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Finds the first blank-line delimiter at or after `from`:
/// `(frame length, delimiter length)`.
fn next_frame_len(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    for i in from..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

fn parse_frame(bytes: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data: Option<String> = None;
    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.unwrap_or_default(),
    })
}
