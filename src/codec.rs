use std::io;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub const DELIMITER: u8 = b'\n';

const READ_CHUNK: usize = 4096;

/// Accumulates bytes read from a socket and splits them into newline
/// delimited frames. Bytes after the last delimiter stay buffered for the
/// next read.
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
    // Offset up to which `buf` is known to contain no delimiter.
    scanned: usize,
    discarding: bool,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_len,
            scanned: 0,
            discarding: false,
        }
    }

    /// Reads once from `reader` into the buffer. `Ok(0)` means the peer shut
    /// down its side of the stream.
    pub async fn fill<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.buf.reserve(READ_CHUNK);
        reader.read_buf(&mut self.buf).await
    }

    /// Pops the next complete frame, without its delimiter. Empty frames and
    /// frames longer than the configured limit are skipped.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == DELIMITER) else {
                self.scanned = self.buf.len();
                // One extra byte leaves room for the `\r` of a `\r\n` pair.
                if self.buf.len() > self.max_frame_len + 1 {
                    debug!(buffered = self.buf.len(), "discarding oversized partial frame");
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                }
                return None;
            };

            let end = self.scanned + offset;
            let mut line = self.buf.split_to(end + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }

            if line.is_empty() {
                continue;
            }

            if line.len() > self.max_frame_len {
                debug!(len = line.len(), "discarding oversized frame");
                continue;
            }

            return Some(line.freeze());
        }
    }

    /// Drains every complete frame currently buffered. The iterator can be
    /// dropped early and recreated after the next `fill`.
    pub fn frames(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }
}

#[cfg(test)]
impl FrameBuffer {
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Serializes `message` as one JSON frame followed by exactly one delimiter.
pub fn encode<T>(message: &T) -> serde_json::Result<Bytes>
where
    T: Serialize,
{
    // serde_json escapes newlines inside strings, so the only raw delimiter is ours.
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(DELIMITER);
    Ok(Bytes::from(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let mut frames = FrameBuffer::new(1024);
        frames.extend(br#"{"type":"li"#);
        assert!(frames.next_frame().is_none());
        assert_eq!(frames.buffered(), 11);

        frames.extend(b"st_request\"}\n");
        let frame = frames.next_frame().expect("complete frame");
        assert_eq!(&frame[..], br#"{"type":"list_request"}"#);
        assert!(frames.next_frame().is_none());
        assert_eq!(frames.buffered(), 0);
    }

    #[test]
    fn back_to_back_frames_come_out_in_order() {
        let mut frames = FrameBuffer::new(1024);
        frames.extend(b"first\nsecond\nthi");

        let collected: Vec<Bytes> = frames.frames().collect();
        assert_eq!(collected, vec![Bytes::from("first"), Bytes::from("second")]);

        frames.extend(b"rd\n");
        assert_eq!(frames.next_frame(), Some(Bytes::from("third")));
    }

    #[test]
    fn crlf_and_blank_lines() {
        let mut frames = FrameBuffer::new(1024);
        frames.extend(b"\n\r\nhello\r\n");
        assert_eq!(frames.next_frame(), Some(Bytes::from("hello")));
        assert!(frames.next_frame().is_none());
    }

    #[test]
    fn oversized_frame_is_dropped_and_stream_recovers() {
        let mut frames = FrameBuffer::new(8);
        frames.extend(b"0123456789");
        assert!(frames.next_frame().is_none());
        assert_eq!(frames.buffered(), 0);

        frames.extend(b"tail of the long one\nok\n");
        assert_eq!(frames.next_frame(), Some(Bytes::from("ok")));
    }

    #[test]
    fn full_length_frame_survives_crlf_split_before_the_newline() {
        let mut frames = FrameBuffer::new(4);
        frames.extend(b"abcd\r");
        assert!(frames.next_frame().is_none());
        assert_eq!(frames.buffered(), 5);

        frames.extend(b"\n");
        assert_eq!(frames.next_frame(), Some(Bytes::from("abcd")));
    }

    #[test]
    fn oversized_frame_with_delimiter_is_dropped() {
        let mut frames = FrameBuffer::new(4);
        frames.extend(b"too long\nfine\n");
        assert_eq!(frames.next_frame(), Some(Bytes::from("fine")));
    }

    #[test]
    fn encode_appends_exactly_one_delimiter() {
        let frame = encode(&serde_json::json!({ "msg": "two\nlines" })).expect("encode");
        assert_eq!(frame.iter().filter(|b| **b == DELIMITER).count(), 1);
        assert_eq!(frame.last(), Some(&DELIMITER));
    }

    #[tokio::test]
    async fn fill_reports_end_of_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut frames = FrameBuffer::new(1024);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"ping\n")
            .await
            .expect("write");
        drop(client);

        assert_eq!(frames.fill(&mut server).await.expect("read"), 5);
        assert_eq!(frames.next_frame(), Some(Bytes::from("ping")));
        assert_eq!(frames.fill(&mut server).await.expect("read"), 0);
    }
}
