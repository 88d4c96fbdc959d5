//! Length-prefix framing for RTP over a byte stream.
//!
//! Wire format: \[length\]\[packet\]
//! - length: 2 bytes (u16 BE) - size of the packet that follows
//! - packet: `length` bytes of RTP or RTCP
//!
//! Zero-length frames carry nothing and are skipped.

use crate::error::Error;

pub const FRAME_HEADER_SIZE: usize = 2;

/// Reassembles length-prefixed packets from arbitrary stream chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    start: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_frame_size,
        }
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete packet, or `None` until more bytes arrive.
    ///
    /// A length prefix larger than the maximum frame size is a protocol
    /// violation; the stream cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            let pending = &self.buf[self.start..];
            if pending.len() < FRAME_HEADER_SIZE {
                self.compact();
                return Ok(None);
            }

            let len = u16::from_be_bytes([pending[0], pending[1]]) as usize;
            if len > self.max_frame_size {
                return Err(Error::FrameTooLarge {
                    len,
                    max: self.max_frame_size,
                });
            }
            if pending.len() < FRAME_HEADER_SIZE + len {
                self.compact();
                return Ok(None);
            }

            let frame = pending[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
            self.start += FRAME_HEADER_SIZE + len;
            if !frame.is_empty() {
                return Ok(Some(frame));
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Prepends the length prefix to `packet`.
pub fn encode_frame(packet: &[u8], max_frame_size: usize) -> Result<Vec<u8>, Error> {
    let max = max_frame_size.min(u16::MAX as usize);
    if packet.len() > max {
        return Err(Error::FrameTooLarge {
            len: packet.len(),
            max,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + packet.len());
    frame.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    frame.extend_from_slice(packet);
    Ok(frame)
}
