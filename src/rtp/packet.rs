use crate::error::Error;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_SIZE: usize = 12;

const CSRC_SIZE: usize = 4;
const EXTENSION_HEADER_SIZE: usize = 4;
const MAX_CSRC_COUNT: usize = 15;

// RTCP packet types (SR, RR, SDES, BYE, APP) occupy the second header byte
// where RTP keeps marker and payload type.
const RTCP_PACKET_TYPES: std::ops::RangeInclusive<u8> = 200..=204;

/// RTP header extension (RFC 3550 §5.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub profile: u16,
    /// Extension body; always a multiple of 4 bytes on the wire.
    pub data: Vec<u8>,
}

/// A validated RTP data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extension: Option<HeaderExtension>,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn new(
        ssrc: u32,
        sequence_number: u16,
        timestamp: u32,
        payload_type: u8,
        marker: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            extension: None,
            payload,
        }
    }

    /// Parses one packet received from the wire.
    ///
    /// Returns `Ok(None)` for RTCP packets, which share the transport but are
    /// not queued. Padding is stripped from the payload.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, Error> {
        if data.len() < 2 {
            return Err(malformed(format!("{} bytes is too short for a header", data.len())));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(malformed(format!("unsupported version {version}")));
        }
        if RTCP_PACKET_TYPES.contains(&data[1]) {
            return Ok(None);
        }
        if data.len() < RTP_HEADER_SIZE {
            return Err(malformed(format!("{} bytes is too short for a header", data.len())));
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_SIZE;
        let csrc_end = offset + csrc_count * CSRC_SIZE;
        if data.len() < csrc_end {
            return Err(malformed(format!("{csrc_count} CSRCs do not fit")));
        }
        let csrcs = data[offset..csrc_end]
            .chunks_exact(CSRC_SIZE)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset = csrc_end;

        let extension = if has_extension {
            if data.len() < offset + EXTENSION_HEADER_SIZE {
                return Err(malformed("truncated header extension".to_string()));
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let start = offset + EXTENSION_HEADER_SIZE;
            let end = start + words * 4;
            if data.len() < end {
                return Err(malformed(format!("header extension of {words} words does not fit")));
            }
            offset = end;
            Some(HeaderExtension {
                profile,
                data: data[start..end].to_vec(),
            })
        } else {
            None
        };

        let mut end = data.len();
        if has_padding {
            let padding = data[end - 1] as usize;
            if padding == 0 || padding > end - offset {
                return Err(malformed(format!("invalid padding length {padding}")));
            }
            end -= padding;
        }

        Ok(Some(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension,
            payload: data[offset..end].to_vec(),
        }))
    }

    /// Serializes the packet without padding.
    ///
    /// Extension data is zero-padded to a whole number of 32-bit words and at
    /// most 15 CSRCs are written.
    pub fn to_bytes(&self) -> Vec<u8> {
        let csrcs = &self.csrcs[..self.csrcs.len().min(MAX_CSRC_COUNT)];
        let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + csrcs.len() * CSRC_SIZE + self.payload.len());

        let mut first = RTP_VERSION << 6 | csrcs.len() as u8;
        if self.extension.is_some() {
            first |= 0x10;
        }
        buf.push(first);
        buf.push((self.marker as u8) << 7 | (self.payload_type & 0x7f));
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in csrcs {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }

        if let Some(extension) = &self.extension {
            let words = extension.data.len().div_ceil(4);
            buf.extend_from_slice(&extension.profile.to_be_bytes());
            buf.extend_from_slice(&(words as u16).to_be_bytes());
            buf.extend_from_slice(&extension.data);
            buf.resize(buf.len() + words * 4 - extension.data.len(), 0);
        }

        buf.extend_from_slice(&self.payload);
        buf
    }
}

fn malformed(reason: String) -> Error {
    Error::MalformedPacket(reason)
}
