/*! Wire frame layout.

Two frame variants share a 16-bit start token. The low 14 bits are the
fixed pattern `0xACB5 & 0xFCFF`; bits 8 and 9 carry the frame type, so a
receiver can classify any frame from a two byte peek.

Data frame: 8 byte header, payload, 2 byte footer.

```text
offset  0        2      3        4          5             7
        [token]  [sync] [channel] [packet_id] [payload_size] [crc8]
```

The CRC-8 covers the seven header bytes before it. The footer is the
CRC-16 of the payload. A response frame is 5 bytes: token, response
kind, the sync being answered, and a CRC-8 over the first four bytes.
*/
use crate::checksum::{crc8, crc16};
use crate::{Error, Result};

/// Fixed 16-bit start token, before the type bits are folded in.
pub const TOKEN: u16 = 0xACB5;
/// Mask selecting the fixed token bits; the two holes are the type.
pub const TOKEN_MASK: u16 = 0xFCFF;
/// Data frame header size in bytes.
pub const HEADER_SIZE: usize = 8;
/// Data frame footer size in bytes.
pub const FOOTER_SIZE: usize = 2;
/// Response frame size in bytes.
pub const RESPONSE_SIZE: usize = 5;

/// Frame type, carried in the start token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// Response frame (ACK and friends).
    Response = 0,
    /// Acknowledged data frame.
    Data = 1,
    /// Data frame whose acknowledgement may be deferred.
    DataNack = 2,
    /// Fire-and-forget data frame. Best effort, no sequence number.
    DataFaf = 3,
}

impl FrameType {
    fn from_bits(bits: u8) -> FrameType {
        match bits & 0x03 {
            0 => FrameType::Response,
            1 => FrameType::Data,
            2 => FrameType::DataNack,
            _ => FrameType::DataFaf,
        }
    }
}

/// Response kind carried in a response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// Frame accepted; acknowledges every earlier in-flight frame too.
    Ack = 0,
    /// Frame damaged or out of order; the whole window is retransmitted.
    Nack = 1,
    /// Reserved. Treated like a NACK, with a warning.
    Nyet = 2,
    /// Frame refused; the sender must not retry it.
    Reject = 3,
}

impl ResponseKind {
    fn from_bits(bits: u8) -> ResponseKind {
        match bits & 0x03 {
            0 => ResponseKind::Ack,
            1 => ResponseKind::Nack,
            2 => ResponseKind::Nyet,
            _ => ResponseKind::Reject,
        }
    }
}

/// Lifecycle of a packet as seen by its sender or receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Status {
    None,
    Receiving,
    Transmitting,
    Complete,
    Valid,
    /// Created but not yet handed to the transport.
    Pending,
    /// On the global transmit queue.
    Buffered,
    /// In the transmit window, awaiting a response.
    InTransit,
    /// Pulled back from the window for retransmission.
    Retry,
    /// Rejected by the remote or lost to a connection reset.
    Failed,
}

/// Classify two candidate start bytes.
///
/// Returns the frame type if the 14 fixed token bits match.
#[must_use]
pub fn classify_token(bytes: [u8; 2]) -> Option<FrameType> {
    let token = u16::from_le_bytes(bytes);
    if token & TOKEN_MASK == TOKEN {
        Some(FrameType::from_bits((token >> 8) as u8))
    } else {
        None
    }
}

/// Data frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Frame type; never `Response` for a data header.
    pub frame_type: FrameType,
    /// Sequence number, mod 256.
    pub sync: u8,
    /// Logical channel.
    pub channel: u8,
    /// Packet id within the channel's service.
    pub packet_id: u8,
    /// Payload length in bytes.
    pub payload_size: u16,
}

impl Header {
    /// Serialize, computing the trailing CRC-8.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let token = TOKEN | u16::from(self.frame_type as u8) << 8;
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&token.to_le_bytes());
        out[2] = self.sync;
        out[3] = self.channel;
        out[4] = self.packet_id;
        out[5..7].copy_from_slice(&self.payload_size.to_le_bytes());
        out[7] = crc8(0, &out[..7]);
        out
    }

    /// Parse a header, returning it along with whether its CRC-8 held.
    ///
    /// The fields of a header with a bad CRC are still returned; the
    /// parser uses the (assumed correct) frame type to decide whether
    /// the damaged frame was fire-and-forget.
    pub fn parse(data: &[u8]) -> Result<(Header, bool)> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Framing(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let frame_type = classify_token([data[0], data[1]])
            .ok_or_else(|| Error::Framing("bad start token".into()))?;
        let crc_ok = crc8(0, &data[..7]) == data[7];
        Ok((
            Header {
                frame_type,
                sync: data[2],
                channel: data[3],
                packet_id: data[4],
                payload_size: u16::from_le_bytes([data[5], data[6]]),
            },
            crc_ok,
        ))
    }
}

/// A whole data frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    /// Frame header. `payload_size` mirrors `payload.len()`.
    pub header: Header,
    /// Payload bytes, encoded by the packet codec.
    pub payload: Vec<u8>,
}

impl DataFrame {
    /// Build a frame around a payload. The sync is assigned later, when
    /// the frame leaves the transmit queue.
    #[must_use]
    pub fn new(frame_type: FrameType, channel: u8, packet_id: u8, payload: Vec<u8>) -> DataFrame {
        DataFrame {
            header: Header {
                frame_type,
                sync: 0,
                channel,
                packet_id,
                payload_size: payload.len() as u16,
            },
            payload,
        }
    }

    /// Serialize header, payload and CRC-16 footer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len() + FOOTER_SIZE);
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc16(0, &self.payload).to_le_bytes());
        out
    }

    /// Parse a complete frame, verifying both checksums.
    pub fn parse(data: &[u8]) -> Result<DataFrame> {
        let (header, crc_ok) = Header::parse(data)?;
        if !crc_ok {
            return Err(Error::Framing("header checksum mismatch".into()));
        }
        let want = HEADER_SIZE + usize::from(header.payload_size) + FOOTER_SIZE;
        if data.len() != want {
            return Err(Error::Framing(format!(
                "frame is {} bytes, header says {want}",
                data.len()
            )));
        }
        let payload = data[HEADER_SIZE..want - FOOTER_SIZE].to_vec();
        let footer = u16::from_le_bytes([data[want - 2], data[want - 1]]);
        if crc16(0, &payload) != footer {
            return Err(Error::Framing("payload checksum mismatch".into()));
        }
        Ok(DataFrame { header, payload })
    }
}

/// A response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    /// What the receiver decided about the frame.
    pub kind: ResponseKind,
    /// The sync number being answered.
    pub sync_id: u8,
}

impl ResponseFrame {
    /// Serialize, computing the trailing CRC-8.
    #[must_use]
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let token = TOKEN | u16::from(FrameType::Response as u8) << 8;
        let mut out = [0u8; RESPONSE_SIZE];
        out[0..2].copy_from_slice(&token.to_le_bytes());
        out[2] = self.kind as u8;
        out[3] = self.sync_id;
        out[4] = crc8(0, &out[..4]);
        out
    }

    /// Parse and verify a response frame.
    pub fn parse(data: &[u8]) -> Result<ResponseFrame> {
        if data.len() < RESPONSE_SIZE {
            return Err(Error::Framing(format!(
                "response needs {RESPONSE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        match classify_token([data[0], data[1]]) {
            Some(FrameType::Response) => {}
            _ => return Err(Error::Framing("bad response token".into())),
        }
        if crc8(0, &data[..4]) != data[4] {
            return Err(Error::Framing("response checksum mismatch".into()));
        }
        Ok(ResponseFrame {
            kind: ResponseKind::from_bits(data[2]),
            sync_id: data[3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_carries_type() {
        for (ft, bits) in [
            (FrameType::Response, 0u16),
            (FrameType::Data, 1),
            (FrameType::DataNack, 2),
            (FrameType::DataFaf, 3),
        ] {
            let token = TOKEN | bits << 8;
            assert_eq!(classify_token(token.to_le_bytes()), Some(ft));
        }
        assert_eq!(classify_token([0x00, 0x00]), None);
        assert_eq!(classify_token([0xb5, 0x00]), None);
        // Flipping any fixed bit breaks recognition.
        assert_eq!(classify_token((TOKEN ^ 0x0001).to_le_bytes()), None);
    }

    #[test]
    fn header_layout() {
        let h = Header {
            frame_type: FrameType::Data,
            sync: 0,
            channel: 1,
            packet_id: 7,
            payload_size: 4,
        };
        let bytes = h.encode();
        assert_eq!(
            u16::from_le_bytes([bytes[0], bytes[1]]),
            TOKEN | 1 << 8
        );
        assert_eq!(&bytes[2..7], &[0, 1, 7, 4, 0]);
        assert_eq!(bytes[7], crate::checksum::crc8(0, &bytes[..7]));
        let (back, crc_ok) = Header::parse(&bytes).unwrap();
        assert!(crc_ok);
        assert_eq!(back, h);
    }

    #[test]
    fn header_bad_crc_still_parses_fields() {
        let mut bytes = Header {
            frame_type: FrameType::DataFaf,
            sync: 5,
            channel: 2,
            packet_id: 9,
            payload_size: 0,
        }
        .encode();
        bytes[7] ^= 0xff;
        let (back, crc_ok) = Header::parse(&bytes).unwrap();
        assert!(!crc_ok);
        assert_eq!(back.frame_type, FrameType::DataFaf);
        assert_eq!(back.sync, 5);
    }

    #[test]
    fn data_frame_roundtrip_empty_payload() {
        let f = DataFrame::new(FrameType::Data, 3, 1, vec![]);
        let bytes = f.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + FOOTER_SIZE);
        assert_eq!(DataFrame::parse(&bytes).unwrap(), f);
    }

    #[test]
    fn data_frame_roundtrip_max_payload() {
        let payload = vec![0x5a; usize::from(u16::MAX)];
        let f = DataFrame::new(FrameType::DataNack, 0, 0, payload);
        let bytes = f.encode();
        assert_eq!(DataFrame::parse(&bytes).unwrap(), f);
    }

    #[test]
    fn data_frame_detects_payload_corruption() {
        let f = DataFrame::new(FrameType::Data, 1, 1, vec![1, 2, 3, 4]);
        let mut bytes = f.encode();
        bytes[HEADER_SIZE + 1] ^= 0x01;
        assert!(DataFrame::parse(&bytes).is_err());
    }

    #[test]
    fn response_roundtrip() {
        for kind in [
            ResponseKind::Ack,
            ResponseKind::Nack,
            ResponseKind::Nyet,
            ResponseKind::Reject,
        ] {
            let r = ResponseFrame { kind, sync_id: 0xfe };
            let bytes = r.encode();
            assert_eq!(bytes.len(), RESPONSE_SIZE);
            assert_eq!(ResponseFrame::parse(&bytes).unwrap(), r);
        }
    }

    #[test]
    fn response_bad_crc_rejected() {
        let mut bytes = ResponseFrame {
            kind: ResponseKind::Ack,
            sync_id: 1,
        }
        .encode();
        bytes[4] ^= 0x10;
        assert!(ResponseFrame::parse(&bytes).is_err());
    }
}
