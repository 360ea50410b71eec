use thiserror::Error;

pub const PACKET_SIZE: usize = 64;

const MAGIC_FIRST: &[u8; 3] = b"?##";
const MAGIC_NEXT: u8 = b'?';
const FIRST_HEADER_LEN: usize = 9; // magic (3) + msg_type (2) + payload_len (4)
const MIN_PACKET_SIZE: usize = FIRST_HEADER_LEN + 1;
const MAX_PAYLOAD_LEN: usize = 32 << 20; // 32 MiB hard guard.

/// Logical v1 protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet_size_too_small")]
    PacketTooSmall,
    #[error("frame_too_large")]
    FrameTooLarge,
    #[error("bad_magic")]
    BadMagic,
}

/// Splits a frame into fixed-size, zero padded reports.
pub fn encode_packets(frame: &Frame, packet_size: usize) -> Result<Vec<Vec<u8>>, FrameError> {
    if packet_size < MIN_PACKET_SIZE {
        return Err(FrameError::PacketTooSmall);
    }
    if frame.payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::FrameTooLarge);
    }

    let mut first = Vec::with_capacity(packet_size);
    first.extend_from_slice(MAGIC_FIRST);
    first.extend_from_slice(&frame.msg_type.to_be_bytes());
    first.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());

    let head = frame.payload.len().min(packet_size - FIRST_HEADER_LEN);
    first.extend_from_slice(&frame.payload[..head]);
    first.resize(packet_size, 0);

    let mut out = vec![first];
    for chunk in frame.payload[head..].chunks(packet_size - 1) {
        let mut packet = Vec::with_capacity(packet_size);
        packet.push(MAGIC_NEXT);
        packet.extend_from_slice(chunk);
        packet.resize(packet_size, 0);
        out.push(packet);
    }
    Ok(out)
}

#[derive(Debug)]
struct Pending {
    msg_type: u16,
    expected: usize,
    payload: Vec<u8>,
}

/// Reassembles reports produced by [`encode_packets`].
#[derive(Debug, Default)]
pub struct PacketDecoder {
    pending: Option<Pending>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feeds one report; returns the frame once its last report arrived.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Frame>, FrameError> {
        match self.pending.take() {
            None => {
                if packet.len() < FIRST_HEADER_LEN || &packet[..3] != MAGIC_FIRST {
                    return Err(FrameError::BadMagic);
                }
                let msg_type = u16::from_be_bytes([packet[3], packet[4]]);
                let expected =
                    u32::from_be_bytes([packet[5], packet[6], packet[7], packet[8]]) as usize;
                if expected > MAX_PAYLOAD_LEN {
                    return Err(FrameError::FrameTooLarge);
                }
                let mut payload = Vec::with_capacity(expected);
                let take = expected.min(packet.len() - FIRST_HEADER_LEN);
                payload.extend_from_slice(&packet[FIRST_HEADER_LEN..FIRST_HEADER_LEN + take]);
                self.complete_or_park(Pending {
                    msg_type,
                    expected,
                    payload,
                })
            }
            Some(mut pending) => {
                if packet.first() != Some(&MAGIC_NEXT) {
                    return Err(FrameError::BadMagic);
                }
                let remaining = pending.expected - pending.payload.len();
                let take = remaining.min(packet.len() - 1);
                pending.payload.extend_from_slice(&packet[1..1 + take]);
                self.complete_or_park(pending)
            }
        }
    }

    fn complete_or_park(&mut self, pending: Pending) -> Result<Option<Frame>, FrameError> {
        if pending.payload.len() >= pending.expected {
            return Ok(Some(Frame {
                msg_type: pending.msg_type,
                payload: pending.payload,
            }));
        }
        self.pending = Some(pending);
        Ok(None)
    }
}
