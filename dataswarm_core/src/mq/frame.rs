use byteorder::{BigEndian, ByteOrder};
use nix::errno::Errno;

/// First two bytes of every frame header.
pub const MAGIC: [u8; 2] = *b"MQ";

/// Size of the fixed frame header on the wire.
pub const HEADER_SIZE: usize = 8;

/// Largest payload carried by a single frame.
pub const MAX_FRAME: usize = 65536;

bitflags! {
    /// Type byte of a frame header.
    pub struct FrameType: u8 {
        const START = 0x01;
        const END = 0x02;
    }
}

/// Decoded frame header:
/// `[magic "MQ"][type][pad = 0][length, u32 big endian]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameType,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(start: bool, end: bool, length: usize) -> Self {
        assert!(length <= MAX_FRAME);
        let mut kind = FrameType::empty();
        kind.set(FrameType::START, start);
        kind.set(FrameType::END, end);
        FrameHeader {
            kind,
            length: length as u32,
        }
    }

    #[inline]
    pub fn is_start(&self) -> bool {
        self.kind.contains(FrameType::START)
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.kind.contains(FrameType::END)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.kind.bits();
        out[3] = 0;
        BigEndian::write_u32(&mut out[4..8], self.length);
        out
    }

    /// Parse a header, rejecting anything that is not a well-formed frame with `EBADMSG`.
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self, Errno> {
        if raw[0..2] != MAGIC {
            return Err(Errno::EBADMSG);
        }
        let kind = FrameType::from_bits(raw[2]).ok_or(Errno::EBADMSG)?;
        let length = BigEndian::read_u32(&raw[4..8]);
        if length as usize > MAX_FRAME {
            return Err(Errno::EBADMSG);
        }
        Ok(FrameHeader { kind, length })
    }
}
