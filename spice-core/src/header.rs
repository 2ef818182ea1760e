//! Fixed-size wire headers.
//!
//! ## Wire format
//!
//! **Data header** (18 bytes, little-endian, packed):
//! ```text
//! serial:          u64  (8)
//! type:            u16  (2)
//! size:            u32  (4)   body length following the header
//! sub_list:        u32  (4)   0, or offset of the sub-message list in the body
//! ```
//!
//! **Sub-message list** (at `sub_list` inside the body):
//! ```text
//! count:           u16  (2)
//! offsets:         u32  (4 × count)
//! ```
//!
//! **Sub-message header** (at each offset, followed by `size` bytes):
//! ```text
//! type:            u16  (2)
//! size:            u32  (4)
//! ```

use crate::error::SpiceError;

/// Encoded size of a [`DataHeader`].
pub const HEADER_SIZE: usize = 18;

// ── DataHeader ───────────────────────────────────────────────────

/// Envelope preceding every message on an established channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHeader {
    pub serial: u64,
    pub msg_type: u16,
    pub size: u32,
    pub sub_list: u32,
}

impl DataHeader {
    /// Serialize to bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.serial.to_le_bytes());
        buf[8..10].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[10..14].copy_from_slice(&self.size.to_le_bytes());
        buf[14..18].copy_from_slice(&self.sub_list.to_le_bytes());
        buf
    }

    /// Deserialize from the first [`HEADER_SIZE`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, SpiceError> {
        if data.len() < HEADER_SIZE {
            return Err(SpiceError::protocol(format!(
                "data header too short: {} < {HEADER_SIZE}",
                data.len()
            )));
        }
        Ok(Self {
            serial: u64::from_le_bytes(le_array(&data[0..8])),
            msg_type: u16::from_le_bytes(le_array(&data[8..10])),
            size: u32::from_le_bytes(le_array(&data[10..14])),
            sub_list: u32::from_le_bytes(le_array(&data[14..18])),
        })
    }
}

// ── SubMessageHeader ─────────────────────────────────────────────

/// Header of one entry in a sub-message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMessageHeader {
    pub msg_type: u16,
    pub size: u32,
}

impl SubMessageHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 6;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[2..6].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, SpiceError> {
        if data.len() < Self::SIZE {
            return Err(SpiceError::protocol("sub-message header truncated"));
        }
        Ok(Self {
            msg_type: u16::from_le_bytes(le_array(&data[0..2])),
            size: u32::from_le_bytes(le_array(&data[2..6])),
        })
    }
}

/// Location of one sub-message inside its parent body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessageSpan {
    pub msg_type: u16,
    /// Byte range of the payload (header excluded) within the parent body.
    pub payload: std::ops::Range<usize>,
}

/// Parse the sub-message list located at `offset` in `body`.
///
/// Every offset and size is bounds-checked against the body; a list that
/// points outside it is a protocol violation.
pub fn parse_sub_list(body: &[u8], offset: u32) -> Result<Vec<SubMessageSpan>, SpiceError> {
    let offset = offset as usize;
    if offset + 2 > body.len() {
        return Err(SpiceError::protocol(format!(
            "sub-list offset {offset} outside body of {} bytes",
            body.len()
        )));
    }
    let count = u16::from_le_bytes(le_array(&body[offset..offset + 2])) as usize;
    let table_end = offset + 2 + count * 4;
    if table_end > body.len() {
        return Err(SpiceError::protocol("sub-list table truncated"));
    }

    let mut spans = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + 2 + i * 4;
        let sub_at = u32::from_le_bytes(le_array(&body[at..at + 4])) as usize;
        let header_end = sub_at + SubMessageHeader::SIZE;
        if header_end > body.len() {
            return Err(SpiceError::protocol(format!("sub-message {i} header out of bounds")));
        }
        let sub = SubMessageHeader::decode(&body[sub_at..header_end])?;
        let end = header_end + sub.size as usize;
        if end > body.len() {
            return Err(SpiceError::protocol(format!("sub-message {i} payload out of bounds")));
        }
        spans.push(SubMessageSpan {
            msg_type: sub.msg_type,
            payload: header_end..end,
        });
    }
    Ok(spans)
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

// ── Tests ────────────────────────────────────────────────────────
