//! `tokio_util` codec framing data messages on an established channel.
//!
//! Decoding yields one [`CompoundMessage`] per header + body; the
//! header is only consumed once the whole body is buffered, so a
//! partially received message never leaves the assembly buffer.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SpiceError;
use crate::header::{DataHeader, HEADER_SIZE};
use crate::message::{CompoundMessage, OutFrame};

/// Default upper bound on a single message body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WireCodec {
    max_message_size: usize,
}

impl WireCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for WireCodec {
    type Item = CompoundMessage;
    type Error = SpiceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = DataHeader::decode(&src[..HEADER_SIZE])?;
        let size = header.size as usize;
        if size > self.max_message_size {
            return Err(SpiceError::protocol(format!(
                "message size {size} exceeds limit {}",
                self.max_message_size
            )));
        }
        if header.sub_list as usize > size {
            return Err(SpiceError::protocol(format!(
                "sub-list offset {} beyond body of {size} bytes",
                header.sub_list
            )));
        }
        if src.len() < HEADER_SIZE + size {
            src.reserve(HEADER_SIZE + size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(size).freeze();
        Ok(Some(CompoundMessage::new(header, body)))
    }
}

impl Encoder<OutFrame> for WireCodec {
    type Error = SpiceError;

    fn encode(&mut self, item: OutFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.message.body();
        let size = u32::try_from(body.len())
            .map_err(|_| SpiceError::Encoding(format!("body of {} bytes too large", body.len())))?;
        let header = DataHeader {
            serial: item.serial,
            msg_type: item.message.msg_type(),
            size,
            sub_list: 0,
        };
        dst.reserve(HEADER_SIZE + body.len());
        dst.put_slice(&header.encode());
        dst.put_slice(body);
        Ok(())
    }
}
