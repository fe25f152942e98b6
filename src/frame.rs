//! The length-prefixed envelope exchanged between peers - see the crate docs for
//!  the layout. Encoding is a single pass into a send buffer; decoding is streaming
//!  safe: partial frames are left in the receive buffer until `total length` bytes
//!  have arrived.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// payload length field + reply address length field
const LENGTH_FIELDS_LEN: usize = 2 * size_of::<i32>();

/// A complete frame as received from a peer. Both byte views are zero-copy slices
///  of the receive buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct Frame {
    /// the sender's advertised reply address, raw; empty if the sender did not
    ///  know its bound address
    pub reply_addr: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn encode(reply_addr: &[u8], payload: &[u8], buf: &mut impl BufMut) {
        let total_len = LENGTH_FIELDS_LEN + reply_addr.len() + payload.len();
        buf.put_i32(
            total_len
                .try_into()
                .expect("this is a bug: callers must enforce the frame size limit"),
        );
        buf.put_i32(payload.len() as i32);
        buf.put_i32(reply_addr.len() as i32);
        buf.put_slice(reply_addr);
        buf.put_slice(payload);
    }
}

pub struct FrameDecoder {
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> FrameDecoder {
        FrameDecoder { max_frame_len }
    }

    /// Extract the next complete frame from the receive buffer, leaving any bytes
    ///  after it in place. `Ok(None)` means more bytes are needed; errors are
    ///  protocol violations and poison the connection the buffer belongs to.
    pub fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
        if buf.len() < size_of::<i32>() {
            return Ok(None);
        }

        let total_len = (&buf[..]).get_i32();
        if (total_len as usize) < LENGTH_FIELDS_LEN || total_len < 0 {
            bail!("frame length {} below minimum", total_len);
        }
        let total_len = total_len as usize;
        if total_len > self.max_frame_len {
            bail!(
                "frame length {} exceeds configured maximum of {}",
                total_len,
                self.max_frame_len
            );
        }

        if buf.len() < size_of::<i32>() + total_len {
            return Ok(None);
        }

        buf.advance(size_of::<i32>());
        let mut frame = buf.split_to(total_len).freeze();

        let payload_len = frame.get_i32();
        let reply_addr_len = frame.get_i32();
        if payload_len < 0 || reply_addr_len < 0 {
            bail!(
                "negative length fields in frame: payload {}, reply address {}",
                payload_len,
                reply_addr_len
            );
        }
        if LENGTH_FIELDS_LEN + payload_len as usize + reply_addr_len as usize != total_len {
            bail!(
                "inconsistent frame: total length {} vs payload {} + reply address {}",
                total_len,
                payload_len,
                reply_addr_len
            );
        }

        let reply_addr = frame.split_to(reply_addr_len as usize);
        Ok(Some(Frame {
            reply_addr,
            payload: frame,
        }))
    }
}
