//! The message envelope handed to the upper layer, backed by a pooled,
//!  reference counted payload buffer.
//!
//! Wire format of a message inside a frame's payload - all numbers BE:
//!
//! ```ascii
//! 0: leading byte: bit 0 = destination address present, bit 1 = source address
//!     present
//! 1: flags (u16) - see [`MessageFlags`]
//! 3: destination address (if present)
//! *: source address (if present; absent for messages whose source is the
//!     transport-level peer)
//! *: header length (u16), followed by that many opaque header bytes
//! *: payload length (i32), followed by that many payload bytes. A length of zero
//!     or less means there is no payload.
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

use crate::buffer_pool::{BufferPool, PayloadBuf};
use crate::node_addr::NodeAddr;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MessageFlags: u16 {
        /// out-of-band: exempt from per-sender ordering and backpressure
        const OOB = 1;
        /// The upper layer completes this message through an explicit completion
        ///  signal, possibly after the submission call returns. Messages without
        ///  this flag are complete when submission returns.
        const ASYNC_COMPLETION = 1 << 1;
    }
}

/// Identity of a logical message, preserved across [`TransportMessage::retain`], for
///  matching completion signals against the message currently in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MessageId(u64);

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> MessageId {
    MessageId(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

const DEST_SET: u8 = 1;
const SRC_SET: u8 = 1 << 1;

pub struct TransportMessage {
    id: MessageId,
    src: Option<NodeAddr>,
    /// `None` means the message addresses the whole cluster rather than a single node
    dest: Option<NodeAddr>,
    flags: MessageFlags,
    /// opaque to the transport, interpreted by the upper layer
    headers: Bytes,
    payload: Option<PayloadBuf>,
    flat: OnceLock<Bytes>,
}

impl TransportMessage {
    pub fn new(
        src: Option<NodeAddr>,
        dest: Option<NodeAddr>,
        flags: MessageFlags,
        headers: Bytes,
        payload: Option<PayloadBuf>,
    ) -> TransportMessage {
        TransportMessage {
            id: next_message_id(),
            src,
            dest,
            flags,
            headers,
            payload,
            flat: OnceLock::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn src(&self) -> Option<NodeAddr> {
        self.src
    }

    pub fn dest(&self) -> Option<NodeAddr> {
        self.dest
    }

    /// set the source to the transport-level peer address if the wire form did not
    ///  carry one
    pub fn fill_src(&mut self, src: NodeAddr) {
        self.src.get_or_insert(src);
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn is_oob(&self) -> bool {
        self.flags.contains(MessageFlags::OOB)
    }

    pub fn needs_async_completion(&self) -> bool {
        self.flags.contains(MessageFlags::ASYNC_COMPLETION)
    }

    pub fn headers(&self) -> &Bytes {
        &self.headers
    }

    pub fn payload(&self) -> Option<&PayloadBuf> {
        self.payload.as_ref()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// A second handle on the same logical message: same identity, shared payload
    ///  storage, independently released.
    pub fn retain(&self) -> TransportMessage {
        TransportMessage {
            id: self.id,
            src: self.src,
            dest: self.dest,
            flags: self.flags,
            headers: self.headers.clone(),
            payload: self.payload.as_ref().map(|p| p.retain()),
            flat: OnceLock::new(),
        }
    }

    /// Give up this handle on the message. The payload storage is reclaimed when
    ///  the last handle is gone; dropping a handle without calling this is
    ///  equivalent.
    pub fn release(self) {
        // Drop of the payload handle does the work
    }

    /// A new message sharing a zero-copy view of this message's payload storage.
    ///  The duplicate has its own identity and is released independently.
    pub fn duplicate_payload(&self) -> TransportMessage {
        TransportMessage {
            id: next_message_id(),
            src: self.src,
            dest: self.dest,
            flags: self.flags,
            headers: self.headers.clone(),
            payload: self.payload.as_ref().map(|p| p.retain()),
            flat: OnceLock::new(),
        }
    }

    /// A contiguous copy of the payload bytes, materialized on first call and
    ///  cached. Purely a read - no effect on payload ownership.
    pub fn flat_payload(&self) -> &[u8] {
        self.flat
            .get_or_init(|| match &self.payload {
                Some(p) => Bytes::copy_from_slice(p.as_ref()),
                None => Bytes::new(),
            })
            .as_ref()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut leading = 0u8;
        if self.dest.is_some() {
            leading |= DEST_SET;
        }
        if self.src.is_some() {
            leading |= SRC_SET;
        }
        buf.put_u8(leading);
        buf.put_u16(self.flags.bits());

        if let Some(dest) = &self.dest {
            dest.ser(buf);
        }
        if let Some(src) = &self.src {
            src.ser(buf);
        }

        let header_len: u16 = self
            .headers
            .len()
            .try_into()
            .expect("this is a bug: headers must fit the u16 wire length");
        buf.put_u16(header_len);
        buf.put_slice(&self.headers);

        match &self.payload {
            Some(payload) => {
                let payload_len: i32 = payload
                    .len()
                    .try_into()
                    .expect("this is a bug: payload must fit the i32 wire length");
                buf.put_i32(payload_len);
                buf.put_slice(payload.as_ref());
            }
            None => buf.put_i32(0),
        }
    }

    /// Deserialize from a shared receive buffer. The payload (and headers) become
    ///  zero-copy retained views of `buf`'s storage.
    pub fn try_deser_shared(buf: &mut Bytes, pool: &Arc<BufferPool>) -> anyhow::Result<TransportMessage> {
        let (dest, src, flags) = Self::deser_preamble(buf)?;

        let header_len = buf.try_get_u16()? as usize;
        if buf.remaining() < header_len {
            bail!("truncated message headers");
        }
        let headers = buf.split_to(header_len);

        let payload_len = buf.try_get_i32()?;
        let payload = if payload_len <= 0 {
            None
        } else {
            let payload_len = payload_len as usize;
            if buf.remaining() < payload_len {
                bail!("truncated message payload");
            }
            Some(PayloadBuf::from_shared(buf.split_to(payload_len), pool.clone()))
        };

        Ok(TransportMessage::new(src, dest, flags, headers, payload))
    }

    /// Deserialize from an arbitrary buffer, copying the payload into a freshly
    ///  allocated pooled buffer.
    pub fn try_deser(buf: &mut impl Buf, pool: &Arc<BufferPool>) -> anyhow::Result<TransportMessage> {
        let (dest, src, flags) = Self::deser_preamble(buf)?;

        let header_len = buf.try_get_u16()? as usize;
        if buf.remaining() < header_len {
            bail!("truncated message headers");
        }
        let headers = buf.copy_to_bytes(header_len);

        let payload_len = buf.try_get_i32()?;
        let payload = if payload_len <= 0 {
            None
        } else {
            let payload_len = payload_len as usize;
            if buf.remaining() < payload_len {
                bail!("truncated message payload");
            }
            let mut storage = pool.get_buffer();
            storage.put((&mut *buf).take(payload_len));
            Some(PayloadBuf::from_pooled(storage, pool.clone()))
        };

        Ok(TransportMessage::new(src, dest, flags, headers, payload))
    }

    fn deser_preamble(
        buf: &mut impl Buf,
    ) -> anyhow::Result<(Option<NodeAddr>, Option<NodeAddr>, MessageFlags)> {
        let leading = buf.try_get_u8()?;
        let flags = MessageFlags::from_bits_truncate(buf.try_get_u16()?);

        let dest = if leading & DEST_SET != 0 {
            Some(NodeAddr::try_deser(buf)?)
        } else {
            None
        };
        let src = if leading & SRC_SET != 0 {
            Some(NodeAddr::try_deser(buf)?)
        } else {
            None
        };
        Ok((dest, src, flags))
    }
}

impl std::fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TransportMessage{{id={:?}, src={:?}, dest={:?}, flags={:?}, {} payload bytes}}",
            self.id,
            self.src,
            self.dest,
            self.flags,
            self.payload_len()
        )
    }
}
