//! Point-to-point TCP transport for a cluster communication stack. It carries opaque
//!  message payloads between cluster nodes, multiplexing many logical senders over a
//!  small set of physical connections, and hands received messages to an upper
//!  membership / ordering layer.
//!
//! ## Design goals
//!
//! * One TCP connection per peer pair, opened lazily on first send (either direction)
//!   and shared by both directions afterwards
//!   * each node has a listening socket; an accepted connection is usable for sends
//!     back to the peer once the peer's advertised reply address is known
//!   * duplicate connections between the same pair are collapsed to one
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data,
//!   not a stream of bytes)
//! * All state of a connection - and of the inbound dispatch for the senders behind
//!   it - is owned by a single task, so there is no lock contention on the hot path.
//!   Cross-task signals are commands posted to that task's queue.
//! * Messages from one sender are handed to the upper layer strictly in receipt order,
//!   with at most one message in flight per sender. The upper layer may complete a
//!   message asynchronously; the transport does not block on it.
//! * Per-sender backpressure: when the bytes queued for a sender exceed a high
//!   watermark, reads on that sender's connection are paused until the queue drains
//!   below a low watermark.
//! * Out-of-band messages bypass per-sender ordering and backpressure entirely.
//! * Payload buffers are pooled and reference counted, so a message can be sliced and
//!   retained without copying and the storage is reused once the last holder releases
//!   it.
//!
//! ## Wire format
//!
//! Each frame on the wire - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  total length (i32): number of bytes following this field
//! 4:  payload length (i32)
//! 8:  reply address length (i32)
//! 12: reply address (4+2 bytes for IP V4, 16+2 bytes for IP V6, or empty if the
//!      sender does not know its bound address yet - the receiver then falls back to
//!      the transport-level peer address)
//! *:  payload
//! ```
//!
//! `total length = 4 + payload length + 4 + reply address length`. The reply address
//!  is sent with every frame; a frame with an empty payload is an announcement whose
//!  only purpose is to teach the receiver the sender's reply address.
//!
//! The payload is a sequence of one or more serialized [`message::TransportMessage`]s
//!  from the same sender; see that module for the message wire format.

pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod message;
pub mod message_sink;
pub mod node_addr;
pub mod server;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
