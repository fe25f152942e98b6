use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};

/// The network identity of a cluster node: the (host, port) pair on which it accepts
///  connections. This is the key for connection lookup and the identity of a message
///  sender. Equality is structural.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeAddr {
    pub socket_addr: SocketAddr,
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.socket_addr)
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        NodeAddr { socket_addr }
    }
}

pub const REPLY_ADDR_LEN_V4: usize = 4 + 2;
pub const REPLY_ADDR_LEN_V6: usize = 16 + 2;

impl NodeAddr {
    pub fn new(ip: IpAddr, port: u16) -> NodeAddr {
        NodeAddr {
            socket_addr: SocketAddr::new(ip, port),
        }
    }

    #[cfg(test)]
    pub fn localhost(port: u16) -> NodeAddr {
        NodeAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    /// serialize with a leading discriminator byte, for embedding in a stream of
    ///  other data (the message preamble)
    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let addr = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid socket address discriminator: {}", n));
            }
        };
        Ok(NodeAddr { socket_addr: addr })
    }

    /// serialize as the in-band reply address of a frame: no discriminator, the
    ///  length disambiguates between IP V4 (6 bytes) and IP V6 (18 bytes)
    pub fn write_reply_addr(&self, buf: &mut impl BufMut) {
        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    /// Parse the reply address field of a frame. An empty field is valid and means
    ///  the sender does not know its bound address (yet) - callers fall back to the
    ///  transport-level peer address in that case.
    pub fn try_from_reply_addr(mut raw: &[u8]) -> anyhow::Result<Option<NodeAddr>> {
        match raw.len() {
            0 => Ok(None),
            REPLY_ADDR_LEN_V4 => {
                let ip = raw.get_u32();
                let port = raw.get_u16();
                Ok(Some(NodeAddr {
                    socket_addr: SocketAddr::V4(SocketAddrV4::new(ip.into(), port)),
                }))
            }
            REPLY_ADDR_LEN_V6 => {
                let ip = raw.get_u128();
                let port = raw.get_u16();
                Ok(Some(NodeAddr {
                    socket_addr: SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0)),
                }))
            }
            n => bail!("invalid reply address length: {}", n),
        }
    }
}
