//! SOCKS5 requests (no-auth)

use async_trait::async_trait;
use tokio::time::timeout;

use super::socks::{read_ipv4, read_ipv6, read_lpstring, read_port};
use super::{sni_split_at, Requester, RequestError, CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE};
use crate::conn::BufConn;
use crate::relay::{Forwarder, TunnelVerdict};

/// SOCKS5 address types.
pub const ATYPE_IPV4: u8 = 1;
pub const ATYPE_DOMAIN: u8 = 3;
pub const ATYPE_IPV6: u8 = 4;

/// Reply granting the request, bound address zeroed.
const REPLY_GRANTED: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];

/// Run the method-selection exchange, accepting no-auth unconditionally.
pub async fn authorize(client: &mut BufConn) -> Result<(), RequestError> {
    let p = client.receive_data().await?;
    if p.is_empty() || p[0] != 5 {
        return Err(RequestError::NotSocks5);
    }
    if p.len() < 3 {
        return Err(RequestError::ShortPacket);
    }
    client.write_all(&[5, 0]).await?;
    Ok(())
}

/// A parsed SOCKS5 client request.
#[derive(Debug)]
pub struct Socks5Request {
    pub cmd: u8,
    pub addr_type: u8,
    pub dest_host: String,
    pub dest_port: u16,
    /// The raw request packet as received.
    pub packet: Vec<u8>,
    /// Cached first client packet after the ack.
    request_data: bytes::Bytes,
    responded: bool,
}

impl Socks5Request {
    /// Parse one request burst.
    pub async fn read_from(client: &mut BufConn) -> Result<Self, RequestError> {
        let p = client.receive_data().await?;
        if p.len() < 4 {
            return Err(RequestError::ShortPacket);
        }
        let cmd = p[1];
        let addr_type = p[3];
        let (dest_host, addr_len) = match addr_type {
            ATYPE_IPV4 => (read_ipv4(&p, 4)?, 4),
            ATYPE_IPV6 => (read_ipv6(&p, 4)?, 16),
            ATYPE_DOMAIN => {
                let host = read_lpstring(&p, 4)?;
                let len = host.len() + 1;
                (host, len)
            }
            t => return Err(RequestError::InvalidAddrType(t)),
        };
        let dest_port = read_port(&p, 4 + addr_len)?;
        Ok(Self {
            cmd,
            addr_type,
            dest_host,
            dest_port,
            packet: p,
            request_data: bytes::Bytes::new(),
            responded: false,
        })
    }
}

#[async_trait]
impl Requester for Socks5Request {
    fn command(&self) -> &str {
        match self.cmd {
            CMD_CONNECT => "CONNECT",
            CMD_BIND => "BIND",
            CMD_UDP_ASSOCIATE => "UDP",
            _ => "",
        }
    }

    fn target(&self) -> String {
        self.host()
    }

    fn host(&self) -> String {
        format!("{}:{}", self.dest_host, self.dest_port)
    }

    fn hostname(&self) -> &str {
        &self.dest_host
    }

    fn port(&self) -> u16 {
        self.dest_port
    }

    async fn get_request(&mut self, client: &mut BufConn) -> std::io::Result<()> {
        if self.responded {
            return Ok(());
        }
        client.write_all(&REPLY_GRANTED).await?;
        self.responded = true;
        self.request_data = bytes::Bytes::from(client.receive_data().await?);
        Ok(())
    }

    async fn send(
        &mut self,
        mut fw: Forwarder<'_>,
        _via_proxy: bool,
        segment: bool,
    ) -> TunnelVerdict {
        let write = async {
            if segment {
                let at = sni_split_at(&self.request_data, &self.dest_host);
                fw.right.split_write(&self.request_data, at).await
            } else {
                fw.right.write_all(&self.request_data).await
            }
        };
        match timeout(fw.timeout, write).await {
            Ok(Ok(())) => fw.tunnel().await,
            Ok(Err(e)) => TunnelVerdict {
                restart: false,
                error: Some(e),
            },
            Err(_) => TunnelVerdict {
                restart: false,
                error: Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "i/o timeout",
                )),
            },
        }
    }
}
