//! SOCKS4a requests

use async_trait::async_trait;
use tokio::time::timeout;

use super::socks::{read_cstring, read_ipv4, read_port};
use super::{sni_split_at, Requester, RequestError, CMD_BIND, CMD_CONNECT};
use crate::conn::BufConn;
use crate::relay::{Forwarder, TunnelVerdict};

/// Reply granting the request, in the SOCKS4 reply shape.
const REPLY_GRANTED: [u8; 8] = [0, 0x5a, 0, 0, 0, 0, 0, 0];

/// A parsed SOCKS4a client request.
#[derive(Debug)]
pub struct Socks4aRequest {
    pub cmd: u8,
    pub dest_host: String,
    pub dest_port: u16,
    /// The raw request packet as received.
    pub packet: Vec<u8>,
    /// Cached first client packet after the ack.
    request_data: bytes::Bytes,
    responded: bool,
}

impl Socks4aRequest {
    /// Parse one request burst. The 4a form (first address octet zero)
    /// carries the hostname after the NUL-terminated user id.
    pub async fn read_from(client: &mut BufConn) -> Result<Self, RequestError> {
        let p = client.receive_data().await?;
        if p.is_empty() || p[0] != 4 {
            return Err(RequestError::NotSocks4a);
        }
        if p.len() < 10 {
            return Err(RequestError::ShortPacket);
        }
        let cmd = p[1];
        let dest_port = read_port(&p, 2)?;
        let dest_host = if p[4] > 0 {
            read_ipv4(&p, 4)?
        } else {
            let (_user, end) = read_cstring(&p, 8)?;
            let (host, _) = read_cstring(&p, end + 1)?;
            host
        };
        Ok(Self {
            cmd,
            dest_host,
            dest_port,
            packet: p,
            request_data: bytes::Bytes::new(),
            responded: false,
        })
    }
}

#[async_trait]
impl Requester for Socks4aRequest {
    fn command(&self) -> &str {
        match self.cmd {
            CMD_CONNECT => "CONNECT",
            CMD_BIND => "BIND",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::dial_addr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn conn_with(data: &'static [u8]) -> BufConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(data).await.unwrap();
            // keep the socket alive long enough to be read
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        dial_addr(addr, Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_parse_4a_hostname_form() {
        let mut packet = vec![4u8, 1, 0x01, 0xbb, 0, 0, 0, 1];
        packet.extend_from_slice(b"user\x00");
        packet.extend_from_slice(b"example.com\x00");
        let mut conn = conn_with(Box::leak(packet.into_boxed_slice())).await;
        let req = Socks4aRequest::read_from(&mut conn).await.unwrap();
        assert_eq!(req.cmd, CMD_CONNECT);
        assert_eq!(req.dest_host, "example.com");
        assert_eq!(req.dest_port, 443);
        assert_eq!(req.command(), "CONNECT");
        assert_eq!(req.host(), "example.com:443");
    }

    #[tokio::test]
    async fn test_parse_ipv4_form() {
        let packet: &[u8] = &[4, 1, 0x00, 0x50, 10, 0, 0, 7, b'u', 0];
        let mut conn = conn_with(packet).await;
        let req = Socks4aRequest::read_from(&mut conn).await.unwrap();
        assert_eq!(req.dest_host, "10.0.0.7");
        assert_eq!(req.dest_port, 80);
    }

    #[tokio::test]
    async fn test_parse_rejects_wrong_version() {
        let mut conn = conn_with(&[5, 1, 0, 0, 0, 0, 0, 0, 0, 0]).await;
        assert!(matches!(
            Socks4aRequest::read_from(&mut conn).await.unwrap_err(),
            RequestError::NotSocks4a
        ));
    }

    #[tokio::test]
    async fn test_parse_rejects_short_packet() {
        let mut conn = conn_with(&[4, 1, 0, 80]).await;
        assert!(matches!(
            Socks4aRequest::read_from(&mut conn).await.unwrap_err(),
            RequestError::ShortPacket
        ));
    }
}
