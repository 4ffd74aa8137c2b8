//! SOCKS4a bond

use super::{BufConn, ConnError};

/// Bond a SOCKS4a proxy connection: one CONNECT packet in the 4a hostname
/// form, one reply, grant code 0x5A.
pub(super) async fn bond(
    conn: &mut BufConn,
    command: &str,
    host: &str,
    port: u16,
) -> Result<(), ConnError> {
    if !command.eq_ignore_ascii_case("CONNECT") {
        return Err(ConnError::UnsupportedCommand {
            scheme: "socks4a",
            command: command.to_string(),
        });
    }
    if host.len() > 256 {
        return Err(ConnError::HostTooLong(host.to_string()));
    }

    let mut data = vec![4u8, 1];
    data.extend_from_slice(&port.to_be_bytes());
    // 0.0.0.1 marks the 4a form: the hostname follows the user id
    data.extend_from_slice(&[0, 0, 0, 1]);
    data.push(0);
    data.extend_from_slice(host.as_bytes());
    data.push(0);
    conn.write_all(&data).await?;

    let reply = conn.receive_data().await?;
    if reply.len() < 2 {
        return Err(ConnError::ShortReply);
    }
    if reply[1] == 0x5a {
        Ok(())
    } else {
        Err(ConnError::HandshakeFailed("socks4a CONNECT failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{bond, dial_addr, Scheme};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_socks4a_bond_packet_shape() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            let mut want = vec![4u8, 1, 0x01, 0xbb, 0, 0, 0, 1, 0];
            want.extend_from_slice(b"example.com");
            want.push(0);
            assert_eq!(&buf[..n], &want[..]);
            socket.write_all(&[0, 0x5a, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let mut conn = dial_addr(addr, Duration::from_secs(1)).await.unwrap();
        bond(
            &mut conn,
            Scheme::Socks4a,
            "CONNECT",
            "example.com",
            443,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_socks4a_bond_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0, 0x5b, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let mut conn = dial_addr(addr, Duration::from_secs(1)).await.unwrap();
        assert!(bond(
            &mut conn,
            Scheme::Socks4a,
            "CONNECT",
            "example.com",
            443,
            Duration::from_secs(1),
        )
        .await
        .is_err());
    }
}
