//! SOCKS5 bond (no-auth)

use super::{BufConn, ConnError};

/// Bond a SOCKS5 proxy connection: no-auth method selection, then a
/// CONNECT request in the domain-name form.
pub(super) async fn bond(
    conn: &mut BufConn,
    command: &str,
    host: &str,
    port: u16,
) -> Result<(), ConnError> {
    if !command.eq_ignore_ascii_case("CONNECT") {
        return Err(ConnError::UnsupportedCommand {
            scheme: "socks5",
            command: command.to_string(),
        });
    }
    if host.len() > 256 {
        return Err(ConnError::HostTooLong(host.to_string()));
    }

    conn.write_all(&[5, 1, 0]).await?;
    let reply = conn.receive_data().await?;
    if reply.len() < 2 {
        return Err(ConnError::ShortReply);
    }
    if reply[1] != 0 {
        return Err(ConnError::HandshakeFailed("socks5 authorization failed"));
    }

    let mut data = vec![5u8, 1, 0, 3, host.len() as u8];
    data.extend_from_slice(host.as_bytes());
    data.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&data).await?;

    let reply = conn.receive_data().await?;
    if reply.len() < 2 {
        return Err(ConnError::ShortReply);
    }
    if reply[1] == 0 {
        Ok(())
    } else {
        Err(ConnError::HandshakeFailed("socks5 CONNECT failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{bond, dial_addr, Scheme};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_socks5_bond_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[5, 1, 0]);
            socket.write_all(&[5, 0]).await.unwrap();

            let n = socket.read(&mut buf).await.unwrap();
            let mut want = vec![5u8, 1, 0, 3, 11];
            want.extend_from_slice(b"example.com");
            want.extend_from_slice(&443u16.to_be_bytes());
            assert_eq!(&buf[..n], &want[..]);
            socket
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut conn = dial_addr(addr, Duration::from_secs(1)).await.unwrap();
        bond(
            &mut conn,
            Scheme::Socks5,
            "CONNECT",
            "example.com",
            443,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_socks5_bond_auth_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[5, 0xff]).await.unwrap();
        });

        let mut conn = dial_addr(addr, Duration::from_secs(1)).await.unwrap();
        assert!(bond(
            &mut conn,
            Scheme::Socks5,
            "CONNECT",
            "example.com",
            443,
            Duration::from_secs(1),
        )
        .await
        .is_err());
    }
}
