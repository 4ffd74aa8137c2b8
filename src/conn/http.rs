//! HTTP CONNECT bond

use std::time::Duration;

use super::{BufConn, ConnError};

/// Bond an HTTP proxy connection: send CONNECT and accept any status line
/// carrying " 200 ". Proxies disagree wildly about the exact reason
/// phrase, so the check is deliberately lax.
pub(super) async fn bond(
    conn: &mut BufConn,
    command: &str,
    host: &str,
    port: u16,
) -> Result<(), ConnError> {
    if !command.eq_ignore_ascii_case("CONNECT") {
        // plain requests are replayed in absolute form, nothing to bond
        return Ok(());
    }

    let hostport = format!("{}:{}", host, port);
    let data = format!("CONNECT {hp} HTTP/1.1\r\nHost: {hp}\r\n\r\n", hp = hostport);
    conn.write_all(data.as_bytes()).await?;

    let line = conn.read_line_raw().await?;
    let ok = line.contains(" 200 ");

    // Drain the rest of the response head. Responses arrive fragmented
    // from some proxies, so wait briefly for stragglers.
    let mut waits = 0;
    let mut eoh = false;
    while !eoh && waits < 3 {
        if conn.buffered() > 0 {
            let line = conn.read_line_raw().await?;
            eoh = line == "\r\n";
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
            waits += 1;
        }
    }

    if ok {
        Ok(())
    } else {
        Err(ConnError::HandshakeFailed("http proxy: not available"))
    }
}
