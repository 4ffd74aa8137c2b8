//! Listeners and protocol front-ends
//!
//! Every accepted connection is demultiplexed by its first byte: 0x05 is
//! SOCKS5, 0x04 is SOCKS4a, anything else is treated as HTTP. Each
//! connection runs in its own task; a failing connection never takes the
//! listener down.

mod http;
mod socks4a;
mod socks5;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::conn::BufConn;
use crate::dispatch::AppContext;

/// One listening address bound to the shared context.
pub struct Listener {
    pub addr: String,
    pub ctx: Arc<AppContext>,
    /// PAC file served by the HTTP front-end at `/<filename>`.
    pub pac_file: Option<PathBuf>,
}

impl Listener {
    pub fn new(addr: String, ctx: Arc<AppContext>, pac_file: Option<PathBuf>) -> Self {
        Self {
            addr,
            ctx,
            pac_file,
        }
    }

    /// Accept and serve until the listener dies.
    pub async fn listen_and_serve(self) {
        let listener = match TcpListener::bind(&self.addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("failed to listen on {}: {}", self.addr, e);
                return;
            }
        };
        info!("listening on {}", self.addr);

        let pac = self.pac_file.map(Arc::new);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept: {}", e);
                    continue;
                }
            };
            debug!("new connection from {}", peer);
            let ctx = Arc::clone(&self.ctx);
            let pac = pac.clone();
            tokio::spawn(async move {
                serve(ctx, pac, stream).await;
            });
        }
    }
}

/// Serve one client: peek the first byte, hand off to the right
/// front-end.
async fn serve(
    ctx: Arc<AppContext>,
    pac: Option<Arc<PathBuf>>,
    stream: tokio::net::TcpStream,
) {
    let mut conn = match BufConn::new(stream) {
        Ok(c) => c,
        Err(e) => {
            debug!("drop connection: {}", e);
            return;
        }
    };

    let first = match timeout(2 * ctx.timeout, conn.peek_byte()).await {
        Ok(Ok(b)) => b,
        Ok(Err(e)) => {
            debug!("drop {}, error: {}", conn.peer_addr(), e);
            return;
        }
        Err(_) => {
            debug!("drop {}, no data", conn.peer_addr());
            return;
        }
    };

    match first {
        0x05 => socks5::serve(&ctx, &mut conn).await,
        0x04 => socks4a::serve(&ctx, &mut conn).await,
        _ => http::serve(&ctx, pac.as_ref().map(|p| p.as_path()), &mut conn).await,
    };
    conn.shutdown().await;
}
