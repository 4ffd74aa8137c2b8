//! SOCKS4a front-end

use tracing::{debug, info};

use crate::conn::{BufConn, Scheme};
use crate::dispatch::Dispatcher;
use crate::request::{Socks4aRequest, CMD_BIND, CMD_CONNECT};

/// Serve one SOCKS4a client. Only CONNECT is implemented.
pub(super) async fn serve(ctx: &crate::dispatch::AppContext, conn: &mut BufConn) -> bool {
    let peer = conn.peer_addr();

    let mut req = match Socks4aRequest::read_from(conn).await {
        Ok(req) => req,
        Err(e) => {
            debug!("[socks4a] {} <= {}", peer, e);
            return false;
        }
    };

    match req.cmd {
        CMD_CONNECT => {
            let host = req.dest_host.clone();
            let port = req.dest_port;
            let mut dp = Dispatcher::new(ctx, Scheme::Socks4a, conn, host, port);
            dp.dispatch(&mut req).await
        }
        CMD_BIND => {
            info!("[socks4a] {} <= unimplemented BIND", peer);
            false
        }
        _ => {
            info!("[socks4a] {} <= unsupported command", peer);
            false
        }
    }
}
