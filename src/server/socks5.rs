//! SOCKS5 front-end

use tracing::{debug, info};

use crate::conn::{BufConn, Scheme};
use crate::dispatch::Dispatcher;
use crate::request::{self, Socks5Request, CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE};

/// Serve one SOCKS5 client. Only CONNECT is implemented.
pub(super) async fn serve(ctx: &crate::dispatch::AppContext, conn: &mut BufConn) -> bool {
    let peer = conn.peer_addr();

    if let Err(e) = request::authorize(conn).await {
        debug!("[socks5] {} <= {}", peer, e);
        return false;
    }
    let mut req = match Socks5Request::read_from(conn).await {
        Ok(req) => req,
        Err(e) => {
            debug!("[socks5] {} <= {}", peer, e);
            return false;
        }
    };

    match req.cmd {
        CMD_CONNECT => {
            let host = req.dest_host.clone();
            let port = req.dest_port;
            let mut dp = Dispatcher::new(ctx, Scheme::Socks5, conn, host, port);
            dp.dispatch(&mut req).await
        }
        CMD_BIND => {
            info!("[socks5] {} <= unimplemented BIND", peer);
            false
        }
        CMD_UDP_ASSOCIATE => {
            info!("[socks5] {} <= unimplemented UDP ASSOCIATE", peer);
            false
        }
        _ => {
            info!("[socks5] {} <= unsupported command", peer);
            false
        }
    }
}
