//! HTTP front-end

use std::path::Path;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::conn::{BufConn, Scheme};
use crate::dispatch::Dispatcher;
use crate::request::{HttpRequest, Requester};

/// Serve one HTTP client: CONNECT and origin-form requests dispatch to
/// the destination; the PAC path answers locally.
pub(super) async fn serve(
    ctx: &crate::dispatch::AppContext,
    pac: Option<&Path>,
    conn: &mut BufConn,
) -> bool {
    let mut req = match timeout(2 * ctx.timeout, HttpRequest::read_from(conn)).await {
        Ok(Ok(req)) => req,
        Ok(Err(e)) => {
            debug!("[http] {}", e);
            return false;
        }
        Err(_) => {
            debug!("[http] {} request timed out", conn.peer_addr());
            return false;
        }
    };

    if req.url.hostname.is_empty() {
        if req.command() != "CONNECT" {
            if let Some(pac) = pac {
                if is_pac_path(req.url.request_uri(), pac) {
                    return serve_pac(conn, pac).await;
                }
            }
        }
        info!("[http] invalid request from {}", conn.peer_addr());
        return false;
    }

    let host = req.url.hostname.clone();
    let port = req.url.effective_port();
    let mut dp = Dispatcher::new(ctx, Scheme::Http, conn, host, port);
    dp.dispatch(&mut req).await
}

fn is_pac_path(request_uri: &str, pac: &Path) -> bool {
    let name = match pac.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    let path = request_uri.split('?').next().unwrap_or(request_uri);
    path.strip_prefix('/') == Some(name)
}

/// Answer the PAC request from the local file.
async fn serve_pac(conn: &mut BufConn, pac: &Path) -> bool {
    let body = match std::fs::read(pac) {
        Ok(b) => b,
        Err(e) => {
            warn!("[http] PAC file {}: {}", pac.display(), e);
            let _ = conn
                .write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")
                .await;
            return false;
        }
    };
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/x-ns-proxy-autoconfig\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let ok = conn.write_all(head.as_bytes()).await.is_ok()
        && conn.write_all(&body).await.is_ok();
    debug!("[http] served PAC {} to {}", pac.display(), conn.peer_addr());
    ok
}
