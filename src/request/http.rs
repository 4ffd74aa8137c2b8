//! HTTP requests: parsing, rewriting, replay
//!
//! Start lines and headers follow the RFC 7230 line grammar. Header names
//! keep the client's spelling and order; only the hop-by-hop set is
//! touched when a request is re-written for the upstream.

use async_trait::async_trait;
use tokio::time::timeout;

use super::{sni_split_at, Requester, RequestError};
use crate::conn::BufConn;
use crate::relay::{Forwarder, Transform, TunnelVerdict};

/// Headers that must not travel past this hop.
/// `Connection`, `Keep-Alive` and `Upgrade` stay: NTLM logon needs the
/// first two, websockets the third.
const HOP_BY_HOP: [&str; 6] = [
    "Proxy-Connection", // a long-lived misreading of the HTTP spec
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
];

/// A request target: enough of a URL for proxying, nothing more.
#[derive(Debug, Clone, Default)]
pub struct TargetUrl {
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    /// Path plus query, as sent.
    pub path: String,
}

impl TargetUrl {
    /// Parse `host[:port]` (the CONNECT authority form).
    pub fn parse_authority(s: &str) -> Result<Self, RequestError> {
        let (hostname, port) = split_host_port(s)?;
        if hostname.is_empty() {
            return Err(RequestError::MalformedHttp("empty host"));
        }
        Ok(Self {
            scheme: String::new(),
            hostname,
            port,
            path: String::new(),
        })
    }

    /// Parse `scheme://host[:port][/path]` (the absolute form).
    pub fn parse_absolute(s: &str) -> Result<Self, RequestError> {
        let (scheme, rest) = match s.split_once("://") {
            Some((sc, rest)) => (sc.to_ascii_lowercase(), rest),
            None => (String::new(), s),
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };
        let (hostname, port) = split_host_port(authority)?;
        Ok(Self {
            scheme,
            hostname,
            port,
            path,
        })
    }

    /// `host:port` when a port was given, bare host otherwise.
    pub fn host(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.hostname, p),
            None => self.hostname.clone(),
        }
    }

    /// The port to dial: explicit, or the scheme's well-known one.
    pub fn effective_port(&self) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        match self.scheme.as_str() {
            "https" => 443,
            _ => 80,
        }
    }

    /// The origin-form request URI.
    pub fn request_uri(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }
}

fn split_host_port(s: &str) -> Result<(String, Option<u16>), RequestError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (inner, tail) = rest
            .split_once(']')
            .ok_or(RequestError::MalformedHttp("unterminated IPv6 host"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(
                p.parse::<u16>()
                    .map_err(|_| RequestError::MalformedHttp("bad port"))?,
            ),
            None => None,
        };
        return Ok((inner.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => Ok((
            h.to_string(),
            Some(
                p.parse::<u16>()
                    .map_err(|_| RequestError::MalformedHttp("bad port"))?,
            ),
        )),
        _ => Ok((s.to_string(), None)),
    }
}

/// A parsed client HTTP request with everything needed to retry it:
/// the head, any body bytes that already arrived, and (for CONNECT) the
/// cached ClientHello.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    raw_target: String,
    pub proto: String,
    headers: Vec<(String, String)>,
    pub url: TargetUrl,
    /// Body bytes read together with the head; re-sent on retry.
    body: Vec<u8>,
    /// Cached first client packet after the CONNECT ack.
    tls_data: bytes::Bytes,
    responded: bool,
}

/// Outcome of parsing a byte burst that may not hold a full head yet.
pub(crate) enum Parsed {
    Complete(HttpRequest),
    /// No `\r\n\r\n` yet; feed more bytes.
    Partial,
}

impl HttpRequest {
    /// Parse a request from a single burst. Returns `Partial` until the
    /// whole head has arrived.
    pub(crate) fn parse(data: &[u8]) -> Result<Parsed, RequestError> {
        let head_end = match find_head_end(data) {
            Some(i) => i,
            None => return Ok(Parsed::Partial),
        };
        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| RequestError::MalformedHttp("head is not valid UTF-8"))?;
        let mut lines = head.split("\r\n");
        let start = lines.next().unwrap_or_default();
        let mut parts = start.splitn(3, ' ');
        let method = parts
            .next()
            .filter(|m| !m.is_empty())
            .ok_or(RequestError::MalformedHttp("bad start line"))?
            .to_string();
        let raw_target = parts
            .next()
            .ok_or(RequestError::MalformedHttp("bad start line"))?
            .to_string();
        let proto = parts
            .next()
            .ok_or(RequestError::MalformedHttp("bad start line"))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or(RequestError::MalformedHttp("bad header line"))?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }

        let url = if method == "CONNECT" {
            let mut url = TargetUrl::parse_authority(&raw_target)?;
            if url.port.is_none() {
                url.port = Some(443);
            }
            url
        } else {
            let mut url = TargetUrl::parse_absolute(&raw_target)?;
            if url.scheme.is_empty() && !url.hostname.is_empty() {
                url.scheme = "http".to_string();
            }
            url
        };

        Ok(Parsed::Complete(Self {
            method,
            raw_target,
            proto,
            headers,
            url,
            body: data[head_end + 4..].to_vec(),
            ..Default::default()
        }))
    }

    /// Read bursts from the client until a whole head is in.
    pub async fn read_from(client: &mut BufConn) -> Result<Self, RequestError> {
        let mut data = client.receive_data().await?;
        loop {
            match Self::parse(&data)? {
                Parsed::Complete(req) => return Ok(req),
                Parsed::Partial => {
                    let more = client.receive_data().await?;
                    data.extend_from_slice(&more);
                }
            }
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }

    /// Drop headers that must not cross this hop.
    fn clean_headers(&mut self) {
        self.headers
            .retain(|(k, _)| !HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)));
    }

    /// Serialize the head for the upstream: absolute-form target when
    /// talking to a proxy, origin-form otherwise.
    pub(crate) fn write_request(&mut self, out: &mut Vec<u8>, via_proxy: bool) {
        // Windows clients set `Proxy-Connection` rather than `Connection`
        let mut synthesize = false;
        let mut conn_value = self.header("Connection").unwrap_or("").to_string();
        if conn_value.is_empty() {
            synthesize = true;
            conn_value = self.header("Proxy-Connection").unwrap_or("").to_string();
        }
        if conn_value.is_empty() {
            conn_value = "close".to_string();
        }

        self.clean_headers();

        if synthesize {
            self.set_header("Connection", conn_value);
        }
        self.set_header("Host", self.url.host());

        let path = if via_proxy {
            self.raw_target.clone()
        } else {
            self.url.request_uri().to_string()
        };
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.proto.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

#[async_trait]
impl Requester for HttpRequest {
    fn command(&self) -> &str {
        &self.method
    }

    fn target(&self) -> String {
        self.raw_target.clone()
    }

    fn host(&self) -> String {
        self.url.host()
    }

    fn hostname(&self) -> &str {
        &self.url.hostname
    }

    fn port(&self) -> u16 {
        self.url.effective_port()
    }

    /// Ack the CONNECT and wait for the ClientHello. Cache-racing
    /// browsers and ad blockers abort here without sending one; those
    /// connections are dropped, there is nothing to replay.
    async fn get_request(&mut self, client: &mut BufConn) -> std::io::Result<()> {
        if self.responded {
            return Ok(());
        }
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        self.responded = true;
        self.tls_data = bytes::Bytes::from(client.receive_data().await?);
        Ok(())
    }

    async fn send(
        &mut self,
        mut fw: Forwarder<'_>,
        via_proxy: bool,
        segment: bool,
    ) -> TunnelVerdict {
        let dur = fw.timeout;
        if self.method == "CONNECT" {
            if self.tls_data.is_empty() {
                // nothing replayable arrived; drop silently
                return TunnelVerdict {
                    restart: false,
                    error: None,
                };
            }
            let write = async {
                if segment {
                    let at = sni_split_at(&self.tls_data, &self.url.hostname);
                    fw.right.split_write(&self.tls_data, at).await
                } else {
                    fw.right.write_all(&self.tls_data).await
                }
            };
            match timeout(dur, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return TunnelVerdict {
                        restart: false,
                        error: Some(e),
                    }
                }
                Err(_) => {
                    return TunnelVerdict {
                        restart: false,
                        error: Some(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "i/o timeout",
                        )),
                    }
                }
            }
        } else {
            let mut head = Vec::new();
            self.write_request(&mut head, via_proxy);
            let line_len = head
                .windows(2)
                .position(|w| w == b"\r\n")
                .map(|i| i + 2)
                .unwrap_or(0);
            let write = async {
                if segment {
                    // detach the start line from the headers
                    fw.right.split_write(&head, line_len).await?;
                } else {
                    fw.right.write_all(&head).await?;
                }
                if !self.body.is_empty() {
                    fw.right.write_all(&self.body).await?;
                }
                Ok::<(), std::io::Error>(())
            };
            match timeout(dur, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return TunnelVerdict {
                        restart: false,
                        error: Some(e),
                    }
                }
                Err(_) => {
                    return TunnelVerdict {
                        restart: false,
                        error: Some(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "i/o timeout",
                        )),
                    }
                }
            }
        }
        fw.tunnel().await
    }
}

/// Rewrites whole client bursts on direct plain-HTTP connections, so
/// follow-up requests on a kept-alive connection get the same header
/// treatment as the first.
pub struct RequestRewriter {
    pub via_proxy: bool,
}

impl Transform for RequestRewriter {
    fn transform(&self, data: &[u8]) -> Option<Vec<u8>> {
        match HttpRequest::parse(data) {
            Ok(Parsed::Complete(mut req)) => {
                let mut out = Vec::with_capacity(data.len());
                req.write_request(&mut out, self.via_proxy);
                out.extend_from_slice(&req.body);
                Some(out)
            }
            _ => None,
        }
    }
}
