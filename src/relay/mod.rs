//! Bidirectional relay with TLS phase tracking
//!
//! Relays bytes between the client (left) and the upstream (right) until
//! both directions finish. The server-to-client half watches TLS record
//! headers to tell a failed handshake from a working session, which is
//! what decides whether the dispatcher may retry: once the client has
//! committed data past a replayable point, a retry would corrupt the
//! stream, so the relay reports `restart` instead.
//!
//! Only the record header is inspected (first two bytes); the payload is
//! never parsed.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

use crate::conn::BufConn;

/// Relay buffer sizing: start small, grow while reads saturate, stop at
/// the cap. Big enough to take a whole TLS handshake flight in one read.
pub const MIN_BUFFER: usize = 100 * 1024;
pub const MAX_BUFFER: usize = 1000 * 1024;

/// TLS record types.
const TLS_HANDSHAKE: u8 = 0x16;
const TLS_CHANGE_CIPHER: u8 = 0x14;
const TLS_APPLICATION: u8 = 0x17;

/// Phase of the server-to-client stream.
const PHASE_INIT: u8 = 0;
const PHASE_DISABLED: u8 = 1;
const PHASE_HANDSHAKE: u8 = 2;
const PHASE_APPLICATION: u8 = 3;

/// Hook applied to client-to-upstream chunks (rewrites plain HTTP
/// requests on direct connections). Returning `None` forwards the chunk
/// unchanged.
pub trait Transform: Send + Sync {
    fn transform(&self, data: &[u8]) -> Option<Vec<u8>>;
}

/// What a finished tunnel means for the dispatcher.
#[derive(Debug)]
pub struct TunnelVerdict {
    /// The client already sent committed data (ClientHello or application
    /// records); the request must not be retried.
    pub restart: bool,
    /// The upstream-read error, when the session did not work out.
    pub error: Option<io::Error>,
}

impl TunnelVerdict {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// How a read loop ended.
enum ReadEnd {
    Eof,
    Timeout,
    Reset,
    Other(io::Error),
}

impl ReadEnd {
    fn classify(e: io::Error) -> Self {
        if is_reset(&e) {
            ReadEnd::Reset
        } else if is_timeout(&e) {
            ReadEnd::Timeout
        } else if is_eof(&e) {
            ReadEnd::Eof
        } else {
            ReadEnd::Other(e)
        }
    }

    fn into_error(self) -> io::Error {
        match self {
            ReadEnd::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
            ReadEnd::Timeout => io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"),
            ReadEnd::Reset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            ReadEnd::Other(e) => e,
        }
    }
}

pub fn is_timeout(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut
}

pub fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

pub fn is_eof(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof
}

/// The relay for one client-to-upstream pairing.
pub struct Forwarder<'a> {
    pub left: &'a mut BufConn,
    pub right: BufConn,
    pub left_transform: Option<Box<dyn Transform>>,
    /// Base timeout `T`; all idle budgets derive from it.
    pub timeout: Duration,
    /// Scale factor in [0.1, 1] for the long-lived TLS idle budget:
    /// unreliable destinations get shorter keepalive patience.
    pub wave: f64,
}

impl<'a> Forwarder<'a> {
    pub fn new(left: &'a mut BufConn, right: BufConn, timeout: Duration, wave: f64) -> Self {
        Self {
            left,
            right,
            left_transform: None,
            timeout,
            wave,
        }
    }

    pub fn with_transform(mut self, t: Box<dyn Transform>) -> Self {
        self.left_transform = Some(t);
        self
    }

    /// Relay until both directions finish, then report the verdict.
    pub async fn tunnel(self) -> TunnelVerdict {
        let Forwarder {
            left,
            mut right,
            left_transform,
            timeout,
            wave,
        } = self;

        let left_alive =
            Duration::from_secs_f64((1.0 + wave) * 10.0 * timeout.as_secs_f64());
        let right_alive = left_alive + timeout;
        let left_alive_ms = left_alive.as_millis() as u64;
        let right_alive_ms = right_alive.as_millis() as u64;

        // Idle budgets, shared between the two directions. Persisting an
        // established TLS session is worth a lot: it lets a retried
        // request reuse the connection without a fresh SNI exposure.
        let left_budget = AtomicU64::new((2 * timeout).as_millis() as u64);
        let right_budget = AtomicU64::new(timeout.as_millis() as u64);

        let phase = AtomicU8::new(PHASE_INIT);
        let got_right_data = AtomicBool::new(false);

        // Ending one direction unblocks the other immediately; the permit
        // survives if the peer is not waiting at that instant.
        let left_abort = Notify::new();
        let right_abort = Notify::new();

        let (lr, lw) = left.parts();
        let (rr, rw) = right.parts();

        let left_to_right = async {
            let mut buf = vec![0u8; MIN_BUFFER];
            let mut end: Option<ReadEnd> = None;
            loop {
                let budget = Duration::from_millis(left_budget.load(Ordering::Relaxed));
                let n = tokio::select! {
                    _ = left_abort.notified() => break,
                    r = tokio::time::timeout(budget, lr.read(&mut buf)) => match r {
                        Ok(Ok(0)) => {
                            end = Some(ReadEnd::Eof);
                            break;
                        }
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => {
                            end = Some(ReadEnd::classify(e));
                            break;
                        }
                        Err(_) => {
                            end = Some(ReadEnd::Timeout);
                            break;
                        }
                    },
                };

                // The client sent application data while the server is
                // still handshaking: it has committed to this session, so
                // stretch both budgets (some servers answer slowly).
                if phase.load(Ordering::Relaxed) == PHASE_HANDSHAKE
                    && buf[0] == TLS_APPLICATION
                    && n > 1
                    && buf[1] == 0x03
                {
                    left_budget.store(left_alive_ms, Ordering::Relaxed);
                    right_budget.store(right_alive_ms, Ordering::Relaxed);
                }

                let transformed = left_transform
                    .as_ref()
                    .and_then(|t| t.transform(&buf[..n]));
                let chunk: &[u8] = match &transformed {
                    Some(data) => data,
                    None => &buf[..n],
                };

                let budget = Duration::from_millis(right_budget.load(Ordering::Relaxed));
                match tokio::time::timeout(budget, rw.write_all(chunk)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }

                if n == buf.len() && buf.len() < MAX_BUFFER {
                    let grown = buf.len() + MIN_BUFFER;
                    buf = vec![0u8; grown];
                }
            }
            // A client that half-closed may still be owed the tail of the
            // response; only a reset or stall takes the upstream down too.
            if matches!(end, Some(ReadEnd::Reset) | Some(ReadEnd::Timeout)) {
                right_abort.notify_one();
            }
            end
        };

        let right_to_left = async {
            let mut buf = vec![0u8; MIN_BUFFER];
            let mut err: Option<io::Error> = None;
            loop {
                let budget = Duration::from_millis(right_budget.load(Ordering::Relaxed));
                let n = tokio::select! {
                    _ = right_abort.notified() => break,
                    r = tokio::time::timeout(budget, rr.read(&mut buf)) => match r {
                        Ok(Ok(0)) => {
                            err = Some(ReadEnd::Eof.into_error());
                            break;
                        }
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => {
                            err = Some(e);
                            break;
                        }
                        Err(_) => {
                            err = Some(ReadEnd::Timeout.into_error());
                            break;
                        }
                    },
                };

                match phase.load(Ordering::Relaxed) {
                    PHASE_INIT => {
                        if buf[0] == TLS_HANDSHAKE && n > 1 && buf[1] == 0x03 {
                            // TLS v1.2: ServerHello + Certificate + ...
                            // TLS v1.3: ServerHello + ChangeCipherSpec + app data
                            phase.store(PHASE_HANDSHAKE, Ordering::Relaxed);
                        } else {
                            phase.store(PHASE_DISABLED, Ordering::Relaxed);
                            got_right_data.store(true, Ordering::Relaxed);
                        }
                    }
                    PHASE_HANDSHAKE => {
                        if (buf[0] == TLS_HANDSHAKE || buf[0] == TLS_CHANGE_CIPHER)
                            && n > 1
                            && buf[1] == 0x03
                        {
                            // still handshaking; some servers idle long
                            // between here and the first app record
                            left_budget.store(left_alive_ms, Ordering::Relaxed);
                            right_budget.store(right_alive_ms, Ordering::Relaxed);
                        } else if buf[0] == TLS_APPLICATION && n > 1 && buf[1] == 0x03 {
                            phase.store(PHASE_APPLICATION, Ordering::Relaxed);
                            got_right_data.store(true, Ordering::Relaxed);
                            left_budget.store(left_alive_ms, Ordering::Relaxed);
                            right_budget.store(right_alive_ms, Ordering::Relaxed);
                        }
                    }
                    _ => {}
                }

                let budget = Duration::from_millis(left_budget.load(Ordering::Relaxed));
                match tokio::time::timeout(budget, lw.write_all(&buf[..n])).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }

                if n == buf.len() && buf.len() < MAX_BUFFER {
                    let grown = buf.len() + MIN_BUFFER;
                    buf = vec![0u8; grown];
                }
            }
            left_abort.notify_one();
            err
        };

        let (left_end, right_err) = tokio::join!(left_to_right, right_to_left);

        right.shutdown().await;

        let ok = got_right_data.load(Ordering::Relaxed)
            || matches!(left_end, Some(ReadEnd::Reset) | Some(ReadEnd::Eof));
        if ok {
            return TunnelVerdict {
                restart: false,
                error: None,
            };
        }
        let p = phase.load(Ordering::Relaxed);
        TunnelVerdict {
            restart: p == PHASE_HANDSHAKE || p == PHASE_APPLICATION,
            error: right_err,
        }
    }
}
