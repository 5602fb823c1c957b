//! Liveness probing over the server's own wire protocol.
//!
//! A sandbox counts as alive when it completes a startup handshake with
//! `AuthenticationOk` for at least one configured role. Refused connections,
//! timeouts, password challenges and `ErrorResponse` all count as dead.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::trace;

use crate::config::ProbeConfig;

/// Protocol version 3.0
const PROTOCOL_VERSION: i32 = 196_608;
const AUTH_OK: i32 = 0;
const PROBE_DATABASE: &str = "postgres";

/// Answers "is anything healthy listening on this port?"
pub trait Prober: Send + Sync {
    fn is_alive(&self, port: u16) -> bool;
}

/// Probes 127.0.0.1 with a startup message per configured role.
pub struct PgProber {
    users: Vec<String>,
    timeout: Duration,
}

impl PgProber {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            users: config.users.clone(),
            timeout: config.timeout(),
        }
    }
}

impl Prober for PgProber {
    fn is_alive(&self, port: u16) -> bool {
        for user in &self.users {
            match handshake(port, user, self.timeout) {
                Ok(()) => {
                    trace!(port, user, "probe:alive");
                    return true;
                }
                Err(e) => trace!(port, user, error = %e, "probe:rejected"),
            }
        }
        false
    }
}

fn handshake(port: u16, user: &str, timeout: Duration) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .with_context(|| format!("connect to {addr}"))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream
        .write_all(&startup_message(user, PROBE_DATABASE))
        .context("send startup message")?;

    let mut header = [0u8; 5];
    stream
        .read_exact(&mut header)
        .context("read startup reply")?;
    let tag = header[0];
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);

    match tag {
        b'R' if len >= 8 => {
            let mut code = [0u8; 4];
            stream.read_exact(&mut code).context("read auth code")?;
            let code = i32::from_be_bytes(code);
            if code != AUTH_OK {
                bail!("server requested authentication method {code}");
            }
            // Terminate politely; the answer is already known
            let _ = stream.write_all(&[b'X', 0, 0, 0, 4]);
            Ok(())
        }
        b'E' => bail!("server sent ErrorResponse"),
        other => bail!("unexpected reply tag {:?}", other as char),
    }
}

/// StartupMessage: length, protocol version, then NUL-terminated key/value pairs.
fn startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (key, value) in [("user", user), ("database", database)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut msg = Vec::with_capacity(body.len() + 4);
    msg.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    msg.extend_from_slice(&body);
    msg
}

/// Probe until the port answers or `attempts` run out.
pub fn wait_until_alive(prober: &dyn Prober, port: u16, config: &ProbeConfig) -> bool {
    let attempts = config.attempts.max(1);
    for attempt in 1..=attempts {
        if prober.is_alive(port) {
            return true;
        }
        if attempt < attempts {
            std::thread::sleep(config.interval());
        }
    }
    false
}
