//! Control channel: live reconfiguration over a private TCP listener.
//!
//! Exactly one request/response exchange per accepted connection. Requests
//! and responses are framed with a big-endian u64 payload length; the
//! request payload is `HMAC-SHA-256(key, message) || message`. A truncated
//! frame closes the connection with no reply.

use std::sync::Arc;

use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::codec::{self, Command, Reply};
use crate::state::SharedState;

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC-SHA-256 tag prefixing every request message.
pub const HMAC_LEN: usize = 32;

/// Upper bound on a control frame; anything larger is treated as garbage.
pub const MAX_FRAME: u64 = 1024 * 1024;

/// Verify the MAC prefix of a request payload, returning the message on
/// success. Payloads shorter than the tag fail closed.
pub fn authenticate<'a>(key: &[u8], payload: &'a [u8]) -> Option<&'a [u8]> {
    if payload.len() < HMAC_LEN {
        return None;
    }
    let (tag, message) = payload.split_at(HMAC_LEN);
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(tag).ok()?;
    Some(message)
}

/// Prefix a message with its MAC, producing a request payload.
pub fn seal(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let tag = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(HMAC_LEN + message.len());
    payload.extend_from_slice(&tag);
    payload.extend_from_slice(message);
    payload
}

/// Read one length-prefixed frame. Returns `None` when the peer closed or
/// the frame is truncated or oversized.
pub async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    stream.read_exact(&mut len_buf).await.ok()?;

    let len = u64::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return None;
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some(payload)
}

/// Write one length-prefixed frame.
pub async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Run the control listener. Each accepted connection is served by its own
/// task; mutations are serialized through the shared state's lock.
pub async fn run_control_listener(
    listener: TcpListener,
    key: Arc<Vec<u8>>,
    state: Arc<SharedState>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Control listener started");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Control accept error");
                continue;
            }
        };

        let key = key.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_control_conn(stream, &key, &state).await {
                debug!(peer = %peer_addr, error = %e, "Control connection error");
            }
        });
    }
}

async fn handle_control_conn(
    mut stream: TcpStream,
    key: &[u8],
    state: &SharedState,
) -> Result<()> {
    let Some(payload) = read_frame(&mut stream).await else {
        // Truncated or oversized request: close with no reply.
        debug!("Truncated control request");
        return Ok(());
    };

    let reply = match authenticate(key, &payload) {
        None => {
            warn!("Control request failed authentication");
            Reply::failure(3, "authentication failure")
        }
        Some(message) => match codec::cmd_of_bytes(message) {
            Err(e) => Reply::failure(2, e.to_string()),
            Ok(cmd) => dispatch(cmd, state).await,
        },
    };

    let bytes = codec::reply_to_bytes(&reply)?;
    write_frame(&mut stream, &bytes).await?;
    Ok(())
}

async fn dispatch(cmd: Command, state: &SharedState) -> Reply {
    match cmd {
        Command::Add { sni, host, port } => match state.add(&sni, host, port).await {
            Ok(()) => {
                info!(sni = %sni, %host, port, "Routing entry added");
                Reply::ok(format!("{} was successfully added", sni))
            }
            Err(e) => Reply::failure(1, format!("error {} adding {}", e, sni)),
        },
        Command::Remove { sni } => match state.remove(&sni).await {
            Ok(()) => {
                info!(sni = %sni, "Routing entry removed");
                Reply::ok(format!("{} was successfully removed", sni))
            }
            Err(e) => Reply::failure(1, format!("error {} removing {}", e, sni)),
        },
        Command::List => Reply::Snis {
            entries: state.list().await,
        },
    }
}
