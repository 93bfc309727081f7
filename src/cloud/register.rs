//! Cloud routing registration.
//!
//! A fixed 64-byte request primes the routing server to relay streams for
//! the device; idle 4G cameras in particular will not answer a stream
//! handshake until this nudge has gone out. Registration is best-effort —
//! the caller logs a failure and proceeds to login regardless.
//!
//! ```text
//! off  0-3   u32 LE 0x00AC
//! off  4-7   u32 LE 0x03F4
//! off  8-55  domain, NUL-padded to 48 bytes
//! off 56-59  u32 LE stream port
//! off 60-63  u32 LE device id
//! ```

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ClientError, Result};

use super::pack_domain;

const REGISTER_TAG: u32 = 0x00AC;
const REGISTER_KIND: u32 = 0x03F4;

/// Registration socket timeout (connect and the single read).
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the 64-byte registration packet.
fn build_packet(device_id: u32, domain: &str, stream_port: u16) -> [u8; 64] {
    let mut packet = [0u8; 64];
    packet[0..4].copy_from_slice(&REGISTER_TAG.to_le_bytes());
    packet[4..8].copy_from_slice(&REGISTER_KIND.to_le_bytes());
    packet[8..56].copy_from_slice(&pack_domain(domain));
    packet[56..60].copy_from_slice(&u32::from(stream_port).to_le_bytes());
    packet[60..64].copy_from_slice(&device_id.to_le_bytes());
    packet
}

/// Register the device with the cloud routing server.
pub async fn register(
    server: &str,
    port: u16,
    device_id: u32,
    domain: &str,
    stream_port: u16,
) -> Result<()> {
    let mut sock = timeout(REGISTER_TIMEOUT, TcpStream::connect((server, port)))
        .await
        .map_err(|_| timed_out("register connect"))??;
    tracing::debug!("connected to register server {}:{}", server, port);

    sock.write_all(&build_packet(device_id, domain, stream_port))
        .await?;

    let mut response = [0u8; 256];
    let n = timeout(REGISTER_TIMEOUT, sock.read(&mut response))
        .await
        .map_err(|_| timed_out("register response"))??;

    if n < 8 {
        return Err(ClientError::Protocol(format!(
            "short registration response: {n} bytes"
        )));
    }
    let status = u32::from_le_bytes([response[4], response[5], response[6], response[7]]);
    if status != 1 {
        return Err(ClientError::Protocol(format!(
            "registration rejected (status={status})"
        )));
    }

    tracing::info!("cloud registration accepted");
    Ok(())
}

fn timed_out(what: &str) -> ClientError {
    ClientError::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}
