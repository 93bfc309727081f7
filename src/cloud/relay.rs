//! Stream-relay channel: handshake, stream init, and keepalive.
//!
//! The relay authenticates the stream with the session/handle pair from
//! login, echoed inside a 256-byte opening packet:
//! ```text
//! off  0-3   u32 LE 0x012D
//! off  4-7   u32 LE 0x03EA
//! off  8-55  domain, NUL-padded to 48 bytes
//! off 56-57  u16 LE 0x0000
//! off 58-59  u16 LE 0x13BA
//! off 60-61  u16 LE 0x0000
//! off 62-65  u32 LE device id
//! off 66-69  u32 LE handle
//! off 70-73  u32 LE session
//! ```
//! After a `status == 4` acknowledgement the client sends one init packet
//! and then keepalives for as long as the read loop runs.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ClientError, Result};

use super::pack_domain;

const OPEN_TAG: u32 = 0x012D;
const OPEN_KIND: u32 = 0x03EA;
const OPEN_CHANNEL: u16 = 0x13BA;

/// Handshake status meaning the relay accepted the session.
const STATUS_ACCEPTED: i32 = 4;

/// Sent once, zero-padded to 256 bytes, right after the handshake.
const INIT_PACKET: [u8; 16] = [
    0x2F, 0x01, 0x00, 0x00, 0x01, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// 16-byte keepalive, sent raw.
const KEEPALIVE_PACKET: [u8; 16] = [
    0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Minimum gap between keepalives while streaming.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Relay read timeout; a keepalive goes out immediately when it fires.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// An authenticated relay connection delivering the raw media stream.
#[derive(Debug)]
pub struct RelayStream {
    stream: TcpStream,
    last_keepalive: Instant,
}

impl RelayStream {
    /// Connect to the relay and authenticate the session on it.
    pub async fn open(
        server: &str,
        port: u16,
        device_id: u32,
        domain: &str,
        handle: u32,
        session: u32,
    ) -> Result<Self> {
        let mut stream = timeout(READ_TIMEOUT, TcpStream::connect((server, port)))
            .await
            .map_err(|_| timed_out("relay connect"))??;
        tracing::info!("connected to stream relay {}:{}", server, port);

        let packet = build_open_packet(device_id, domain, handle, session);
        stream.write_all(&packet).await?;

        let mut response = [0u8; 256];
        let n = timeout(READ_TIMEOUT, stream.read(&mut response))
            .await
            .map_err(|_| timed_out("relay handshake"))??;

        if n < 12 || response[0..2] != [0x91, 0x01] {
            return Err(ClientError::Protocol(format!(
                "unexpected relay handshake response ({n} bytes)"
            )));
        }
        let status = i32::from_le_bytes([response[8], response[9], response[10], response[11]]);
        if status != STATUS_ACCEPTED {
            return Err(ClientError::Protocol(format!(
                "relay rejected session (status={status})"
            )));
        }
        tracing::info!("stream handshake successful");

        let mut init = [0u8; 256];
        init[..INIT_PACKET.len()].copy_from_slice(&INIT_PACKET);
        stream.write_all(&init).await?;
        stream.write_all(&KEEPALIVE_PACKET).await?;

        Ok(Self {
            stream,
            last_keepalive: Instant::now(),
        })
    }

    /// Read more stream bytes into `buf`.
    ///
    /// Returns `Ok(None)` after a quiet 30 s (a keepalive has already been
    /// sent); `Ok(Some(0))` means the relay closed the connection.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match timeout(READ_TIMEOUT, self.stream.read(buf)).await {
            Ok(n) => Ok(Some(n?)),
            Err(_) => {
                tracing::debug!("relay read timeout, sending keepalive");
                self.send_keepalive().await?;
                Ok(None)
            }
        }
    }

    /// Send a keepalive if the cadence interval has elapsed.
    pub async fn tick_keepalive(&mut self) -> Result<()> {
        if self.last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            self.send_keepalive().await?;
        }
        Ok(())
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        self.stream.write_all(&KEEPALIVE_PACKET).await?;
        self.last_keepalive = Instant::now();
        Ok(())
    }
}

fn build_open_packet(device_id: u32, domain: &str, handle: u32, session: u32) -> [u8; 256] {
    let mut packet = [0u8; 256];
    packet[0..4].copy_from_slice(&OPEN_TAG.to_le_bytes());
    packet[4..8].copy_from_slice(&OPEN_KIND.to_le_bytes());
    packet[8..56].copy_from_slice(&pack_domain(domain));
    // off 56..58 stays zero
    packet[58..60].copy_from_slice(&OPEN_CHANNEL.to_le_bytes());
    // off 60..62 stays zero
    packet[62..66].copy_from_slice(&device_id.to_le_bytes());
    packet[66..70].copy_from_slice(&handle.to_le_bytes());
    packet[70..74].copy_from_slice(&session.to_le_bytes());
    packet
}

fn timed_out(what: &str) -> ClientError {
    ClientError::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_wire_constants() {
        assert_eq!(INIT_PACKET[0..6], [0x2F, 0x01, 0x00, 0x00, 0x01, 0x30]);
        assert_eq!(KEEPALIVE_PACKET[0], 0x01);
        assert_eq!(KEEPALIVE_PACKET[1], 0x21);
        assert_eq!(KEEPALIVE_PACKET[9], 0x10);
        assert!(KEEPALIVE_PACKET[2..9].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_open_packet_layout() {
        let packet = build_open_packet(12345678, "12345678.nvdvr.net", 222, 111);
        assert_eq!(&packet[0..8], &[0x2D, 0x01, 0x00, 0x00, 0xEA, 0x03, 0x00, 0x00]);
        assert_eq!(&packet[8..26], b"12345678.nvdvr.net");
        assert!(packet[26..56].iter().all(|&b| b == 0));
        assert_eq!(&packet[56..62], &[0x00, 0x00, 0xBA, 0x13, 0x00, 0x00]);
        assert_eq!(&packet[62..66], &12345678u32.to_le_bytes());
        assert_eq!(&packet[66..70], &222u32.to_le_bytes());
        assert_eq!(&packet[70..74], &111u32.to_le_bytes());
        assert!(packet[74..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_handshake_against_fake_relay() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            let relay = tokio::spawn(async move {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut open = [0u8; 256];
                sock.read_exact(&mut open).await.unwrap();
                assert_eq!(&open[0..4], &OPEN_TAG.to_le_bytes());

                let mut response = [0u8; 256];
                response[0] = 0x91;
                response[1] = 0x01;
                response[8..12].copy_from_slice(&STATUS_ACCEPTED.to_le_bytes());
                sock.write_all(&response).await.unwrap();

                let mut init = [0u8; 256];
                sock.read_exact(&mut init).await.unwrap();
                assert_eq!(init[..16], INIT_PACKET);
                let mut keepalive = [0u8; 16];
                sock.read_exact(&mut keepalive).await.unwrap();
                assert_eq!(keepalive, KEEPALIVE_PACKET);
            });

            let stream =
                RelayStream::open("127.0.0.1", port, 12345678, "12345678.nvdvr.net", 222, 111)
                    .await
                    .unwrap();
            drop(stream);
            relay.await.unwrap();
        });
    }

    #[test]
    fn test_handshake_rejected_status() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            tokio::spawn(async move {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut open = [0u8; 256];
                sock.read_exact(&mut open).await.unwrap();
                let mut response = [0u8; 256];
                response[0] = 0x91;
                response[1] = 0x01;
                response[8..12].copy_from_slice(&(-1i32).to_le_bytes());
                sock.write_all(&response).await.unwrap();
            });

            let err = RelayStream::open("127.0.0.1", port, 1, "1.nvdvr.net", 2, 3)
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::Protocol(_)));
        });
    }
}
