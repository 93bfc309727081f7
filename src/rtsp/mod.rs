//! RTSP session server: TCP control channel, UDP media fan-out.
//!
//! One task accepts clients on the control port; each client gets its own
//! task speaking the OPTIONS/DESCRIBE/SETUP/PLAY/TEARDOWN subset. Media
//! goes out over a per-session UDP socket. All enrolled viewers share one
//! packetizer, so everyone receives the same RTP packets.
//!
//! Connect with e.g. `vlc rtsp://localhost:8554/stream`.

pub mod rtp;
pub mod sdp;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Fallback client media port when SETUP omits one.
const FALLBACK_CLIENT_PORT: u16 = 5000;

/// One enrolled media receiver.
struct Viewer {
    /// Control-connection peer, used to unenroll on disconnect.
    conn: SocketAddr,
    media: Arc<UdpSocket>,
    dest: SocketAddr,
}

/// Live RTSP server fanning the decrypted stream out to media players.
pub struct RtspServer {
    port: u16,
    session_id: String,
    viewers: Mutex<Vec<Viewer>>,
    packetizer: Mutex<rtp::Packetizer>,
    params: Mutex<sdp::ParameterSets>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RtspServer {
    /// Bind the control port and start accepting clients.
    pub async fn start(port: u16) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind RTSP port {port}"))?;
        let port = listener.local_addr()?.port();

        let server = Arc::new(Self {
            port,
            session_id: format!("{}", 10_000_000 + rtp::random_u32() % 90_000_000),
            viewers: Mutex::new(Vec::new()),
            packetizer: Mutex::new(rtp::Packetizer::new()),
            params: Mutex::new(sdp::ParameterSets::default()),
            accept_task: std::sync::Mutex::new(None),
        });

        let accept = {
            let server = server.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((sock, peer)) => {
                            tracing::info!("rtsp client connected from {peer}");
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(server, sock, peer).await {
                                    tracing::debug!("rtsp client {peer}: {e:#}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("rtsp accept failed: {e}");
                            break;
                        }
                    }
                }
            })
        };
        *server.accept_task.lock().expect("accept task lock") = Some(accept);

        tracing::info!("rtsp server listening on rtsp://localhost:{port}/stream");
        Ok(server)
    }

    /// The bound control port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Packetize one decrypted Annex-B access unit and send it to every
    /// enrolled viewer. Viewers whose socket errors are dropped.
    pub async fn send_frame(&self, frame: &[u8]) {
        // Keep capturing parameter sets even before the first viewer shows
        // up, so a DESCRIBE can carry sprop-* from the start.
        {
            let mut params = self.params.lock().await;
            if !params.complete() {
                for nal in rtp::parse_nal_units(frame) {
                    params.observe(nal);
                }
            }
        }

        let mut viewers = self.viewers.lock().await;
        if viewers.is_empty() {
            return;
        }

        let packets = {
            let nals = rtp::parse_nal_units(frame);
            let mut packetizer = self.packetizer.lock().await;
            let mut packets = Vec::new();
            for (i, nal) in nals.iter().enumerate() {
                packets.extend(packetizer.packetize_nal(nal, i + 1 == nals.len()));
            }
            packetizer.advance_timestamp(rtp::FRAME_INTERVAL_TICKS);
            packets
        };

        let mut dead = Vec::new();
        for viewer in viewers.iter() {
            for packet in &packets {
                if let Err(e) = viewer.media.send_to(packet, viewer.dest).await {
                    tracing::warn!("dropping viewer {}: {e}", viewer.dest);
                    dead.push(viewer.conn);
                    break;
                }
            }
        }
        if !dead.is_empty() {
            viewers.retain(|v| !dead.contains(&v.conn));
        }
    }

    /// Stop accepting clients and drop every enrolled viewer.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task lock").take() {
            task.abort();
        }
        self.viewers.lock().await.clear();
    }
}

async fn handle_client(
    server: Arc<RtspServer>,
    mut sock: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    // Media socket negotiated at SETUP, enrolled at PLAY.
    let mut pending: Option<(Arc<UdpSocket>, u16)> = None;
    let mut buf = vec![0u8; 4096];

    loop {
        let n = sock.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        let Some(method) = parse_method(&request) else {
            continue;
        };
        let cseq = find_header(&request, "CSeq").unwrap_or("0");

        match method {
            "OPTIONS" => {
                let reply = response(
                    200,
                    cseq,
                    &[("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN".into())],
                    None,
                );
                sock.write_all(reply.as_bytes()).await?;
            }
            "DESCRIBE" => {
                let body = sdp::generate(&*server.params.lock().await);
                let reply = response(
                    200,
                    cseq,
                    &[
                        ("Content-Type", "application/sdp".into()),
                        ("Content-Length", body.len().to_string()),
                    ],
                    Some(&body),
                );
                sock.write_all(reply.as_bytes()).await?;
            }
            "SETUP" => {
                let client_port = find_header(&request, "Transport")
                    .and_then(parse_client_port)
                    .unwrap_or(FALLBACK_CLIENT_PORT);
                let media = Arc::new(
                    UdpSocket::bind(("0.0.0.0", 0))
                        .await
                        .context("failed to bind media socket")?,
                );
                let server_port = media.local_addr()?.port();
                pending = Some((media, client_port));

                let transport = format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                    client_port,
                    client_port + 1,
                    server_port,
                    server_port + 1
                );
                let reply = response(
                    200,
                    cseq,
                    &[
                        ("Transport", transport),
                        ("Session", server.session_id.clone()),
                    ],
                    None,
                );
                sock.write_all(reply.as_bytes()).await?;
            }
            "PLAY" => {
                let reply = response(
                    200,
                    cseq,
                    &[
                        ("Session", server.session_id.clone()),
                        ("Range", "npt=0.000-".into()),
                    ],
                    None,
                );
                sock.write_all(reply.as_bytes()).await?;

                if let Some((media, client_port)) = pending.clone() {
                    let dest = SocketAddr::new(peer.ip(), client_port);
                    server.viewers.lock().await.push(Viewer {
                        conn: peer,
                        media,
                        dest,
                    });
                    tracing::info!("streaming to {dest}");
                }
            }
            "TEARDOWN" => {
                let reply = response(200, cseq, &[("Session", server.session_id.clone())], None);
                sock.write_all(reply.as_bytes()).await?;
                break;
            }
            other => {
                tracing::debug!("ignoring rtsp method {other}");
            }
        }
    }

    server.viewers.lock().await.retain(|v| v.conn != peer);
    tracing::info!("rtsp client disconnected: {peer}");
    Ok(())
}

fn parse_method(request: &str) -> Option<&str> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    // A request line is "METHOD uri RTSP/1.0".
    parts.next()?;
    Some(method)
}

/// Case-insensitive header lookup; tolerates CRLF and mixed-case names.
fn find_header<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// First port of a `client_port=N-M` Transport parameter.
fn parse_client_port(transport: &str) -> Option<u16> {
    transport.split(';').find_map(|part| {
        let ports = part.trim().strip_prefix("client_port=")?;
        ports.split('-').next()?.trim().parse().ok()
    })
}

fn response(code: u16, cseq: &str, headers: &[(&str, String)], body: Option<&str>) -> String {
    let reason = match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut out = format!("RTSP/1.0 {code} {reason}\r\nCSeq: {cseq}\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    if let Some(body) = body {
        out.push_str(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_find_header_case_insensitive() {
        let request = "SETUP rtsp://x/stream RTSP/1.0\r\ncseq: 3\r\nTRANSPORT: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        assert_eq!(find_header(request, "CSeq"), Some("3"));
        assert_eq!(
            find_header(request, "Transport"),
            Some("RTP/AVP;unicast;client_port=5000-5001")
        );
        assert_eq!(find_header(request, "Session"), None);
    }

    #[test]
    fn test_parse_client_port() {
        assert_eq!(
            parse_client_port("RTP/AVP;unicast;client_port=62044-62045"),
            Some(62044)
        );
        assert_eq!(parse_client_port("RTP/AVP;unicast"), None);
    }

    #[test]
    fn test_response_shape() {
        let reply = response(200, "7", &[("Session", "12345678".into())], None);
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(reply.contains("CSeq: 7\r\n"));
        assert!(reply.contains("Session: 12345678\r\n"));
        assert!(reply.ends_with("\r\n\r\n"));
    }

    async fn rtsp_roundtrip(sock: &mut TcpStream, request: String) -> String {
        sock.write_all(request.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .expect("response timed out")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_session_lifecycle_and_fanout() {
        tokio_test::block_on(async {
            let server = RtspServer::start(0).await.unwrap();
            let addr = format!("127.0.0.1:{}", server.port());

            // Receiver for the media the server will fan out.
            let media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let media_port = media.local_addr().unwrap().port();

            let mut sock = TcpStream::connect(&addr).await.unwrap();

            let reply = rtsp_roundtrip(
                &mut sock,
                "OPTIONS rtsp://x/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n".into(),
            )
            .await;
            assert!(reply.contains("200 OK"));
            assert!(reply.contains("CSeq: 1"));
            assert!(reply.contains("DESCRIBE"));

            let reply = rtsp_roundtrip(
                &mut sock,
                "DESCRIBE rtsp://x/stream RTSP/1.0\r\nCSeq: 2\r\n\r\n".into(),
            )
            .await;
            assert!(reply.contains("application/sdp"));
            assert!(reply.contains("m=video 0 RTP/AVP 96"));
            assert!(!reply.contains("sprop"));

            let reply = rtsp_roundtrip(
                &mut sock,
                format!(
                    "SETUP rtsp://x/stream RTSP/1.0\r\nCSeq: 3\r\n\
                     Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
                    media_port,
                    media_port + 1
                ),
            )
            .await;
            assert!(reply.contains("server_port="));
            assert!(reply.contains(&format!("Session: {}", server.session_id)));

            let reply = rtsp_roundtrip(
                &mut sock,
                "PLAY rtsp://x/stream RTSP/1.0\r\nCSeq: 4\r\n\r\n".into(),
            )
            .await;
            assert!(reply.contains("200 OK"));

            // PLAY enrollment races the response; wait for the viewer.
            for _ in 0..50 {
                if !server.viewers.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            let frame = [&[0u8, 0, 0, 1][..], &[19 << 1, 0x01, 0xAA, 0xBB]].concat();
            server.send_frame(&frame).await;

            let mut buf = [0u8; 2048];
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), media.recv_from(&mut buf))
                .await
                .expect("no rtp packet arrived")
                .unwrap();
            assert!(n > rtp::RTP_HEADER_SIZE);
            assert_eq!(buf[0], 0x80);
            assert_eq!(buf[1] & 0x7F, rtp::PT_H265);
            assert_eq!(&buf[rtp::RTP_HEADER_SIZE..n], &[19 << 1, 0x01, 0xAA, 0xBB]);

            server.shutdown().await;
        });
    }
}
