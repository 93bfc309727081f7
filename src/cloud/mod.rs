//! V380 cloud client: control-channel login and session state.
//!
//! The flow against the vendor cloud is registration (best-effort), then a
//! framed JSON-RPC login on the API port, then a separate relay connection
//! authenticated with the granted session/handle pair. The handle also seeds
//! the per-session AES key.

pub mod register;
pub mod relay;
pub mod rpc;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::Endpoints;
use crate::crypto;
use crate::error::{ClientError, Result};

use relay::RelayStream;

/// Control-channel connect timeout. Reads on the control socket have no
/// deadline; the stream socket carries its own.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum control-channel response size.
const RESPONSE_BUF: usize = 8192;

/// An authenticated session and its derived stream key.
#[derive(Debug, Clone)]
pub struct Session {
    pub session: u32,
    pub handle: u32,
    pub(crate) aes_key: [u8; 16],
}

impl Session {
    pub(crate) fn key(&self) -> &[u8; 16] {
        &self.aes_key
    }
}

/// Client for one camera against the vendor cloud.
pub struct CloudClient {
    endpoints: Endpoints,
    device_id: u32,
    password: String,
    control: Option<TcpStream>,
    session: Option<Session>,
    battery: Option<i64>,
    audio_supported: bool,
}

impl CloudClient {
    pub fn new(device_id: u32, password: String, endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            device_id,
            password,
            control: None,
            session: None,
            battery: None,
            audio_supported: false,
        }
    }

    /// Canonical routing name for the device.
    pub fn domain(&self) -> String {
        format!("{}.nvdvr.net", self.device_id)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Battery percentage reported at login, if the camera sent one.
    pub fn battery(&self) -> Option<i64> {
        self.battery
    }

    /// Whether the camera reported audio capability at login.
    pub fn audio_supported(&self) -> bool {
        self.audio_supported
    }

    /// Register the device with the cloud routing server (best-effort).
    pub async fn register(&self) -> Result<()> {
        register::register(
            &self.endpoints.server,
            self.endpoints.register_port,
            self.device_id,
            &self.domain(),
            self.endpoints.stream_port,
        )
        .await
    }

    /// Connect the control channel to the API server.
    pub async fn connect(&mut self) -> Result<()> {
        let addr = (self.endpoints.server.as_str(), self.endpoints.api_port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ClientError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "API server connect timed out",
                ))
            })??;
        tracing::info!(
            "connected to API server {}:{}",
            self.endpoints.server,
            self.endpoints.api_port
        );
        self.control = Some(stream);
        Ok(())
    }

    /// Authenticate the device and adopt the granted session/handle pair.
    pub async fn login(&mut self) -> Result<&Session> {
        if self.control.is_none() {
            self.connect().await?;
        }

        let random_key = crypto::generate_random_key();
        let password = crypto::encrypt_password(&self.password, &random_key);
        // Key names are the vendor wire contract; randomKey rides in the clear.
        let params = serde_json::json!({
            "version": 31,
            "phoneType": 1012,
            "deviceId": self.device_id,
            "domain": self.domain(),
            "port": self.endpoints.stream_port,
            "accountId": 11,
            "username": self.device_id.to_string(),
            "password": password,
            "randomKey": std::str::from_utf8(&random_key).expect("random key is ASCII"),
            "connectType": 0,
            "securityLevel": 1,
            "agora": 0,
            "ectx": chrono::Utc::now().timestamp(),
            "p2pIdx": 0,
        });

        tracing::info!("sending login request");
        let reply: rpc::LoginReply = self.send_rpc("login", params).await?;

        if let Some(code) = reply.result.as_ref().and_then(|r| r.code) {
            if code != 0 {
                return Err(ClientError::Login(format!("server error code {code}")));
            }
        }
        let grant = reply
            .v380
            .ok_or_else(|| ClientError::Login("no session grant in response".into()))?;

        let session = Session {
            session: grant.session,
            handle: grant.handle,
            aes_key: crypto::derive_key(grant.handle),
        };
        tracing::info!(
            "login successful (session={}, handle={})",
            session.session,
            session.handle
        );
        tracing::debug!("stream key: {}", hex(&session.aes_key));

        if let Some(caps) = grant.pri {
            self.battery = caps.battery;
            self.audio_supported = caps.audio == Some(1);
            tracing::info!(
                "camera reports battery={:?}, audio={}",
                self.battery,
                if self.audio_supported { "supported" } else { "not supported" }
            );
        }

        self.session = Some(session);
        Ok(self.session.as_ref().expect("session just stored"))
    }

    /// Override the encryption handle (cameras with fixed handles) and
    /// re-derive the stream key. Call after [`login`](Self::login).
    pub fn set_handle(&mut self, handle: u32) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ClientError::Login("handle override requires a session".into()))?;
        session.handle = handle;
        session.aes_key = crypto::derive_key(handle);
        tracing::info!("handle override: {}", handle);
        tracing::debug!("stream key: {}", hex(&session.aes_key));
        Ok(())
    }

    /// Open and authenticate the relay stream for the current session.
    pub async fn open_stream(&self) -> Result<RelayStream> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ClientError::Login("not logged in".into()))?;
        RelayStream::open(
            &self.endpoints.server,
            self.endpoints.stream_port,
            self.device_id,
            &self.domain(),
            session.handle,
            session.session,
        )
        .await
    }

    async fn send_rpc<T: serde::de::DeserializeOwned>(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("control channel not connected".into()))?;

        let packet = rpc::frame_request(method, params)?;
        control.write_all(&packet).await?;

        let mut buf = vec![0u8; RESPONSE_BUF];
        let n = control.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::Protocol(
                "API server closed the connection".into(),
            ));
        }

        let json = rpc::extract_json(&buf[..n])
            .ok_or_else(|| ClientError::Protocol("no JSON object in response".into()))?;
        tracing::debug!("rpc response: {json}");
        serde_json::from_str(json)
            .map_err(|e| ClientError::Protocol(format!("malformed {method} response: {e}")))
    }
}

/// NUL-pad a domain name into the 48-byte wire field.
pub(crate) fn pack_domain(domain: &str) -> [u8; 48] {
    let mut field = [0u8; 48];
    let bytes = domain.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_domain_pads_and_truncates() {
        let packed = pack_domain("12345678.nvdvr.net");
        assert_eq!(&packed[..18], b"12345678.nvdvr.net");
        assert!(packed[18..].iter().all(|&b| b == 0));

        let long = "x".repeat(60);
        assert_eq!(pack_domain(&long), [b'x'; 48]);
    }

    #[test]
    fn test_domain_format() {
        let client = CloudClient::new(
            12345678,
            "pw".into(),
            crate::config::Config::default().endpoints(None),
        );
        assert_eq!(client.domain(), "12345678.nvdvr.net");
    }

    fn local_endpoints(api_port: u16) -> Endpoints {
        Endpoints {
            server: "127.0.0.1".into(),
            api_port,
            register_port: 1,
            stream_port: 8800,
        }
    }

    #[test]
    fn test_login_against_fake_server() {
        tokio_test::block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            let server = tokio::spawn(async move {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let n = sock.read(&mut buf).await.unwrap();

                // Framed request: magic, length, two zero bytes, JSON body.
                assert_eq!(&buf[0..4], &[0x00, 0x03, 0x00, 0xFE]);
                let len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
                assert_eq!(n, 8 + len);
                let body: serde_json::Value = serde_json::from_slice(&buf[8..n]).unwrap();
                assert_eq!(body["method"], "login");
                assert_eq!(body["params"]["deviceId"], 12345678);
                assert_eq!(body["params"]["domain"], "12345678.nvdvr.net");
                assert_eq!(
                    body["params"]["randomKey"].as_str().unwrap().len(),
                    16
                );

                // Reply with framing junk ahead of the JSON, like the cloud does.
                let mut reply = vec![0x00, 0x03, 0x00, 0xFE, 0x40, 0x00, 0x00, 0x00];
                reply.extend_from_slice(
                    br#"{"v380":{"session":111,"handle":222,"pri":{"battery":75,"audio":1}}}"#,
                );
                sock.write_all(&reply).await.unwrap();
            });

            let mut client = CloudClient::new(12345678, "secret".into(), local_endpoints(port));
            client.connect().await.unwrap();
            let session = client.login().await.unwrap().clone();

            assert_eq!(session.session, 111);
            assert_eq!(session.handle, 222);
            assert_eq!(session.aes_key, crypto::derive_key(222));
            assert_eq!(client.battery(), Some(75));
            assert!(client.audio_supported());
            server.await.unwrap();
        });
    }

    #[test]
    fn test_login_server_error_code() {
        tokio_test::block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            tokio::spawn(async move {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                sock.read(&mut buf).await.unwrap();
                sock.write_all(br#"{"result":{"code":-13}}"#).await.unwrap();
            });

            let mut client = CloudClient::new(12345678, "wrong".into(), local_endpoints(port));
            client.connect().await.unwrap();
            let err = client.login().await.unwrap_err();
            assert!(matches!(err, ClientError::Login(_)));
            assert!(client.session().is_none());
        });
    }

    #[test]
    fn test_set_handle_rederives_key() {
        let mut client = CloudClient::new(1, "pw".into(), local_endpoints(1));
        assert!(client.set_handle(7).is_err());

        client.session = Some(Session {
            session: 10,
            handle: 20,
            aes_key: crypto::derive_key(20),
        });
        client.set_handle(7).unwrap();
        let session = client.session().unwrap();
        assert_eq!(session.handle, 7);
        assert_eq!(session.aes_key, crypto::derive_key(7));
    }
}
