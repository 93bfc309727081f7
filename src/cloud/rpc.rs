//! JSON-RPC wire framing for the V380 API channel.
//!
//! Requests are length-framed:
//! ```text
//! 00 03 00 FE | u16 LE json_len | 00 00 | json body (no whitespace)
//! ```
//! Responses may repeat the framing or carry stray prefix bytes, so the
//! parser scans to the first `{` and matches braces to delimit the outermost
//! JSON object.

use serde::Deserialize;

use crate::error::{ClientError, Result};

/// Request frame magic.
const FRAME_MAGIC: [u8; 4] = [0x00, 0x03, 0x00, 0xFE];

/// Pick a request id: random, below 10^8 like the vendor client.
pub fn request_id() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
    u32::from_le_bytes(buf) % 100_000_000
}

/// Build a framed JSON-RPC request packet.
pub fn frame_request(method: &str, params: serde_json::Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&serde_json::json!({
        "id": request_id(),
        "method": method,
        "params": params,
    }))
    .map_err(|e| ClientError::Protocol(format!("request serialization: {e}")))?;

    let len = u16::try_from(body.len())
        .map_err(|_| ClientError::Protocol(format!("request body too large: {} bytes", body.len())))?;

    let mut packet = Vec::with_capacity(8 + body.len());
    packet.extend_from_slice(&FRAME_MAGIC);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Locate the outermost JSON object in a raw response.
///
/// Scans to the first `{` and counts brace depth. Brace bytes never occur in
/// UTF-8 continuation bytes, so a byte-level scan is safe.
pub fn extract_json(response: &[u8]) -> Option<&str> {
    let start = response.iter().position(|&b| b == b'{')?;
    let mut depth = 0usize;
    for (i, &b) in response[start..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return std::str::from_utf8(&response[start..start + i + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Server reply to a `login` request.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginReply {
    pub v380: Option<SessionGrant>,
    pub result: Option<RpcResult>,
}

/// The session/handle pair granted on a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionGrant {
    pub session: u32,
    pub handle: u32,
    pub pri: Option<DeviceCaps>,
}

/// Camera capability block nested in the login reply.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCaps {
    pub battery: Option<i64>,
    pub audio: Option<i64>,
}

/// Generic server-level result; a non-zero code is an error.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResult {
    pub code: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let packet = frame_request("login", serde_json::json!({"deviceId": 1})).unwrap();
        assert_eq!(&packet[0..4], &[0x00, 0x03, 0x00, 0xFE]);
        let len = u16::from_le_bytes([packet[4], packet[5]]) as usize;
        assert_eq!(&packet[6..8], &[0x00, 0x00]);
        assert_eq!(packet.len(), 8 + len);

        let body: serde_json::Value = serde_json::from_slice(&packet[8..]).unwrap();
        assert_eq!(body["method"], "login");
        assert_eq!(body["params"]["deviceId"], 1);
        assert!(body["id"].as_u64().unwrap() < 100_000_000);
    }

    #[test]
    fn test_extract_json_with_prefix_bytes() {
        let mut raw = vec![0x00, 0x03, 0x00, 0xFE, 0x10, 0x00, 0x00, 0x00];
        raw.extend_from_slice(br#"{"a":{"b":1},"c":2}trailing"#);
        assert_eq!(extract_json(&raw), Some(r#"{"a":{"b":1},"c":2}"#));
    }

    #[test]
    fn test_extract_json_incomplete() {
        assert_eq!(extract_json(br#"xx{"a":{"b":1}"#), None);
        assert_eq!(extract_json(b"no object here"), None);
    }

    #[test]
    fn test_login_reply_shapes() {
        let ok: LoginReply = serde_json::from_str(
            r#"{"v380":{"session":111,"handle":222,"pri":{"battery":80,"audio":1}}}"#,
        )
        .unwrap();
        let grant = ok.v380.unwrap();
        assert_eq!(grant.session, 111);
        assert_eq!(grant.handle, 222);
        assert_eq!(grant.pri.as_ref().unwrap().battery, Some(80));
        assert_eq!(grant.pri.unwrap().audio, Some(1));

        let err: LoginReply =
            serde_json::from_str(r#"{"result":{"code":-13,"msg":"bad password"}}"#).unwrap();
        assert!(err.v380.is_none());
        assert_eq!(err.result.unwrap().code, Some(-13));
    }
}
