//! Media pipeline shared types and the selective-decrypt policy.

pub mod demux;
pub mod recorder;

use crate::crypto;

/// Stream kind tags from the relay framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    IFrame,
    PFrame,
    Audio,
}

impl StreamKind {
    /// Map the wire tag byte (header offset 1) to a kind.
    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0x28 => Some(StreamKind::IFrame),
            0x29 => Some(StreamKind::PFrame),
            0x18 => Some(StreamKind::Audio),
            _ => None,
        }
    }

    pub fn is_video(self) -> bool {
        !matches!(self, StreamKind::Audio)
    }
}

/// One reassembled access unit (video) or standalone packet payload (audio),
/// still encrypted, with the per-frame metadata prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub kind: StreamKind,
    pub data: Vec<u8>,
}

/// Decrypt a frame in place per the camera's selective-encryption rules.
///
/// I-frames and any video payload of at least 64 bytes use the 64-on/16-off
/// pattern; shorter P-frame payloads are sent in the clear. Audio is
/// full-block ECB. Video comes out as an HEVC Annex-B byte stream.
pub fn decrypt_frame(key: &[u8; 16], frame: &mut MediaFrame) {
    match frame.kind {
        StreamKind::Audio => crypto::decrypt_audio(key, &mut frame.data),
        StreamKind::IFrame => crypto::decrypt_video_64_80(key, &mut frame.data),
        StreamKind::PFrame => {
            if frame.data.len() >= 64 {
                crypto::decrypt_video_64_80(key, &mut frame.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_wire() {
        assert_eq!(StreamKind::from_wire(0x28), Some(StreamKind::IFrame));
        assert_eq!(StreamKind::from_wire(0x29), Some(StreamKind::PFrame));
        assert_eq!(StreamKind::from_wire(0x18), Some(StreamKind::Audio));
        assert_eq!(StreamKind::from_wire(0x7F), None);
    }

    #[test]
    fn test_short_pframe_passes_through() {
        let key = crypto::derive_key(1);
        let mut frame = MediaFrame {
            kind: StreamKind::PFrame,
            data: vec![0xAB; 63],
        };
        let before = frame.data.clone();
        decrypt_frame(&key, &mut frame);
        assert_eq!(frame.data, before);
    }

    #[test]
    fn test_long_pframe_is_decrypted() {
        let key = crypto::derive_key(1);
        let mut frame = MediaFrame {
            kind: StreamKind::PFrame,
            data: vec![0xAB; 64],
        };
        let before = frame.data.clone();
        decrypt_frame(&key, &mut frame);
        assert_ne!(frame.data, before);
    }
}
