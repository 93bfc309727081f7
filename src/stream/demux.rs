//! Relay-stream demultiplexer and frame reassembler.
//!
//! Data packets share a 12-byte header, all fields little-endian:
//! ```text
//! off 0     u8  0x7F            data-packet tag
//! off 1     u8  kind            0x28 I-frame, 0x29 P-frame, 0x18 audio
//! off 2     u8  reserved
//! off 3-4   u16 total_fragments
//! off 5-6   u16 fragment_index  0-based
//! off 7-8   u16 payload_length
//! off 9-11      reserved
//! ```
//! A video frame is the concatenation of `total_fragments` payloads; the
//! camera numbers fragments independently of transport, so they may arrive
//! reordered even over TCP. Audio packets stand alone. The first fragment
//! of every frame carries a 16-byte metadata prefix that is stripped during
//! reassembly. Anything that does not parse as a packet is skipped one byte
//! at a time until the parser resynchronizes on the next header.

use super::{MediaFrame, StreamKind};

/// Fixed data-packet header length.
pub const HEADER_SIZE: usize = 12;

/// Per-frame metadata prefix length on the first fragment.
pub const METADATA_LEN: usize = 16;

const DATA_TAG: u8 = 0x7F;

// Audio headers beyond these bounds are spurious matches inside video
// payload bytes; the parser skips them byte-by-byte.
const AUDIO_MAX_PAYLOAD: usize = 1000;
const AUDIO_MAX_FRAGMENTS: u16 = 10;

/// A video frame mid-assembly.
struct PendingFrame {
    kind: StreamKind,
    total: u16,
    fragments: Vec<(u16, Vec<u8>)>,
}

impl PendingFrame {
    fn is_complete(&self) -> bool {
        self.fragments.len() >= self.total as usize
    }

    /// Order fragments by index and concatenate, stripping the metadata
    /// prefix from fragment 0.
    fn into_frame(mut self) -> MediaFrame {
        self.fragments.sort_by_key(|&(index, _)| index);
        let mut data = Vec::new();
        for (index, payload) in self.fragments {
            if index == 0 {
                data.extend_from_slice(&payload[payload.len().min(METADATA_LEN)..]);
            } else {
                data.extend_from_slice(&payload);
            }
        }
        MediaFrame {
            kind: self.kind,
            data,
        }
    }
}

/// Incremental parser over the raw relay byte stream.
///
/// Feed bytes with [`extend`](Self::extend), then [`drain`](Self::drain)
/// every complete frame. Truncated packets stay buffered until the next
/// read completes them.
#[derive(Default)]
pub struct Demuxer {
    buf: Vec<u8>,
    current: Option<PendingFrame>,
    dropped: u64,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the relay socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Frames flushed incomplete because a new frame started over them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Parse every complete packet in the buffer, returning finished frames
    /// in camera order.
    pub fn drain(&mut self) -> Vec<MediaFrame> {
        let mut out = Vec::new();
        let mut pos = 0usize;

        while pos < self.buf.len() {
            if self.buf[pos] != DATA_TAG {
                pos += 1;
                continue;
            }
            if pos + 1 >= self.buf.len() {
                // Tag at the buffer edge; kind is unknown until more bytes arrive.
                break;
            }

            match StreamKind::from_wire(self.buf[pos + 1]) {
                Some(kind) if kind.is_video() => {
                    if pos + HEADER_SIZE > self.buf.len() {
                        break;
                    }
                    let (total, index, payload_len) = parse_header(&self.buf[pos..]);
                    let end = pos + HEADER_SIZE + payload_len;
                    if end > self.buf.len() {
                        break;
                    }
                    let payload = self.buf[pos + HEADER_SIZE..end].to_vec();
                    self.accept_video(kind, total, index, payload, &mut out);
                    pos = end;
                }
                Some(_) => {
                    if pos + HEADER_SIZE > self.buf.len() {
                        break;
                    }
                    let (total, index, payload_len) = parse_header(&self.buf[pos..]);
                    let end = pos + HEADER_SIZE + payload_len;
                    if payload_len > AUDIO_MAX_PAYLOAD
                        || total > AUDIO_MAX_FRAGMENTS
                        || end > self.buf.len()
                    {
                        pos += 1;
                        continue;
                    }
                    if let Some(frame) = audio_frame(index, &self.buf[pos + HEADER_SIZE..end]) {
                        out.push(frame);
                    }
                    pos = end;
                }
                None => pos += 1,
            }
        }

        self.buf.drain(..pos);
        out
    }

    /// Teardown flush: emit the open frame if it happens to be complete,
    /// drop it otherwise.
    pub fn finish(&mut self) -> Option<MediaFrame> {
        let pending = self.current.take()?;
        if pending.is_complete() {
            Some(pending.into_frame())
        } else {
            self.dropped += 1;
            tracing::debug!(
                "dropping incomplete frame at teardown ({}/{} fragments)",
                pending.fragments.len(),
                pending.total
            );
            None
        }
    }

    fn accept_video(
        &mut self,
        kind: StreamKind,
        total: u16,
        index: u16,
        payload: Vec<u8>,
        out: &mut Vec<MediaFrame>,
    ) {
        if index == 0 {
            // A new frame start flushes whatever was collecting. A complete
            // frame would already have been emitted, so this is a drop.
            if let Some(stale) = self.current.take() {
                self.dropped += 1;
                tracing::debug!(
                    "dropping incomplete frame ({}/{} fragments)",
                    stale.fragments.len(),
                    stale.total
                );
            }
            self.current = Some(PendingFrame {
                kind,
                total,
                fragments: vec![(0, payload)],
            });
        } else {
            match self.current.as_mut() {
                Some(pending) => pending.fragments.push((index, payload)),
                // No open frame to append to.
                None => return,
            }
        }

        if self.current.as_ref().is_some_and(|p| p.is_complete()) {
            let pending = self.current.take().expect("checked above");
            out.push(pending.into_frame());
        }
    }
}

fn parse_header(buf: &[u8]) -> (u16, u16, usize) {
    let total = u16::from_le_bytes([buf[3], buf[4]]);
    let index = u16::from_le_bytes([buf[5], buf[6]]);
    let payload_len = u16::from_le_bytes([buf[7], buf[8]]) as usize;
    (total, index, payload_len)
}

/// Audio packets are processed standalone. The metadata prefix is stripped
/// only from fragment 0 with a payload longer than the prefix; a payload of
/// exactly the prefix length carries no media and is dropped.
fn audio_frame(index: u16, payload: &[u8]) -> Option<MediaFrame> {
    let data = if index == 0 {
        match payload.len() {
            n if n > METADATA_LEN => payload[METADATA_LEN..].to_vec(),
            n if n == METADATA_LEN => return None,
            _ => payload.to_vec(),
        }
    } else {
        payload.to_vec()
    };
    Some(MediaFrame {
        kind: StreamKind::Audio,
        data,
    })
}
