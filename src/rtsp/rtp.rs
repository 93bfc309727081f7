//! RTP packetization of HEVC NAL units (RFC 7798).
//!
//! NAL units at or under the MTU budget ride in a single RTP packet; larger
//! ones are split into type-49 fragmentation units:
//! ```text
//! +---------------+---------------+----------+--------------
//! | PayloadHdr (type = 49)        | FU header | FU payload
//! +---------------+---------------+----------+--------------
//! ```
//! The payload header copies the layer/TID bits of the original NAL header;
//! the FU header carries start/end flags and the original NAL type.

/// Dynamic payload type, matching our SDP rtpmap.
pub const PT_H265: u8 = 96;

/// Video clock rate (90 kHz per RTP spec).
pub const CLOCK_RATE: u32 = 90_000;

/// Timestamp ticks per frame at 25 fps (90000 / 25).
pub const FRAME_INTERVAL_TICKS: u32 = 3600;

/// Largest RTP payload before FU fragmentation kicks in.
pub const MAX_PAYLOAD: usize = 1400;

/// FU chunk budget: the MTU minus the 2-byte payload header and FU header.
const MAX_FU_CHUNK: usize = MAX_PAYLOAD - 3;

/// Fixed RTP header size (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// HEVC fragmentation-unit NAL type.
const NAL_TYPE_FU: u8 = 49;

const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;

/// NAL type from the first byte of an HEVC NAL header.
pub fn nal_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3F
}

pub(crate) fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
    u32::from_be_bytes(buf)
}

/// RTP sequence/timestamp state shared by every enrolled viewer.
pub struct Packetizer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl Packetizer {
    /// Seed SSRC, sequence, and timestamp from the OS CSPRNG.
    pub fn new() -> Self {
        Self {
            ssrc: random_u32(),
            sequence: random_u32() as u16,
            timestamp: random_u32(),
        }
    }

    /// Packetize one NAL unit into RTP packets.
    ///
    /// `last_in_frame` drives the marker bit on the final packet of the
    /// access unit.
    pub fn packetize_nal(&mut self, nal: &[u8], last_in_frame: bool) -> Vec<Vec<u8>> {
        if nal.len() <= MAX_PAYLOAD {
            return vec![self.encode_packet(nal, last_in_frame)];
        }

        let nal_type = nal_type(nal);
        // Payload header: forbidden/layer bits from the original, type 49.
        let payload_header = [(nal[0] & 0x81) | (NAL_TYPE_FU << 1), nal[1]];

        let mut packets = Vec::new();
        let mut offset = 2;
        let mut first = true;
        while offset < nal.len() {
            let chunk = (nal.len() - offset).min(MAX_FU_CHUNK);
            let last = offset + chunk >= nal.len();
            let fu_header = if first {
                FU_START_BIT | nal_type
            } else if last {
                FU_END_BIT | nal_type
            } else {
                nal_type
            };

            let mut payload = Vec::with_capacity(3 + chunk);
            payload.extend_from_slice(&payload_header);
            payload.push(fu_header);
            payload.extend_from_slice(&nal[offset..offset + chunk]);
            packets.push(self.encode_packet(&payload, last_in_frame && last));

            offset += chunk;
            first = false;
        }
        packets
    }

    /// Advance the 90 kHz timestamp after a full access unit has gone out.
    pub fn advance_timestamp(&mut self, ticks: u32) {
        self.timestamp = self.timestamp.wrapping_add(ticks);
    }

    fn encode_packet(&mut self, payload: &[u8], marker: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
        // Byte 0: V=2, P=0, X=0, CC=0
        buf.push(0x80);
        buf.push(if marker { 0x80 } else { 0x00 } | PT_H265);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        buf
    }
}

impl Default for Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Split an Annex-B byte stream into NAL unit payloads (start codes removed).
pub fn parse_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        let start = if data[i..].starts_with(&[0, 0, 0, 1]) {
            i + 4
        } else if data[i..].starts_with(&[0, 0, 1]) {
            i + 3
        } else {
            i += 1;
            continue;
        };

        let mut end = data.len();
        let mut j = start;
        while j + 3 <= data.len() {
            if data[j..].starts_with(&[0, 0, 0, 1]) || data[j..].starts_with(&[0, 0, 1]) {
                end = j;
                break;
            }
            j += 1;
        }

        if start < end {
            nals.push(&data[start..end]);
        }
        i = end;
    }
    nals
}
