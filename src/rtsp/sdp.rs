//! SDP generation for the RTSP DESCRIBE response.

use base64::Engine;

use super::rtp;

/// HEVC parameter-set NAL types.
const NAL_TYPE_VPS: u8 = 32;
const NAL_TYPE_SPS: u8 = 33;
const NAL_TYPE_PPS: u8 = 34;

/// VPS/SPS/PPS captured from the live stream.
///
/// Players use the `sprop-*` attributes to initialize the decoder before the
/// first I-frame arrives; until all three sets have been seen the attributes
/// are simply omitted.
#[derive(Debug, Default, Clone)]
pub struct ParameterSets {
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Record a parameter-set NAL; every other type is ignored.
    pub fn observe(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        match rtp::nal_type(nal) {
            NAL_TYPE_VPS => self.vps = Some(nal.to_vec()),
            NAL_TYPE_SPS => self.sps = Some(nal.to_vec()),
            NAL_TYPE_PPS => self.pps = Some(nal.to_vec()),
            _ => {}
        }
    }

    pub fn complete(&self) -> bool {
        self.vps.is_some() && self.sps.is_some() && self.pps.is_some()
    }

    fn sprop(&self) -> String {
        match (&self.vps, &self.sps, &self.pps) {
            (Some(vps), Some(sps), Some(pps)) => {
                let engine = base64::engine::general_purpose::STANDARD;
                format!(
                    ";sprop-vps={};sprop-sps={};sprop-pps={}",
                    engine.encode(vps),
                    engine.encode(sps),
                    engine.encode(pps)
                )
            }
            _ => String::new(),
        }
    }
}

/// Build the DESCRIBE SDP body.
pub fn generate(params: &ParameterSets) -> String {
    format!(
        "v=0\r\n\
         o=- {origin} 1 IN IP4 127.0.0.1\r\n\
         s=V380 Camera Stream\r\n\
         t=0 0\r\n\
         m=video 0 RTP/AVP {pt}\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=rtpmap:{pt} H265/{clock}\r\n\
         a=fmtp:{pt} profile-id=1{sprop}\r\n\
         a=control:streamid=0\r\n",
        origin = chrono::Utc::now().timestamp(),
        pt = rtp::PT_H265,
        clock = rtp::CLOCK_RATE,
        sprop = params.sprop(),
    )
}
