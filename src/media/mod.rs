//! Depacketization and pacing for the per-camera media path.

pub mod aac;
pub mod h264;
pub mod pacer;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::error::{RelayError, Result};

/// One decodable unit: a video access unit as 4-byte big-endian
/// length-prefixed NAL units, or one raw audio frame.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    /// Upstream RTP timestamp of the final packet of the unit.
    pub rtp_timestamp: u32,
    pub is_keyframe: bool,
}

/// Split a length-prefixed video access unit back into raw NAL units.
pub fn split_nal_units(data: &Bytes) -> Result<Vec<Bytes>> {
    let mut units = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < 4 {
            return Err(RelayError::PacketMalformed(format!(
                "truncated NALU length prefix at offset {offset}"
            )));
        }
        let len = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        offset += 4;
        if data.len() - offset < len {
            return Err(RelayError::PacketMalformed(format!(
                "NALU length {len} exceeds remaining {} bytes",
                data.len() - offset
            )));
        }
        units.push(data.slice(offset..offset + len));
        offset += len;
    }
    Ok(units)
}
