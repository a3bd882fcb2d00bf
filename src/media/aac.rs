//! AAC RTP depacketizer (RFC 3640, AAC-hbr mode).
//!
//! AU headers are 16 bits each with sizelength=13 and indexlength=3; a
//! packet may carry several access units.

use tracing::debug;
use webrtc::rtp;

use super::AccessUnit;

#[derive(Default)]
pub struct AacDepacketizer;

impl AacDepacketizer {
    pub fn new() -> Self {
        Self
    }

    /// Extract the raw AAC access units from one RTP packet. Truncated
    /// headers or payloads end parsing cleanly with whatever was complete.
    pub fn push(&mut self, packet: &rtp::packet::Packet) -> Vec<AccessUnit> {
        let payload = &packet.payload;
        if payload.len() < 2 {
            debug!(bytes = payload.len(), "AAC payload too short for AU-headers-length");
            return Vec::new();
        }

        let headers_length_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let headers_length = headers_length_bits.div_ceil(8);
        if payload.len() < 2 + headers_length {
            debug!(
                headers_length,
                bytes = payload.len(),
                "AAC AU headers exceed payload"
            );
            return Vec::new();
        }

        let mut units = Vec::new();
        let mut header_offset = 2usize;
        let headers_end = 2 + headers_length;
        let mut data_offset = headers_end;

        while header_offset + 2 <= headers_end {
            let raw = u16::from_be_bytes([payload[header_offset], payload[header_offset + 1]]);
            header_offset += 2;
            // Top 13 bits are the AU size; low 3 bits the interleave index.
            let size = (raw >> 3) as usize;
            if size == 0 {
                continue;
            }
            if data_offset + size > payload.len() {
                debug!(size, remaining = payload.len() - data_offset, "Truncated AAC AU");
                break;
            }
            units.push(AccessUnit {
                data: payload.slice(data_offset..data_offset + size),
                rtp_timestamp: packet.header.timestamp,
                is_keyframe: false,
            });
            data_offset += size;
        }

        units
    }
}
