// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! H.264 RTP depacketizer (RFC 6184).
//!
//! Reassembles single-NAL, STAP-A and FU-A payloads into access units of
//! 4-byte big-endian length-prefixed NAL units. SPS/PPS are cached as they
//! fly past and prepended to every keyframe, so a decoder can always
//! initialize from a keyframe alone. Malformed input is dropped at debug
//! level; the stream is never aborted.

use byteorder::{BigEndian, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;
use webrtc::rtp;

use super::AccessUnit;

pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_STAP_A: u8 = 24;
pub const NALU_TYPE_FU_A: u8 = 28;

const NALU_TYPE_MASK: u8 = 0x1F;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

struct Fragment {
    /// Reconstituted NAL header: (indicator & 0xE0) | (fu header & 0x1F).
    header: u8,
    data: BytesMut,
}

#[derive(Default)]
pub struct H264Depacketizer {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    /// Completed NALUs of the in-progress access unit, awaiting the marker.
    pending: Vec<Bytes>,
    pending_timestamp: u32,
    fragment: Option<Fragment>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP packet; returns a complete access unit when the packet
    /// ends one.
    pub fn push(&mut self, packet: &rtp::packet::Packet) -> Option<AccessUnit> {
        let payload = &packet.payload;
        if payload.is_empty() {
            debug!("Dropping empty H.264 payload");
            return None;
        }
        let timestamp = packet.header.timestamp;

        // A timestamp change with NALUs still pending means the marker of
        // the previous unit was lost; discard rather than merge frames.
        if !self.pending.is_empty() && timestamp != self.pending_timestamp {
            debug!(
                pending = self.pending.len(),
                "Discarding incomplete access unit after timestamp jump"
            );
            self.pending.clear();
            self.fragment = None;
        }

        let nalu_type = payload[0] & NALU_TYPE_MASK;
        let mut emit_now = false;
        match nalu_type {
            1..=23 => {
                self.accept_nalu(payload.clone(), timestamp);
            }
            NALU_TYPE_STAP_A => {
                self.push_stap_a(payload, timestamp);
                // Aggregation packets are self-contained; emit immediately.
                emit_now = !self.pending.is_empty();
            }
            NALU_TYPE_FU_A => {
                self.push_fu_a(payload, timestamp);
            }
            other => {
                debug!(nalu_type = other, "Dropping unhandled NALU type");
            }
        }

        if (packet.header.marker || emit_now) && !self.pending.is_empty() {
            return self.assemble(timestamp);
        }
        None
    }

    fn accept_nalu(&mut self, nalu: Bytes, timestamp: u32) {
        match nalu[0] & NALU_TYPE_MASK {
            NALU_TYPE_SPS => self.sps = Some(nalu),
            NALU_TYPE_PPS => self.pps = Some(nalu),
            _ => {
                if self.pending.is_empty() {
                    self.pending_timestamp = timestamp;
                }
                self.pending.push(nalu);
            }
        }
    }

    fn push_stap_a(&mut self, payload: &Bytes, timestamp: u32) {
        let mut offset = 1usize;
        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                debug!(size, remaining = payload.len() - offset, "Malformed STAP-A entry");
                return;
            }
            self.accept_nalu(payload.slice(offset..offset + size), timestamp);
            offset += size;
        }
    }

    fn push_fu_a(&mut self, payload: &Bytes, timestamp: u32) {
        if payload.len() < 2 {
            debug!("FU-A payload shorter than its header");
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & FU_START != 0;
        let end = fu_header & FU_END != 0;

        if start {
            if self.fragment.is_some() {
                debug!("FU-A restart with fragment in progress, dropping old fragment");
            }
            let mut data = BytesMut::with_capacity(payload.len() - 2);
            data.put_slice(&payload[2..]);
            self.fragment = Some(Fragment {
                header: (indicator & 0xE0) | (fu_header & NALU_TYPE_MASK),
                data,
            });
        } else {
            match self.fragment.as_mut() {
                Some(fragment) => fragment.data.put_slice(&payload[2..]),
                None => {
                    debug!("FU-A continuation without start, dropping");
                    return;
                }
            }
        }

        if end {
            if let Some(fragment) = self.fragment.take() {
                let mut nalu = BytesMut::with_capacity(1 + fragment.data.len());
                nalu.put_u8(fragment.header);
                nalu.put_slice(&fragment.data);
                self.accept_nalu(nalu.freeze(), timestamp);
            }
        }
    }

    fn assemble(&mut self, timestamp: u32) -> Option<AccessUnit> {
        let is_keyframe = self
            .pending
            .iter()
            .any(|n| n[0] & NALU_TYPE_MASK == NALU_TYPE_IDR);

        let mut out = Vec::with_capacity(
            self.pending.iter().map(|n| n.len() + 4).sum::<usize>()
                + self.sps.as_ref().map_or(0, |s| s.len() + 4)
                + self.pps.as_ref().map_or(0, |p| p.len() + 4),
        );
        let mut parameter_sets_written = false;
        for nalu in self.pending.drain(..) {
            if !parameter_sets_written && nalu[0] & NALU_TYPE_MASK == NALU_TYPE_IDR {
                if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                    write_prefixed(&mut out, sps);
                    write_prefixed(&mut out, pps);
                }
                parameter_sets_written = true;
            }
            write_prefixed(&mut out, &nalu);
        }

        Some(AccessUnit {
            data: Bytes::from(out),
            rtp_timestamp: timestamp,
            is_keyframe,
        })
    }
}

fn write_prefixed(out: &mut Vec<u8>, nalu: &Bytes) {
    // 4-byte big-endian length prefix, AVCC style.
    let _ = out.write_u32::<BigEndian>(nalu.len() as u32);
    out.extend_from_slice(nalu);
}
