//! Minimal SDP parser for the DESCRIBE response.
//!
//! Only the subset the relay consumes is modeled: per `m=`-line media kind,
//! payload type, `a=rtpmap:` encoding/clock, `a=control:` suffix, and the
//! `a=fmtp:` line (AAC mode parameters live there). The parsed form
//! reserializes to an equivalent document for that subset.

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `m=` section of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap`, e.g. `H264` or `MPEG4-GENERIC`.
    pub encoding: String,
    pub clock_rate: u32,
    /// Channel count for audio rtpmaps (`/2` suffix).
    pub channels: Option<u8>,
    /// `a=control:` value, relative or absolute.
    pub control: String,
    /// Raw `a=fmtp:` parameter string, if present.
    pub fmtp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sdp {
    pub sections: Vec<MediaSection>,
}

impl Sdp {
    /// Parse the subset of an SDP document the relay uses. Sections other
    /// than audio/video (e.g. `m=application`) are skipped; attribute lines
    /// before the first `m=` are ignored.
    pub fn parse(input: &str) -> Result<Sdp> {
        let mut sections: Vec<MediaSection> = Vec::new();
        // None until the first m=; Some(false) inside a skipped section.
        let mut in_section: Option<bool> = None;

        for raw in input.lines() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("m=") {
                let mut fields = rest.split_whitespace();
                let media = fields.next().unwrap_or_default();
                let _port = fields.next();
                let _proto = fields.next();
                let pt = fields.next().and_then(|p| p.parse::<u8>().ok());
                let kind = match media {
                    "video" => Some(MediaKind::Video),
                    "audio" => Some(MediaKind::Audio),
                    _ => None,
                };
                match (kind, pt) {
                    (Some(kind), Some(payload_type)) => {
                        sections.push(MediaSection {
                            kind,
                            payload_type,
                            encoding: String::new(),
                            clock_rate: 0,
                            channels: None,
                            control: String::new(),
                            fmtp: None,
                        });
                        in_section = Some(true);
                    }
                    _ => in_section = Some(false),
                }
                continue;
            }

            if in_section != Some(true) {
                continue;
            }
            let section = match sections.last_mut() {
                Some(s) => s,
                None => continue,
            };

            if let Some(value) = line.strip_prefix("a=control:") {
                section.control = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("a=rtpmap:") {
                parse_rtpmap(value, section)?;
            } else if let Some(value) = line.strip_prefix("a=fmtp:") {
                if let Some((pt, params)) = value.split_once(' ') {
                    if pt.trim().parse::<u8>().ok() == Some(section.payload_type) {
                        section.fmtp = Some(params.trim().to_string());
                    }
                }
            }
        }

        if sections.is_empty() {
            return Err(RelayError::Sdp("no audio/video media sections".into()));
        }
        Ok(Sdp { sections })
    }

    /// Serialize the consumed subset back out. `parse(serialize(x)) == x`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for s in &self.sections {
            out.push_str(&format!("m={} 0 RTP/AVP {}\r\n", s.kind, s.payload_type));
            if !s.encoding.is_empty() {
                match s.channels {
                    Some(ch) => out.push_str(&format!(
                        "a=rtpmap:{} {}/{}/{}\r\n",
                        s.payload_type, s.encoding, s.clock_rate, ch
                    )),
                    None => out.push_str(&format!(
                        "a=rtpmap:{} {}/{}\r\n",
                        s.payload_type, s.encoding, s.clock_rate
                    )),
                }
            }
            if let Some(fmtp) = &s.fmtp {
                out.push_str(&format!("a=fmtp:{} {}\r\n", s.payload_type, fmtp));
            }
            if !s.control.is_empty() {
                out.push_str(&format!("a=control:{}\r\n", s.control));
            }
        }
        out
    }
}

fn parse_rtpmap(value: &str, section: &mut MediaSection) -> Result<()> {
    // a=rtpmap:<pt> <encoding>/<clock>[/<channels>]
    let (pt, spec) = value
        .split_once(' ')
        .ok_or_else(|| RelayError::Sdp(format!("bad rtpmap '{value}'")))?;
    if pt.trim().parse::<u8>().ok() != Some(section.payload_type) {
        // rtpmap for a payload type we did not select; ignore.
        return Ok(());
    }
    let mut parts = spec.trim().split('/');
    let encoding = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::Sdp(format!("bad rtpmap '{value}'")))?;
    let clock = parts
        .next()
        .and_then(|c| c.parse::<u32>().ok())
        .ok_or_else(|| RelayError::Sdp(format!("bad rtpmap clock in '{value}'")))?;
    section.encoding = encoding.to_string();
    section.clock_rate = clock;
    section.channels = parts.next().and_then(|c| c.parse::<u8>().ok());
    Ok(())
}
