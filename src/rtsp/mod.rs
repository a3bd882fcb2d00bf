// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! RTSP/1.0 TCP-interleaved ingestion client.
//!
//! One TLS (or plain TCP) connection carries the whole session: the
//! OPTIONS/DESCRIBE/SETUP/PLAY handshake, then two interleaved byte streams
//! (`$`-framed RTP/RTCP and in-band RTSP responses) demultiplexed by
//! [`RtspReader::next_event`]. Interleaved framing per RFC 2326 §10.12.

pub mod sdp;

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;
use webrtc::rtp;
use webrtc::util::Unmarshal;

use crate::error::{RelayError, Result};
use sdp::{MediaKind, Sdp};

pub const DEFAULT_RTSPS_PORT: u16 = 322;
pub const DEFAULT_RTSP_PORT: u16 = 554;

const USER_AGENT: &str = concat!("camrelay/", env!("CARGO_PKG_VERSION"));
const INTERLEAVED_MAGIC: u8 = 0x24; // '$'

/// One negotiated track on the interleaved connection. Set once from the
/// SDP during SETUP; read-only thereafter.
#[derive(Debug, Clone)]
pub struct RtspChannel {
    /// Even id carries RTP; id + 1 carries RTCP.
    pub interleaved_id: u8,
    pub kind: MediaKind,
    pub control: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Raw fmtp parameters for the track (AAC mode settings live here).
    pub fmtp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RtspConfig {
    /// Read deadline, re-armed on every read.
    pub read_timeout: Duration,
}

impl Default for RtspConfig {
    fn default() -> Self {
        RtspConfig { read_timeout: Duration::from_secs(10) }
    }
}

/// TCP with optional TLS. Both variants are `Unpin`, so the forwarding
/// impls are plain matches.
enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, data),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Parsed RTSP response (status line + headers + optional body).
#[derive(Debug)]
struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }
}

/// An established, playing RTSP session, ready to be split into a reader
/// and a control handle.
pub struct RtspClient {
    transport: Transport,
    buf: BytesMut,
    cseq: Arc<AtomicU32>,
    cfg: RtspConfig,
    request_uri: String,
    auth: Option<String>,
    session: String,
    session_timeout: Duration,
    channels: Vec<RtspChannel>,
    sdp: Sdp,
}

impl RtspClient {
    /// Dial, handshake, and start playback. On return the server is sending
    /// interleaved media.
    pub async fn connect(url_str: &str, cfg: RtspConfig) -> Result<RtspClient> {
        let url = Url::parse(url_str)
            .map_err(|e| RelayError::Rtsp(format!("bad RTSP URL: {e}")))?;
        let use_tls = match url.scheme() {
            "rtsps" => true,
            "rtsp" => false,
            other => {
                return Err(RelayError::Rtsp(format!("unsupported scheme '{other}'")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::Rtsp("URL missing host".into()))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if use_tls { DEFAULT_RTSPS_PORT } else { DEFAULT_RTSP_PORT });

        let auth = if url.username().is_empty() {
            None
        } else {
            let credentials =
                format!("{}:{}", url.username(), url.password().unwrap_or_default());
            Some(format!("Basic {}", BASE64.encode(credentials)))
        };
        let request_uri = strip_userinfo(&url);

        debug!(host, port, tls = use_tls, "Dialing RTSP server");
        let tcp = tokio::time::timeout(cfg.read_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| RelayError::Rtsp(format!("connect to {host}:{port} timed out")))??;
        tcp.set_nodelay(true)?;

        let transport = if use_tls {
            let connector = tls_connector();
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| RelayError::Rtsp(format!("bad TLS server name '{host}': {e}")))?;
            let stream = connector.connect(server_name, tcp).await?;
            Transport::Tls(Box::new(stream))
        } else {
            Transport::Plain(tcp)
        };

        let mut client = RtspClient {
            transport,
            buf: BytesMut::with_capacity(16 * 1024),
            cseq: Arc::new(AtomicU32::new(1)),
            cfg,
            request_uri,
            auth,
            session: String::new(),
            session_timeout: Duration::from_secs(60),
            channels: Vec::new(),
            sdp: Sdp::default(),
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        let uri = self.request_uri.clone();

        let resp = self.round_trip("OPTIONS", &uri, &[]).await?;
        expect_ok("OPTIONS", &resp)?;

        let resp = self
            .round_trip("DESCRIBE", &uri, &[("Accept", "application/sdp")])
            .await?;
        expect_ok("DESCRIBE", &resp)?;
        let body = String::from_utf8_lossy(&resp.body).into_owned();
        let sdp = Sdp::parse(&body)?;

        // Content-Base, when present, overrides the request URI as the
        // control base.
        let base = resp
            .header("content-base")
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.request_uri.trim_end_matches('/').to_string());

        for (index, section) in sdp.sections.iter().enumerate() {
            let rtp_id = (index * 2) as u8;
            let control_uri = resolve_control(&base, &section.control);
            let transport_value = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                rtp_id,
                rtp_id + 1
            );
            let resp = self
                .round_trip("SETUP", &control_uri, &[("Transport", &transport_value)])
                .await?;
            expect_ok("SETUP", &resp)?;
            if self.session.is_empty() {
                let raw = resp
                    .header("session")
                    .ok_or_else(|| RelayError::Rtsp("SETUP response missing Session".into()))?;
                let (id, timeout) = parse_session(raw);
                self.session = id;
                if let Some(timeout) = timeout {
                    self.session_timeout = timeout;
                }
            }
            self.channels.push(RtspChannel {
                interleaved_id: rtp_id,
                kind: section.kind,
                control: section.control.clone(),
                payload_type: section.payload_type,
                clock_rate: section.clock_rate,
                fmtp: section.fmtp.clone(),
            });
        }

        let resp = self
            .round_trip("PLAY", &uri, &[("Range", "npt=0.000-")])
            .await?;
        expect_ok("PLAY", &resp)?;

        info!(
            uri = self.request_uri,
            tracks = self.channels.len(),
            session_timeout_s = self.session_timeout.as_secs(),
            "RTSP playback started"
        );
        self.sdp = sdp;
        Ok(())
    }

    async fn round_trip(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> Result<Response> {
        let request = build_request(
            method,
            uri,
            self.cseq.fetch_add(1, Ordering::SeqCst),
            self.auth.as_deref(),
            if self.session.is_empty() { None } else { Some(&self.session) },
            headers,
        );
        self.transport.write_all(request.as_bytes()).await?;
        self.transport.flush().await?;
        read_response(&mut self.transport, &mut self.buf, self.cfg.read_timeout).await
    }

    pub fn channels(&self) -> &[RtspChannel] {
        &self.channels
    }

    pub fn sdp(&self) -> &Sdp {
        &self.sdp
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Split into the demuxing reader and the write-side control handle.
    pub fn into_parts(self) -> (RtspReader, RtspControl) {
        let (read, write) = tokio::io::split(self.transport);
        let reader = RtspReader {
            read,
            buf: self.buf,
            read_timeout: self.cfg.read_timeout,
            channels: self.channels.clone(),
        };
        let control = RtspControl {
            write: Arc::new(tokio::sync::Mutex::new(write)),
            cseq: self.cseq,
            request_uri: self.request_uri,
            auth: self.auth,
            session: self.session,
        };
        (reader, control)
    }
}

/// Demuxed traffic from the playing connection.
#[derive(Debug)]
pub enum RtspEvent {
    /// Parsed RTP on an even interleaved channel.
    Rtp { channel: u8, packet: rtp::packet::Packet },
    /// Raw RTCP on an odd interleaved channel.
    Rtcp { channel: u8, payload: Bytes },
    /// An in-band RTSP response (keep-alive replies and the like).
    Response { status: u16 },
}

/// Read half of the playing session. Owns the demux buffer.
pub struct RtspReader {
    read: ReadHalf<Transport>,
    buf: BytesMut,
    read_timeout: Duration,
    channels: Vec<RtspChannel>,
}

impl RtspReader {
    /// Next demuxed event. Malformed RTP is dropped (debug log) rather than
    /// surfaced; I/O errors and stalls terminate the stream.
    pub async fn next_event(&mut self) -> Result<RtspEvent> {
        loop {
            self.ensure(4).await?;
            if self.buf[0] == INTERLEAVED_MAGIC {
                let channel = self.buf[1];
                let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                // The four header bytes were only peeked so far; consume
                // them exactly once, then exactly `length` payload bytes.
                self.buf.advance(4);
                self.ensure(length).await?;
                let payload = self.buf.split_to(length).freeze();

                if channel % 2 == 0 {
                    let mut cursor = &payload[..];
                    match rtp::packet::Packet::unmarshal(&mut cursor) {
                        Ok(packet) => return Ok(RtspEvent::Rtp { channel, packet }),
                        Err(e) => {
                            debug!(channel, bytes = payload.len(), error = %e, "Dropping malformed RTP");
                            continue;
                        }
                    }
                }
                return Ok(RtspEvent::Rtcp { channel, payload });
            }

            // Not interleaved: an RTSP response arriving in-band.
            let resp = read_response(&mut self.read, &mut self.buf, self.read_timeout).await?;
            debug!(status = resp.status, "In-band RTSP response");
            return Ok(RtspEvent::Response { status: resp.status });
        }
    }

    pub fn channels(&self) -> &[RtspChannel] {
        &self.channels
    }

    async fn ensure(&mut self, len: usize) -> Result<()> {
        while self.buf.len() < len {
            fill(&mut self.read, &mut self.buf, self.read_timeout).await?;
        }
        Ok(())
    }
}

/// Write-side handle: keep-alives and teardown after the split. Responses
/// to these requests surface through the reader as [`RtspEvent::Response`].
#[derive(Clone)]
pub struct RtspControl {
    write: Arc<tokio::sync::Mutex<WriteHalf<Transport>>>,
    cseq: Arc<AtomicU32>,
    request_uri: String,
    auth: Option<String>,
    session: String,
}

impl RtspControl {
    /// Fire an OPTIONS keep-alive to hold the session open.
    pub async fn keepalive(&self) -> Result<()> {
        self.send("OPTIONS").await
    }

    /// Best-effort TEARDOWN; the connection is closed right after, so the
    /// response (if any) is never awaited.
    pub async fn teardown(&self) -> Result<()> {
        self.send("TEARDOWN").await
    }

    async fn send(&self, method: &str) -> Result<()> {
        let request = build_request(
            method,
            &self.request_uri,
            self.cseq.fetch_add(1, Ordering::SeqCst),
            self.auth.as_deref(),
            Some(&self.session),
            &[],
        );
        let mut write = self.write.lock().await;
        write.write_all(request.as_bytes()).await?;
        write.flush().await?;
        Ok(())
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn strip_userinfo(url: &Url) -> String {
    let mut clean = url.clone();
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.to_string()
}

fn build_request(
    method: &str,
    uri: &str,
    cseq: u32,
    auth: Option<&str>,
    session: Option<&str>,
    extra: &[(&str, &str)],
) -> String {
    let mut out = format!("{method} {uri} RTSP/1.0\r\nCSeq: {cseq}\r\nUser-Agent: {USER_AGENT}\r\n");
    if let Some(auth) = auth {
        out.push_str(&format!("Authorization: {auth}\r\n"));
    }
    if let Some(session) = session {
        out.push_str(&format!("Session: {session}\r\n"));
    }
    for (name, value) in extra {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out
}

fn expect_ok(method: &str, resp: &Response) -> Result<()> {
    match resp.status {
        200 => Ok(()),
        401 => Err(RelayError::Rtsp(format!("{method} rejected: authentication failed"))),
        status => Err(RelayError::Rtsp(format!("{method} failed with status {status}"))),
    }
}

/// `Session: <id>[;timeout=<secs>]`
fn parse_session(raw: &str) -> (String, Option<Duration>) {
    let mut parts = raw.split(';');
    let id = parts.next().unwrap_or_default().trim().to_string();
    let timeout = parts
        .filter_map(|p| p.trim().strip_prefix("timeout="))
        .filter_map(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .next();
    (id, timeout)
}

/// Resolve an SDP control attribute against the session base URI.
fn resolve_control(base: &str, control: &str) -> String {
    if control.is_empty() || control == "*" {
        base.to_string()
    } else if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
        control.to_string()
    } else {
        format!("{}/{}", base, control.trim_start_matches('/'))
    }
}

async fn fill<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<()> {
    let n = tokio::time::timeout(timeout, io.read_buf(buf))
        .await
        .map_err(|_| RelayError::UpstreamDisconnect("read deadline exceeded".into()))?
        .map_err(|e| RelayError::UpstreamDisconnect(format!("read failed: {e}")))?;
    if n == 0 {
        return Err(RelayError::UpstreamDisconnect("connection closed by server".into()));
    }
    Ok(())
}

/// Parse one RTSP response out of `buf`, reading more as needed. Consumes
/// exactly the response's bytes.
async fn read_response<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<Response> {
    let header_end = loop {
        if let Some(pos) = find_header_end(buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Err(RelayError::Rtsp("response headers exceed 64 KiB".into()));
        }
        fill(io, buf, timeout).await?;
    };

    let header_bytes = buf.split_to(header_end + 4);
    let header_text = String::from_utf8_lossy(&header_bytes);
    let mut lines = header_text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| RelayError::Rtsp("empty response".into()))?;
    let status = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < content_length {
        fill(io, buf, timeout).await?;
    }
    let body = buf.split_to(content_length).freeze();

    Ok(Response { status, headers, body })
}

fn find_header_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<u16> {
    // "RTSP/1.0 200 OK"
    let mut parts = line.split_whitespace();
    let proto = parts.next().unwrap_or_default();
    if !proto.starts_with("RTSP/") {
        return Err(RelayError::Rtsp(format!("unexpected status line '{line}'")));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| RelayError::Rtsp(format!("unexpected status line '{line}'")))
}
