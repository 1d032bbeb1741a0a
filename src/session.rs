/*
 * session.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an event-driven HTTP/1.1 and HTTP/2 engine.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! One established connection, framed (HTTP/2) or line-based (HTTP/1.1).
//!
//! The session owns its socket, optional TLS state, stream FIFO and staging
//! buffers. The context delivers readiness; the session moves bytes between
//! the transport and either the frame codec or the HTTP/1.1 parser, and
//! invokes the user handler as messages complete.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use mio::Interest;
use tracing::{debug, trace};

use crate::buffer::{is_transient, RecvBuf, WriteBuf, RECV_CHUNK};
use crate::codec::{CodecFactory, FrameCodec, Http2Settings};
use crate::error::{CloseReason, Error};
use crate::h1;
use crate::message::Message;
use crate::stream::Stream;
use crate::tls::{self, TlsState};

/// Connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Side::Client => "c",
            Side::Server => "s",
        }
    }
}

/// Protocol selection. `H2` is mandatory HTTP/2, `H2Try` prefers it but
/// falls back to HTTP/1.1, `H1` never negotiates h2. The cleartext
/// `Upgrade: h2c` handshake behind `H2Try` is reserved and currently runs
/// HTTP/1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    H1,
    H2,
    H2Try,
}

/// Result of a terminate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateStatus {
    Done,
    Already,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Server-side TLS handshake in progress; protocol not yet known.
    TlsHandshake,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shutdown {
    Open,
    /// Write side closed, draining outstanding responses.
    Draining,
    /// Terminating now; only residual flushes remain.
    Closing,
}

/// Per-session counters, also the aggregation unit for peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Requests submitted (client) or fully received (server).
    pub req_cnt: u64,
    /// Responses fully received (client) or fully sent (server).
    pub rsp_cnt: u64,
    /// Streams closed by reset.
    pub rsp_rst_cnt: u64,
    /// Streams retired.
    pub strm_close_cnt: u64,
}

impl SessionStats {
    pub(crate) fn absorb(&mut self, other: &SessionStats) {
        self.req_cnt += other.req_cnt;
        self.rsp_cnt += other.rsp_cnt;
        self.rsp_rst_cnt += other.rsp_rst_cnt;
        self.strm_close_cnt += other.strm_close_cnt;
    }
}

/// User callbacks for session events. All methods have no-op defaults; a
/// server implements `on_request`, a client `on_response`. An `Err` from any
/// receive-side callback fails the session.
pub trait SessionHandler {
    /// The session this handler serves was created. The id stays valid for
    /// context calls (e.g. `Context::submit_response`) until
    /// `on_session_close` fires.
    fn on_attach(&mut self, session: crate::context::SessionId) {
        let _ = session;
    }

    /// A request is complete. Return a response to answer immediately, or
    /// `None` to answer later via `Context::submit_response`.
    fn on_request(&mut self, stream: &mut Stream) -> Result<Option<Message>, Error> {
        let _ = stream;
        Ok(None)
    }

    /// A response is complete; read it from `stream.response()`.
    fn on_response(&mut self, stream: &mut Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    /// A server push was announced. Return true to accept the promised
    /// stream; declined pushes are ignored.
    fn on_push_promise(&mut self, parent: &mut Stream, request: &Message) -> Result<bool, Error> {
        let _ = (parent, request);
        Ok(false)
    }

    /// A pushed response is complete.
    fn on_push_response(&mut self, stream: &mut Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    /// The session is being freed.
    fn on_session_close(&mut self, stats: &SessionStats) {
        let _ = stats;
    }
}

/// Plaintext transport view over the socket and optional TLS state, used by
/// the write buffer for its one-attempt flushes.
pub(crate) struct SessionIo<'a> {
    pub sock: &'a mut mio::net::TcpStream,
    pub tls: Option<&'a mut TlsState>,
}

impl Write for SessionIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tls.as_deref_mut() {
            Some(t) => t.write_plain(self.sock, buf),
            None => self.sock.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct Session {
    pub(crate) side: Side,
    /// Requested preference; drives negotiation.
    pub(crate) pref: Proto,
    /// Effective protocol once the phase is `Ready`.
    pub(crate) proto: Proto,
    pub(crate) phase: Phase,
    pub(crate) sock: mio::net::TcpStream,
    pub(crate) tls: Option<TlsState>,
    pub(crate) authority: String,
    pub(crate) log_id: String,
    pub(crate) streams: VecDeque<Stream>,
    pub(crate) handler: Box<dyn SessionHandler>,
    pub(crate) codec: Option<Box<dyn FrameCodec>>,
    pub(crate) codec_factory: Option<Rc<CodecFactory>>,
    pub(crate) settings: Http2Settings,
    pub(crate) parser: h1::Parser,
    pub(crate) rbuf: RecvBuf,
    pub(crate) wbuf: WriteBuf,
    /// Writable interest requested; invariant-linked to staged send data.
    pub(crate) send_pending: bool,
    /// A server-side request is mid-parse (at most one at a time).
    pub(crate) recving: bool,
    /// Peer closed its write direction while answers are still pending;
    /// reading stops, flushing continues.
    pub(crate) peer_eof: bool,
    pub(crate) shutdown: Shutdown,
    pub(crate) close_reason: Option<CloseReason>,
    pub(crate) stats: SessionStats,
    pub(crate) started: Instant,
    /// Interest currently registered with the poller.
    pub(crate) registered: Option<Interest>,
    /// Weak back-link into the owning peer's slot table.
    pub(crate) peer_link: Option<(u64, usize)>,
    pub(crate) verbose: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        side: Side,
        sock: mio::net::TcpStream,
        tls: Option<TlsState>,
        authority: String,
        pref: Proto,
        settings: Http2Settings,
        handler: Box<dyn SessionHandler>,
        codec_factory: Option<Rc<CodecFactory>>,
        verbose: bool,
    ) -> Self {
        let log_id = format!("{}#{} {}", side.tag(), id, authority);
        let phase = match (&tls, side) {
            (Some(_), Side::Server) => Phase::TlsHandshake,
            _ => Phase::Ready,
        };
        Self {
            side,
            pref,
            proto: Proto::H1,
            phase,
            sock,
            tls,
            authority,
            log_id,
            streams: VecDeque::new(),
            handler,
            codec: None,
            codec_factory,
            settings,
            parser: h1::Parser::new(),
            rbuf: RecvBuf::new(),
            wbuf: WriteBuf::new(),
            send_pending: false,
            recving: false,
            peer_eof: false,
            shutdown: Shutdown::Open,
            close_reason: None,
            stats: SessionStats::default(),
            started: Instant::now(),
            registered: None,
            peer_link: None,
            verbose,
        }
    }

    pub(crate) fn secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Make the negotiated protocol effective. For HTTP/2 this instantiates
    /// the codec and submits the initial SETTINGS.
    pub(crate) fn activate(&mut self, proto: Proto) -> Result<(), Error> {
        self.proto = proto;
        self.phase = Phase::Ready;
        if proto == Proto::H2 {
            let factory = self.codec_factory.as_ref().ok_or(Error::NoCodec)?;
            let mut codec = factory(self.side);
            codec.submit_settings(&self.settings.entries()).map_err(|e| {
                self.close_reason = Some(CloseReason::CodecErr);
                e
            })?;
            self.codec = Some(codec);
            self.send_pending = true;
        }
        debug!("[{}] ready, proto {:?}", self.log_id, proto);
        Ok(())
    }

    /// Desired readiness interest, or None when the session has completed
    /// its business.
    pub(crate) fn interest(&self) -> Option<Interest> {
        let tls_write = self.tls.as_ref().is_some_and(|t| t.wants_write());
        let (read, write) = match self.phase {
            Phase::TlsHandshake => (true, tls_write),
            Phase::Ready => match self.proto {
                Proto::H2 => {
                    let codec = self.codec.as_ref();
                    (
                        !self.peer_eof && codec.is_some_and(|c| c.wants_read()),
                        self.send_pending || tls_write || codec.is_some_and(|c| c.wants_write()),
                    )
                }
                _ => (
                    self.shutdown != Shutdown::Closing && !self.peer_eof,
                    self.send_pending || tls_write,
                ),
            },
        };
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    // ----- receive path -----

    /// Drain the socket. Transient conditions return Ok; anything else tags
    /// a close reason and returns Err, which frees the session.
    pub(crate) fn receive(&mut self) -> Result<(), Error> {
        if self.phase == Phase::TlsHandshake {
            return self.drive_handshake();
        }
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            let n = match self.io_read(&mut chunk) {
                Ok(0) => {
                    self.tag(CloseReason::SockEof);
                    if self.side == Side::Server
                        && !(self.streams.is_empty() && self.wbuf.is_empty())
                    {
                        // half-closed peer with answers still owed: stop
                        // reading, keep flushing; the sweep closes us once
                        // the streams drain
                        self.peer_eof = true;
                        return Ok(());
                    }
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => n,
                Err(ref e) if is_transient(e) => return Ok(()),
                Err(e) => {
                    self.tag_io(&e);
                    return Err(e.into());
                }
            };
            if self.verbose {
                trace!("[{}] recv {} bytes", self.log_id, n);
            }
            match self.proto {
                Proto::H2 => self.h2_receive(&chunk[..n])?,
                _ => self.h1_receive(&chunk[..n])?,
            }
        }
    }

    fn io_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.tls.as_mut() {
            Some(t) => t.read_plain(&mut self.sock, buf),
            None => self.sock.read(buf),
        }
    }

    fn h1_receive(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.rbuf.append(chunk);
        while !self.rbuf.is_empty() && self.shutdown != Shutdown::Closing {
            let progress = match self.side {
                Side::Server => {
                    if !self.recving {
                        let id = self.stats.req_cnt as u32 * 2 + 1;
                        self.streams.push_back(Stream::new(id));
                        self.recving = true;
                    }
                    let secure = self.tls.is_some();
                    let stream = self.streams.back_mut().expect("receiving stream");
                    let msg = stream.request.get_or_insert_with(Message::new);
                    self.parser.receive(&mut self.rbuf, Side::Server, secure, msg)
                }
                Side::Client => {
                    let Some(stream) = self.streams.front_mut() else {
                        self.tag(CloseReason::HttpErr);
                        return Err(Error::Parse("response without an outstanding request"));
                    };
                    let secure = self.tls.is_some();
                    let msg = stream.response.get_or_insert_with(Message::new);
                    self.parser.receive(&mut self.rbuf, Side::Client, secure, msg)
                }
            };
            match progress {
                Ok(h1::Progress::Incomplete) => break,
                Ok(h1::Progress::Complete) => {
                    self.parser.reset();
                    match self.side {
                        Side::Server => self.finish_server_request()?,
                        Side::Client => self.finish_client_response()?,
                    }
                }
                Err(e) => {
                    self.tag(CloseReason::HttpErr);
                    return Err(e);
                }
            }
        }
        self.rbuf.reclaim();
        if self.verbose {
            trace!(
                "[{}] h1 parse: {} buffered, {} consumed",
                self.log_id,
                self.rbuf.len(),
                self.rbuf.offset()
            );
        }
        Ok(())
    }

    /// A request is complete on a server session: count it and hand it to
    /// the handler. The stream stays attached pending its response.
    fn finish_server_request(&mut self) -> Result<(), Error> {
        self.stats.req_cnt += 1;
        self.recving = false;
        let stream = self.streams.back_mut().expect("completed stream");
        match self.handler.on_request(stream) {
            Ok(Some(response)) => stream.set_response(response),
            Ok(None) => {}
            Err(e) => {
                self.tag(CloseReason::HttpErr);
                return Err(e);
            }
        }
        if stream.response.is_some() {
            self.send_pending = true;
        }
        Ok(())
    }

    /// A response is complete on a client session: deliver and retire the
    /// head stream.
    fn finish_client_response(&mut self) -> Result<(), Error> {
        let mut stream = self.streams.pop_front().expect("head stream");
        self.stats.rsp_cnt += 1;
        if let Err(e) = self.handler.on_response(&mut stream) {
            self.tag(CloseReason::HttpErr);
            return Err(e);
        }
        self.stats.strm_close_cnt += 1;
        Ok(())
    }

    // ----- send path -----

    /// Flush staged and stageable bytes until drained or blocked.
    pub(crate) fn send(&mut self) -> Result<(), Error> {
        if self.phase == Phase::TlsHandshake {
            return self.drive_handshake();
        }
        if let Some(t) = self.tls.as_mut() {
            if let Err(e) = t.flush_records(&mut self.sock) {
                self.tag_io(&e);
                return Err(e.into());
            }
        }
        loop {
            let sent = self.send_once()?;
            if sent == 0 {
                break;
            }
        }
        if self.proto == Proto::H2 && self.wbuf.is_empty() {
            if let Some(codec) = self.codec.as_ref() {
                if !codec.wants_read() && !codec.wants_write() {
                    // nothing left in either direction; sweep closes us
                    self.tag(CloseReason::CodecEnd);
                }
            }
        }
        Ok(())
    }

    /// One staging pass plus one write attempt per buffer region.
    fn send_once(&mut self) -> Result<usize, Error> {
        match self.proto {
            Proto::H2 => self.h2_stage()?,
            _ => self.h1_stage(),
        }
        if self.wbuf.is_empty() {
            self.send_pending = false;
            return Ok(0);
        }
        let step = {
            let mut io = SessionIo {
                sock: &mut self.sock,
                tls: self.tls.as_mut(),
            };
            self.wbuf.flush_once(&mut io)
        };
        match step {
            Ok(step) => {
                self.send_pending = step.pending;
                if self.verbose && step.sent > 0 {
                    trace!("[{}] sent {} bytes", self.log_id, step.sent);
                }
                Ok(step.sent)
            }
            Err(e) => {
                self.tag_io(&e);
                Err(e.into())
            }
        }
    }

    fn h1_stage(&mut self) {
        while !self.wbuf.has_tail() {
            match self.h1_next_span() {
                Some(span) => {
                    self.wbuf.stage(span);
                }
                None => break,
            }
        }
    }

    /// Next unsent span from the stream FIFO. Server responses go out in
    /// request order; fully sent server streams are retired here.
    fn h1_next_span(&mut self) -> Option<Bytes> {
        match self.side {
            Side::Server => loop {
                let stream = self.streams.front_mut()?;
                let response = stream.response.as_ref()?;
                if !stream.serialized {
                    stream.send_data = h1::encode_response(response);
                    stream.serialized = true;
                }
                if stream.has_unsent() {
                    let span = stream.send_data.slice(stream.send_off..);
                    stream.send_off = stream.send_data.len();
                    return Some(span);
                }
                self.streams.pop_front();
                self.stats.rsp_cnt += 1;
                self.stats.strm_close_cnt += 1;
            },
            Side::Client => {
                for stream in self.streams.iter_mut() {
                    if stream.has_unsent() {
                        let span = stream.send_data.slice(stream.send_off..);
                        stream.send_off = stream.send_data.len();
                        return Some(span);
                    }
                }
                None
            }
        }
    }

    // ----- submit -----

    /// Enqueue an outbound request (client sessions).
    pub(crate) fn submit_request(&mut self, mut request: Message) -> Result<u32, Error> {
        if self.shutdown != Shutdown::Open {
            return Err(Error::Terminating);
        }
        match self.proto {
            Proto::H2 => {
                if request.scheme().is_none() {
                    request.set_scheme(if self.secure() { "https" } else { "http" });
                }
                if request.authority().is_none() {
                    request.set_authority(self.authority.clone());
                }
                let codec = self.codec.as_mut().ok_or(Error::NoCodec)?;
                let id = codec.submit_request(&request)?;
                let mut stream = Stream::new(id);
                stream.request = Some(request);
                self.streams.push_back(stream);
                self.stats.req_cnt += 1;
                self.send_pending = true;
                Ok(id)
            }
            _ => {
                if request.authority().is_none() {
                    request.set_authority(self.authority.clone());
                }
                let id = self.stats.req_cnt as u32 * 2 + 1;
                let mut stream = Stream::new(id);
                stream.send_data = h1::encode_request(&request);
                stream.serialized = true;
                stream.request = Some(request);
                self.streams.push_back(stream);
                self.stats.req_cnt += 1;
                self.send_pending = true;
                Ok(id)
            }
        }
    }

    /// Enqueue a deferred response (server sessions).
    pub(crate) fn submit_response(&mut self, stream_id: u32, response: Message) -> Result<(), Error> {
        let idx = self
            .streams
            .iter()
            .position(|s| s.id() == stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        if self.proto == Proto::H2 {
            let codec = self.codec.as_mut().ok_or(Error::NoCodec)?;
            codec.submit_response(stream_id, &response)?;
        }
        self.streams[idx].set_response(response);
        self.send_pending = true;
        Ok(())
    }

    // ----- lifecycle -----

    /// Graceful or immediate termination, idempotent once closing.
    pub(crate) fn terminate(&mut self, wait_rsp: bool) -> TerminateStatus {
        if self.shutdown == Shutdown::Closing {
            return TerminateStatus::Already;
        }
        if wait_rsp && self.side == Side::Client && self.stats.req_cnt > self.stats.rsp_cnt {
            debug!(
                "[{}] draining, {} responses outstanding",
                self.log_id,
                self.stats.req_cnt - self.stats.rsp_cnt
            );
            self.shutdown = Shutdown::Draining;
            if self.proto != Proto::H2 {
                // half-close the write direction; the peer sees EOF after
                // our requests and answers before closing
                if let Some(t) = self.tls.as_mut() {
                    t.half_close();
                    let _ = t.flush_records(&mut self.sock);
                }
                let _ = self.sock.shutdown(std::net::Shutdown::Write);
            }
            // HTTP/2 relies on stream-level end-of-stream, no GOAWAY here
        } else {
            debug!("[{}] terminating", self.log_id);
            self.shutdown = Shutdown::Closing;
            match self.proto {
                Proto::H2 => {
                    if let Some(codec) = self.codec.as_mut() {
                        let _ = codec.terminate(0);
                    }
                }
                _ => {
                    if let Some(t) = self.tls.as_mut() {
                        t.half_close();
                        let _ = t.flush_records(&mut self.sock);
                    }
                    let _ = self.sock.shutdown(std::net::Shutdown::Both);
                }
            }
            self.send_pending = true;
        }
        TerminateStatus::Done
    }

    // ----- TLS negotiation (server side) -----

    fn drive_handshake(&mut self) -> Result<(), Error> {
        let t = self.tls.as_mut().expect("handshake without tls");
        match t.advance_handshake(&mut self.sock) {
            Ok(true) => {
                let alpn = t.alpn().map(|p| p.to_vec());
                let proto = match tls::negotiate_server(self.pref, alpn.as_deref()) {
                    Ok(p) => p,
                    Err(e) => {
                        self.tag(CloseReason::TlsErr);
                        return Err(e);
                    }
                };
                self.activate(proto)
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.tag_io(&e);
                Err(e.into())
            }
        }
    }

    // ----- diagnostics -----

    pub(crate) fn tag(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
    }

    fn tag_io(&mut self, e: &io::Error) {
        let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
            CloseReason::SockEof
        } else if self.tls.is_some() && e.kind() == io::ErrorKind::InvalidData {
            CloseReason::TlsErr
        } else {
            CloseReason::SockErr
        };
        self.tag(reason);
    }
}
