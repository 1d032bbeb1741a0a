/*
 * context.rs
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

//! The owning unit of the engine: sessions, listeners, peers and the
//! readiness loop that drives them.
//!
//! One cooperative thread per context. Each tick recomputes session
//! interest, waits up to 100 ms for readiness, and dispatches: accept on
//! listeners, receive then send on sessions. A failing step frees its
//! session; a session wanting neither direction is closed as finished.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::buffer::is_transient;
use crate::codec::{CodecFactory, FrameCodec, Http2Settings};
use crate::error::{CloseReason, Error};
use crate::listener::{Acceptor, Listener};
use crate::message::Message;
use crate::net;
use crate::peer::{Peer, PeerConfig};
use crate::session::{
    Phase, Proto, Session, SessionHandler, SessionStats, Side, TerminateStatus,
};
use crate::tls::{self, TlsState};

/// Readiness wait bound; keeps timed work (termination sweeps) moving even
/// on an idle connection set.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub(crate) u64);

/// Shared stop flag; lets callbacks and other threads end `run`.
#[derive(Clone)]
pub struct Stopper(Arc<AtomicBool>);

impl Stopper {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Configuration for an outbound session.
pub struct ConnectSetup {
    /// TLS client configuration; None connects in cleartext.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Protocol preference; None uses the context default.
    pub proto: Option<Proto>,
    pub settings: Http2Settings,
    pub handler: Box<dyn SessionHandler>,
}

pub struct Context {
    poll: Poll,
    sessions: HashMap<u64, Session>,
    listeners: HashMap<u64, Listener>,
    peers: HashMap<u64, Peer>,
    next_id: u64,
    running: Arc<AtomicBool>,
    pref: Proto,
    verbose: bool,
    codec_factory: Option<Rc<CodecFactory>>,
}

fn session_token(id: u64) -> Token {
    Token((id as usize) << 1)
}

fn listener_token(id: u64) -> Token {
    Token(((id as usize) << 1) | 1)
}

fn split_token(token: Token) -> (bool, u64) {
    (token.0 & 1 == 1, (token.0 >> 1) as u64)
}

impl Context {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            poll: Poll::new()?,
            sessions: HashMap::new(),
            listeners: HashMap::new(),
            peers: HashMap::new(),
            next_id: 1,
            running: Arc::new(AtomicBool::new(false)),
            pref: Proto::H1,
            verbose: false,
            codec_factory: None,
        })
    }

    /// Default protocol preference for sessions that do not set their own.
    pub fn set_preference(&mut self, proto: Proto) {
        self.pref = proto;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Install the factory that builds a frame codec for every session that
    /// negotiates HTTP/2. Without one, such sessions fail with `NoCodec`.
    pub fn set_codec_factory<F>(&mut self, factory: F)
    where
        F: Fn(Side) -> Box<dyn FrameCodec> + 'static,
    {
        self.codec_factory = Some(Rc::new(factory));
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(self.running.clone())
    }

    /// Clear the running flag; `run` exits after the current tick.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ----- listeners -----

    /// Bind `authority` and accept inbound sessions through `acceptor`.
    pub fn listen(
        &mut self,
        authority: &str,
        acceptor: impl Acceptor + 'static,
    ) -> Result<ListenerId, Error> {
        let mut listener = Listener::bind(authority, Box::new(acceptor))?;
        let id = self.alloc();
        self.poll
            .registry()
            .register(&mut listener.sock, listener_token(id), Interest::READABLE)?;
        info!("listening on {}", listener.authority);
        self.listeners.insert(id, listener);
        Ok(ListenerId(id))
    }

    /// Bound address of a listener; useful with a port-0 authority.
    pub fn listener_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        self.listeners.get(&id.0).and_then(|l| l.local_addr())
    }

    // ----- outbound sessions -----

    /// Connect to `authority`. Connection setup and any TLS handshake run
    /// blocking so failures (including ALPN mismatch under mandatory h2)
    /// surface here; the socket turns non-blocking afterwards.
    pub fn connect(&mut self, authority: &str, setup: ConnectSetup) -> Result<SessionId, Error> {
        let pref = setup.proto.unwrap_or(self.pref);
        let mut std_sock = net::connect_blocking(authority)?;
        let (tls_state, proto) = match setup.tls {
            Some(config) => {
                let (host, _) = net::split_authority(authority)?;
                let mut state = TlsState::client(config, host)?;
                state.handshake_blocking(&mut std_sock)?;
                let alpn = state.alpn().map(|p| p.to_vec());
                let proto = tls::negotiate_client(pref, alpn.as_deref())?;
                (Some(state), proto)
            }
            None => (None, tls::cleartext_proto(pref)),
        };
        std_sock.set_nonblocking(true)?;
        let sock = mio::net::TcpStream::from_std(std_sock);

        let id = self.alloc();
        let mut session = Session::new(
            id,
            Side::Client,
            sock,
            tls_state,
            authority.to_string(),
            pref,
            setup.settings,
            setup.handler,
            self.codec_factory.clone(),
            self.verbose,
        );
        session.activate(proto)?;
        self.register_session(id, &mut session)?;
        debug!("[{}] connected", session.log_id);
        session.handler.on_attach(SessionId(id));
        self.sessions.insert(id, session);
        Ok(SessionId(id))
    }

    /// Enqueue a request on a client session; returns the stream id.
    pub fn send_request(&mut self, id: SessionId, request: Message) -> Result<u32, Error> {
        self.sessions
            .get_mut(&id.0)
            .ok_or(Error::UnknownSession)?
            .submit_request(request)
    }

    /// Answer a request that the handler deferred.
    pub fn submit_response(
        &mut self,
        id: SessionId,
        stream_id: u32,
        response: Message,
    ) -> Result<(), Error> {
        self.sessions
            .get_mut(&id.0)
            .ok_or(Error::UnknownSession)?
            .submit_response(stream_id, response)
    }

    /// Terminate a session. With `wait_rsp` a client session with
    /// outstanding requests drains responses first; otherwise the session
    /// closes after flushing residual bytes.
    pub fn terminate_session(
        &mut self,
        id: SessionId,
        wait_rsp: bool,
    ) -> Result<TerminateStatus, Error> {
        Ok(self
            .sessions
            .get_mut(&id.0)
            .ok_or(Error::UnknownSession)?
            .terminate(wait_rsp))
    }

    pub fn session_stats(&self, id: SessionId) -> Option<SessionStats> {
        self.sessions.get(&id.0).map(|s| s.stats)
    }

    // ----- peers -----

    /// Build a pool of parallel sessions to one authority. Fails only when
    /// every slot fails to connect.
    pub fn peer_connect<F>(&mut self, config: PeerConfig, factory: F) -> Result<PeerId, Error>
    where
        F: FnMut() -> Box<dyn SessionHandler> + 'static,
    {
        let pid = self.alloc();
        let mut peer = Peer::new(config, Box::new(factory));
        let mut last_err = None;
        for slot in 0..peer.slots.len() {
            let handler = (peer.handler_factory)();
            let setup = ConnectSetup {
                tls: peer.tls.clone(),
                proto: Some(peer.proto),
                settings: peer.settings.clone(),
                handler,
            };
            match self.connect(&peer.authority, setup) {
                Ok(sid) => {
                    if let Some(session) = self.sessions.get_mut(&sid.0) {
                        session.peer_link = Some((pid, slot));
                    }
                    peer.attach(slot, sid.0);
                }
                Err(e) => {
                    warn!("peer {} slot {} connect failed: {}", peer.authority, slot, e);
                    last_err = Some(e);
                }
            }
        }
        if peer.active_cnt == 0 {
            return Err(last_err.unwrap_or(Error::NoActiveSession));
        }
        info!(
            "peer {} up with {}/{} sessions",
            peer.authority,
            peer.active_cnt,
            peer.slots.len()
        );
        self.peers.insert(pid, peer);
        Ok(PeerId(pid))
    }

    /// Route a request to the pool: round-robin over active slots, rotating
    /// out sessions that reached the request threshold.
    pub fn peer_send_request(&mut self, pid: PeerId, request: Message) -> Result<SessionId, Error> {
        let (chosen, rotate) = {
            let peer = self.peers.get_mut(&pid.0).ok_or(Error::UnknownPeer)?;
            if peer.terminating {
                return Err(Error::PeerTerminating);
            }
            let n = peer.slots.len();
            let start = peer.next_idx;
            peer.next_idx = (peer.next_idx + 1) % n;
            let mut chosen = None;
            let mut rotate = Vec::new();
            for probe in 0..n {
                let slot = (start + probe) % n;
                let entry = peer.slots[slot];
                if !entry.active {
                    continue;
                }
                let Some(sid) = entry.session else { continue };
                let req_cnt = self
                    .sessions
                    .get(&sid)
                    .map(|s| s.stats.req_cnt)
                    .unwrap_or(0);
                if peer.req_thr > 0 && req_cnt >= peer.req_thr && peer.active_cnt >= n {
                    // quota reached while the pool is full: rotate this
                    // session out and let its slot reconnect on free
                    peer.deactivate(slot);
                    rotate.push(sid);
                    continue;
                }
                chosen = Some(sid);
                break;
            }
            (chosen, rotate)
        };

        for sid in rotate {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.terminate(true);
            }
        }

        let sid = chosen.ok_or(Error::NoActiveSession)?;
        self.sessions
            .get_mut(&sid)
            .ok_or(Error::NoActiveSession)?
            .submit_request(request)?;
        Ok(SessionId(sid))
    }

    /// Terminate every pooled session and stop routing new requests.
    pub fn terminate_peer(&mut self, pid: PeerId, wait_rsp: bool) -> Result<(), Error> {
        let sids: Vec<u64> = {
            let peer = self.peers.get_mut(&pid.0).ok_or(Error::UnknownPeer)?;
            peer.terminating = true;
            peer.ended = Some(Instant::now());
            let sids = peer.slots.iter().filter_map(|s| s.session).collect();
            for slot in 0..peer.slots.len() {
                peer.deactivate(slot);
            }
            sids
        };
        for sid in sids {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.terminate(wait_rsp);
            }
        }
        Ok(())
    }

    /// Remove a peer, returning its aggregated counters (freed sessions plus
    /// the still-live ones). Live sessions are terminated immediately.
    pub fn free_peer(&mut self, pid: PeerId) -> Result<SessionStats, Error> {
        self.terminate_peer(pid, false)?;
        let peer = self.peers.remove(&pid.0).ok_or(Error::UnknownPeer)?;
        let mut agg = peer.agg;
        for slot in &peer.slots {
            if let Some(sid) = slot.session {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    agg.absorb(&session.stats);
                    session.peer_link = None;
                }
            }
        }
        let lifetime = peer
            .ended
            .unwrap_or_else(Instant::now)
            .duration_since(peer.started);
        info!(
            "peer {} freed after {:.3}s: {} requests, {} responses",
            peer.authority,
            lifetime.as_secs_f64(),
            agg.req_cnt,
            agg.rsp_cnt
        );
        Ok(agg)
    }

    /// Aggregated counters so far: freed sessions plus live ones.
    pub fn peer_stats(&self, pid: PeerId) -> Option<SessionStats> {
        let peer = self.peers.get(&pid.0)?;
        let mut agg = peer.agg;
        for slot in &peer.slots {
            if let Some(sid) = slot.session {
                if let Some(session) = self.sessions.get(&sid) {
                    agg.absorb(&session.stats);
                }
            }
        }
        Some(agg)
    }

    pub fn peer_active_count(&self, pid: PeerId) -> Option<usize> {
        self.peers.get(&pid.0).map(|p| p.active_cnt)
    }

    // ----- readiness loop -----

    /// Run until stopped. Each tick: recompute interest, wait up to the
    /// tick bound, dispatch ready listeners and sessions (receive before
    /// send), free whatever failed.
    pub fn run(&mut self) -> Result<(), Error> {
        self.run_while(|_| true)
    }

    /// Like `run`, but calls `keep_going` between ticks; returning false
    /// ends the loop. The hook is the place to originate follow-up requests
    /// or decide on termination, since handlers cannot borrow the context.
    pub fn run_while<F>(&mut self, mut keep_going: F) -> Result<(), Error>
    where
        F: FnMut(&mut Context) -> bool,
    {
        self.running.store(true, Ordering::Relaxed);
        let mut events = Events::with_capacity(1024);
        while self.running.load(Ordering::Relaxed) && keep_going(self) {
            if let Err(e) = self.tick(&mut events) {
                error!("readiness wait failed: {}", e);
                self.running.store(false, Ordering::Relaxed);
                return Err(e);
            }
        }
        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn tick(&mut self, events: &mut Events) -> Result<(), Error> {
        self.sweep();
        if let Err(e) = self.poll.poll(events, Some(TICK)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }
        for event in events.iter() {
            let (is_listener, id) = split_token(event.token());
            if is_listener {
                self.accept_ready(id);
            } else {
                self.session_ready(
                    id,
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                    event.is_read_closed() || event.is_write_closed(),
                );
            }
        }
        Ok(())
    }

    /// Recompute interest for every session; close the ones with nothing
    /// left to do, reregister the ones whose interest changed.
    fn sweep(&mut self) {
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            let mut finished = false;
            if let Some(session) = self.sessions.get_mut(&id) {
                match session.interest() {
                    Some(want) => {
                        if session.registered != Some(want) {
                            match self.poll.registry().reregister(
                                &mut session.sock,
                                session_token(id),
                                want,
                            ) {
                                Ok(()) => session.registered = Some(want),
                                Err(e) => {
                                    warn!("[{}] reregister failed: {}", session.log_id, e);
                                    session.tag(CloseReason::SockErr);
                                    finished = true;
                                }
                            }
                        }
                    }
                    None => {
                        session.tag(CloseReason::HttpEnd);
                        finished = true;
                    }
                }
            }
            if finished {
                self.free_session(id);
            }
        }
    }

    fn accept_ready(&mut self, id: u64) {
        loop {
            let accepted = match self.listeners.get_mut(&id) {
                Some(listener) => listener.sock.accept(),
                None => return,
            };
            match accepted {
                Ok((sock, addr)) => {
                    if let Err(e) = self.build_inbound(id, sock, addr) {
                        warn!("inbound session from {} rejected: {}", addr, e);
                    }
                }
                Err(ref e) if is_transient(e) => return,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn build_inbound(
        &mut self,
        listener_id: u64,
        sock: mio::net::TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        sock.set_nodelay(true)?;
        let setup = {
            let listener = self
                .listeners
                .get_mut(&listener_id)
                .ok_or(Error::UnknownListener)?;
            listener
                .acceptor
                .accept(&addr.ip().to_string(), addr.port())?
        };
        let tls_state = match setup.tls {
            Some(config) => Some(TlsState::server(config)?),
            None => None,
        };
        let id = self.alloc();
        let mut session = Session::new(
            id,
            Side::Server,
            sock,
            tls_state,
            addr.to_string(),
            setup.proto,
            setup.settings,
            setup.handler,
            self.codec_factory.clone(),
            self.verbose,
        );
        if session.phase == Phase::Ready {
            // cleartext; TLS sessions negotiate inside the loop instead
            let proto = tls::cleartext_proto(setup.proto);
            session.activate(proto)?;
        }
        self.register_session(id, &mut session)?;
        debug!("[{}] accepted", session.log_id);
        session.handler.on_attach(SessionId(id));
        self.sessions.insert(id, session);
        Ok(())
    }

    fn register_session(&mut self, id: u64, session: &mut Session) -> Result<(), Error> {
        let interest = session.interest().unwrap_or(Interest::READABLE);
        self.poll
            .registry()
            .register(&mut session.sock, session_token(id), interest)?;
        session.registered = Some(interest);
        Ok(())
    }

    /// Receive before send within the same tick, so codec state advances
    /// before producing output.
    fn session_ready(&mut self, id: u64, readable: bool, writable: bool, errored: bool, closed: bool) {
        if errored {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.tag(CloseReason::SockErr);
            }
            self.free_session(id);
            return;
        }
        if !readable && !writable {
            if closed {
                // hangup without any readiness bit: nothing to process
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.tag(CloseReason::SockEof);
                }
                self.free_session(id);
            }
            return;
        }
        if readable {
            let failed = match self.sessions.get_mut(&id) {
                Some(session) => match session.receive() {
                    Ok(()) => None,
                    Err(e) => Some((session.log_id.clone(), e)),
                },
                None => return,
            };
            if let Some((log_id, e)) = failed {
                debug!("[{}] receive ended: {}", log_id, e);
                self.free_session(id);
                return;
            }
        }
        if readable || writable {
            let failed = match self.sessions.get_mut(&id) {
                Some(session) => match session.send() {
                    Ok(()) => None,
                    Err(e) => Some((session.log_id.clone(), e)),
                },
                None => return,
            };
            if let Some((log_id, e)) = failed {
                debug!("[{}] send ended: {}", log_id, e);
                self.free_session(id);
            }
        }
    }

    fn free_session(&mut self, id: u64) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut session.sock);
        let reason = session.close_reason.unwrap_or(CloseReason::HttpEnd);
        if session.side == Side::Server && session.stats.req_cnt > 1 {
            info!(
                "[{}] closed ({}): {} reqs {} rsps {} rsts {} streams in {:.3}s",
                session.log_id,
                reason,
                session.stats.req_cnt,
                session.stats.rsp_cnt,
                session.stats.rsp_rst_cnt,
                session.stats.strm_close_cnt,
                session.started.elapsed().as_secs_f64()
            );
        } else {
            debug!("[{}] closed ({})", session.log_id, reason);
        }
        session.handler.on_session_close(&session.stats);
        if let Some((pid, slot)) = session.peer_link {
            self.peer_session_freed(pid, slot, &session.stats);
        }
        // streams and their user data drop with the session
    }

    /// A pooled session was freed: aggregate its counters and reconnect the
    /// slot unless the peer or the context is shutting down.
    fn peer_session_freed(&mut self, pid: u64, slot: usize, stats: &SessionStats) {
        let reconnect = {
            let Some(peer) = self.peers.get_mut(&pid) else {
                return;
            };
            peer.release(slot, stats);
            if peer.terminating || !self.running.load(Ordering::Relaxed) {
                None
            } else {
                let handler = (peer.handler_factory)();
                Some((
                    peer.authority.clone(),
                    ConnectSetup {
                        tls: peer.tls.clone(),
                        proto: Some(peer.proto),
                        settings: peer.settings.clone(),
                        handler,
                    },
                ))
            }
        };
        let Some((authority, setup)) = reconnect else {
            return;
        };
        match self.connect(&authority, setup) {
            Ok(sid) => {
                if let Some(session) = self.sessions.get_mut(&sid.0) {
                    session.peer_link = Some((pid, slot));
                }
                if let Some(peer) = self.peers.get_mut(&pid) {
                    peer.attach(slot, sid.0);
                }
                debug!("peer {} slot {} reconnected", pid, slot);
            }
            Err(e) => {
                warn!("peer slot {} reconnect failed: {}", slot, e);
            }
        }
    }
}
