/*
 * peer.rs
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

//! Client-side session pool.
//!
//! A peer keeps N parallel sessions to one authority and presents them as
//! one logical endpoint: requests are routed round-robin, sessions that hit
//! the request threshold are rotated out gracefully, and freed slots
//! reconnect in place while the peer is alive.

use std::sync::Arc;
use std::time::Instant;

use crate::codec::Http2Settings;
use crate::session::{Proto, SessionHandler, SessionStats};

/// Peer construction parameters.
pub struct PeerConfig {
    /// `host:port` or `[v6]:port`.
    pub authority: String,
    /// Parallel session count N.
    pub sessions: usize,
    /// Rotate a session after this many requests; 0 disables rotation.
    pub req_thr: u64,
    pub proto: Proto,
    /// TLS client configuration; None connects in cleartext.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub settings: Http2Settings,
}

/// Makes one handler per pooled session, including reconnects.
pub type HandlerFactory = dyn FnMut() -> Box<dyn SessionHandler>;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PeerSlot {
    pub session: Option<u64>,
    pub active: bool,
}

pub(crate) struct Peer {
    pub(crate) authority: String,
    pub(crate) proto: Proto,
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) settings: Http2Settings,
    pub(crate) slots: Vec<PeerSlot>,
    pub(crate) active_cnt: usize,
    pub(crate) next_idx: usize,
    pub(crate) req_thr: u64,
    pub(crate) handler_factory: Box<HandlerFactory>,
    /// Counters absorbed from freed sessions.
    pub(crate) agg: SessionStats,
    pub(crate) started: Instant,
    pub(crate) ended: Option<Instant>,
    pub(crate) terminating: bool,
}

impl Peer {
    pub(crate) fn new(config: PeerConfig, handler_factory: Box<HandlerFactory>) -> Self {
        let slots = vec![PeerSlot::default(); config.sessions.max(1)];
        Self {
            authority: config.authority,
            proto: config.proto,
            tls: config.tls,
            settings: config.settings,
            slots,
            active_cnt: 0,
            next_idx: 0,
            req_thr: config.req_thr,
            handler_factory,
            agg: SessionStats::default(),
            started: Instant::now(),
            ended: None,
            terminating: false,
        }
    }

    /// Install a freshly connected session into a slot.
    pub(crate) fn attach(&mut self, slot: usize, session: u64) {
        let entry = &mut self.slots[slot];
        if !entry.active {
            self.active_cnt += 1;
        }
        entry.session = Some(session);
        entry.active = true;
    }

    /// Mark a slot inactive (rotation or free), keeping any session link.
    pub(crate) fn deactivate(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        if entry.active {
            entry.active = false;
            self.active_cnt -= 1;
        }
    }

    /// Clear a freed session out of its slot and absorb its counters.
    pub(crate) fn release(&mut self, slot: usize, stats: &SessionStats) {
        self.deactivate(slot);
        self.slots[slot].session = None;
        self.agg.absorb(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: usize) -> Peer {
        Peer::new(
            PeerConfig {
                authority: "h:80".to_string(),
                sessions: n,
                req_thr: 0,
                proto: Proto::H1,
                tls: None,
                settings: Http2Settings::default(),
            },
            Box::new(|| Box::new(Nop)),
        )
    }

    struct Nop;
    impl SessionHandler for Nop {}

    #[test]
    fn attach_and_release_track_active_count() {
        let mut p = peer(2);
        p.attach(0, 10);
        p.attach(1, 11);
        assert_eq!(p.active_cnt, 2);

        let stats = SessionStats {
            req_cnt: 5,
            rsp_cnt: 5,
            ..SessionStats::default()
        };
        p.release(0, &stats);
        assert_eq!(p.active_cnt, 1);
        assert!(p.slots[0].session.is_none());
        assert_eq!(p.agg.req_cnt, 5);

        // re-attach after reconnect
        p.attach(0, 12);
        assert_eq!(p.active_cnt, 2);
        assert_eq!(p.slots[0].session, Some(12));
    }

    #[test]
    fn deactivate_is_idempotent() {
        let mut p = peer(1);
        p.attach(0, 1);
        p.deactivate(0);
        p.deactivate(0);
        assert_eq!(p.active_cnt, 0);
        // the session link survives deactivation until release
        assert_eq!(p.slots[0].session, Some(1));
    }
}
