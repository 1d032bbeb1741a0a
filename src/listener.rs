/*
 * listener.rs
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

//! Server accept endpoint.
//!
//! A listener owns the bound socket and an `Acceptor` that materializes the
//! per-session configuration (TLS, protocol, settings, handler) for every
//! inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::Http2Settings;
use crate::error::Error;
use crate::net;
use crate::session::{Proto, SessionHandler};

/// Per-session configuration produced by an `Acceptor`.
pub struct SessionSetup {
    /// TLS server configuration; None accepts cleartext.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub proto: Proto,
    pub settings: Http2Settings,
    pub handler: Box<dyn SessionHandler>,
}

/// Accept callback: invoked for each inbound connection with the peer's
/// address, returning the session configuration. An `Err` rejects the
/// connection; the listener keeps running.
pub trait Acceptor {
    fn accept(&mut self, host: &str, port: u16) -> Result<SessionSetup, Error>;
}

impl<F> Acceptor for F
where
    F: FnMut(&str, u16) -> Result<SessionSetup, Error>,
{
    fn accept(&mut self, host: &str, port: u16) -> Result<SessionSetup, Error> {
        self(host, port)
    }
}

pub(crate) struct Listener {
    pub(crate) authority: String,
    pub(crate) sock: mio::net::TcpListener,
    pub(crate) acceptor: Box<dyn Acceptor>,
}

impl Listener {
    pub(crate) fn bind(authority: &str, acceptor: Box<dyn Acceptor>) -> Result<Self, Error> {
        let sock = net::bind_listener(authority)?;
        Ok(Self {
            authority: authority.to_string(),
            sock,
            acceptor,
        })
    }

    /// Bound address; the port is meaningful when the authority asked for 0.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr().ok()
    }
}
