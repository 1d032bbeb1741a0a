/*
 * tls.rs
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

//! TLS session state and ALPN negotiation.
//!
//! rustls is driven unbuffered: the engine moves wire bytes between the
//! socket and the connection with `read_tls`/`write_tls` and exchanges
//! plaintext through `reader()`/`writer()`, so transient wants-read /
//! wants-write states surface as WouldBlock and ride on the readiness loop.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::buffer::is_transient;
use crate::error::Error;
use crate::session::Proto;

/// Bound on plaintext buffered inside rustls ahead of record flushing.
const TLS_BUFFER_LIMIT: usize = 64 * 1024;

pub(crate) struct TlsState {
    conn: rustls::Connection,
}

impl TlsState {
    pub fn client(config: Arc<ClientConfig>, host: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Authority(host.to_string()))?;
        let mut conn = ClientConnection::new(config, name)?;
        conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        Ok(Self { conn: conn.into() })
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let mut conn = ServerConnection::new(config)?;
        conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        Ok(Self { conn: conn.into() })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Pending TLS records waiting for socket space.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// Run the handshake to completion on a still-blocking socket. Used on
    /// the client side during session construction.
    pub fn handshake_blocking<S: Read + Write>(&mut self, sock: &mut S) -> Result<(), Error> {
        while self.conn.is_handshaking() {
            while self.conn.wants_write() {
                self.conn.write_tls(sock)?;
            }
            if !self.conn.is_handshaking() {
                break;
            }
            if self.conn.wants_read() {
                if self.conn.read_tls(sock)? == 0 {
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                self.conn.process_new_packets()?;
            }
        }
        while self.conn.wants_write() {
            self.conn.write_tls(sock)?;
        }
        Ok(())
    }

    /// Advance a non-blocking handshake. Returns true once complete; false
    /// means the handshake is waiting on socket readiness.
    pub fn advance_handshake<S: Read + Write>(&mut self, sock: &mut S) -> io::Result<bool> {
        loop {
            self.flush_records(sock)?;
            if !self.conn.is_handshaking() {
                return Ok(true);
            }
            if !self.conn.wants_read() {
                return Ok(false);
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => self.process()?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pull decrypted bytes. Ok(0) means the peer closed (with or without
    /// close_notify); WouldBlock means nothing is available yet.
    pub fn read_plain<S: Read>(&mut self, sock: &mut S, out: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(out) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(0),
                Ok(_) => self.process()?,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Accept plaintext into the TLS engine and push records toward the
    /// socket. The accepted count is committed even when record flushing
    /// blocks; leftover records ride on `wants_write` interest.
    pub fn write_plain<S: Write>(&mut self, sock: &mut S, data: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(data)?;
        if n == 0 && !data.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.flush_records(sock)?;
        Ok(n)
    }

    /// Write pending TLS records until drained or the socket blocks.
    pub fn flush_records<S: Write>(&mut self, sock: &mut S) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(ref e) if is_transient(e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Queue close_notify for the write direction.
    pub fn half_close(&mut self) {
        self.conn.send_close_notify();
    }

    fn process(&mut self) -> io::Result<()> {
        self.conn
            .process_new_packets()
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Root store: platform native certs first, Mozilla roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = root_store.add(cert);
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// ALPN identifiers advertised for a protocol preference.
pub fn alpn_protocols(proto: Proto) -> Vec<Vec<u8>> {
    match proto {
        Proto::H2 | Proto::H2Try => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        Proto::H1 => vec![b"http/1.1".to_vec()],
    }
}

/// Default TLS client config for a protocol preference: native + Mozilla
/// roots, no client auth, ALPN set accordingly.
pub fn client_config(proto: Proto) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols(proto);
    Arc::new(config)
}

/// Client-side protocol decision after the handshake.
pub(crate) fn negotiate_client(pref: Proto, alpn: Option<&[u8]>) -> Result<Proto, Error> {
    match alpn {
        Some(p) if p == b"h2" => Ok(Proto::H2),
        _ if pref == Proto::H2 => Err(Error::AlpnMismatch),
        _ => Ok(Proto::H1),
    }
}

/// Server-side protocol decision after the handshake. A client that sent no
/// ALPN at all is assumed to speak the mandatory protocol when h2 is
/// required (prior knowledge).
pub(crate) fn negotiate_server(pref: Proto, alpn: Option<&[u8]>) -> Result<Proto, Error> {
    match alpn {
        Some(p) if p == b"h2" => Ok(Proto::H2),
        Some(_) if pref == Proto::H2 => Err(Error::AlpnMismatch),
        Some(_) => Ok(Proto::H1),
        None if pref == Proto::H2 => Ok(Proto::H2),
        None => Ok(Proto::H1),
    }
}

/// Protocol for a cleartext session. The `Upgrade: h2c` handshake is
/// reserved, so the try preference falls back to HTTP/1.1; a hard h2
/// preference means prior knowledge.
pub(crate) fn cleartext_proto(pref: Proto) -> Proto {
    match pref {
        Proto::H2 => Proto::H2,
        Proto::H2Try | Proto::H1 => Proto::H1,
    }
}
