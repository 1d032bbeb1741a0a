/*
 * error.rs
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

//! Engine errors and session close diagnostics.

use std::io;

use crate::codec::CodecError;

/// Errors surfaced by the engine API and by per-session receive/send steps.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("HTTP/1.1 parse error: {0}")]
    Parse(&'static str),

    #[error("invalid authority {0:?}")]
    Authority(String),

    #[error("h2 was required but ALPN negotiated another protocol")]
    AlpnMismatch,

    #[error("no HTTP/2 codec factory installed")]
    NoCodec,

    #[error("session is terminating")]
    Terminating,

    #[error("peer is terminating")]
    PeerTerminating,

    #[error("no active session available")]
    NoActiveSession,

    #[error("unknown session")]
    UnknownSession,

    #[error("unknown stream {0}")]
    UnknownStream(u32),

    #[error("unknown listener")]
    UnknownListener,

    #[error("unknown peer")]
    UnknownPeer,
}

/// Why a session was closed. Tagged once, used for diagnostics on free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Socket I/O failure other than a transient one.
    SockErr,
    /// Peer closed the connection.
    SockEof,
    /// TLS failure other than wants-read/wants-write.
    TlsErr,
    /// The frame codec signalled an unrecoverable state.
    CodecErr,
    /// The frame codec wants neither read nor write; clean HTTP/2 end.
    CodecEnd,
    /// HTTP/1.1 parse failure.
    HttpErr,
    /// Nothing left to do on an HTTP/1.1 session.
    HttpEnd,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::SockErr => "socket error",
            CloseReason::SockEof => "peer closed",
            CloseReason::TlsErr => "tls error",
            CloseReason::CodecErr => "codec error",
            CloseReason::CodecEnd => "codec end",
            CloseReason::HttpErr => "http parse error",
            CloseReason::HttpEnd => "http end",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
