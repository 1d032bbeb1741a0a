/*
 * lib.rs
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

//! Staffetta: an event-driven dual-protocol HTTP engine.
//!
//! One `Context` owns a readiness loop and every listener, peer and session
//! registered with it. Sessions speak HTTP/2 through an external frame codec
//! (see `codec::FrameCodec`) or HTTP/1.1 through the in-tree incremental
//! parser, over plain TCP or TLS with ALPN negotiation. A `Peer` pools N
//! sessions to one authority with round-robin routing, quota-driven rotation
//! and reconnect-in-place.
//!
//! Everything runs on the thread that calls `Context::run`; handlers are
//! invoked from inside the loop as messages complete.

mod buffer;
pub mod codec;
mod context;
mod error;
mod h1;
mod h2;
mod listener;
mod message;
mod net;
mod peer;
mod session;
mod stream;
pub mod tls;

pub use codec::{CodecError, CodecEvent, FrameCodec, Http2Settings};
pub use context::{ConnectSetup, Context, ListenerId, PeerId, SessionId, Stopper};
pub use error::{CloseReason, Error};
pub use listener::{Acceptor, SessionSetup};
pub use message::Message;
pub use peer::PeerConfig;
pub use session::{Proto, SessionHandler, SessionStats, Side, TerminateStatus};
pub use stream::Stream;
