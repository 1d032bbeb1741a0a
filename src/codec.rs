/*
 * codec.rs
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

//! HTTP/2 frame codec interface.
//!
//! The engine does not frame HTTP/2 itself; it drives an external codec
//! through this trait: submit messages in, pull wire bytes out, feed wire
//! bytes in, drain the events they produce. A codec implementation wraps
//! whatever frame state machine the embedding application links in.

use bytes::Bytes;

use crate::message::Message;
use crate::session::Side;

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u16 = 0x8;

/// SETTINGS values to submit when a session becomes HTTP/2. `None` means the
/// entry is not sent at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
}

impl Http2Settings {
    /// Entries in wire identifier order, skipping unset values.
    pub fn entries(&self) -> Vec<(u16, u32)> {
        let mut out = Vec::new();
        if let Some(v) = self.header_table_size {
            out.push((SETTINGS_HEADER_TABLE_SIZE, v));
        }
        if let Some(v) = self.enable_push {
            out.push((SETTINGS_ENABLE_PUSH, v as u32));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push((SETTINGS_MAX_CONCURRENT_STREAMS, v));
        }
        if let Some(v) = self.initial_window_size {
            out.push((SETTINGS_INITIAL_WINDOW_SIZE, v));
        }
        if let Some(v) = self.max_frame_size {
            out.push((SETTINGS_MAX_FRAME_SIZE, v));
        }
        if let Some(v) = self.max_header_list_size {
            out.push((SETTINGS_MAX_HEADER_LIST_SIZE, v));
        }
        if let Some(v) = self.enable_connect_protocol {
            out.push((SETTINGS_ENABLE_CONNECT_PROTOCOL, v as u32));
        }
        out
    }
}

/// Unrecoverable codec failure; closes the session with a codec-error tag.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// Event produced by `mem_recv` and drained through `poll_event`.
///
/// Events for one stream arrive in protocol order: headers, then data, then
/// close. Draining happens immediately after the `mem_recv` call that queued
/// them.
#[derive(Debug)]
pub enum CodecEvent {
    /// A complete header block. Carries a request on the server side, a
    /// response on the client side.
    Headers {
        stream_id: u32,
        message: Message,
        end_stream: bool,
    },
    /// A body chunk.
    Data {
        stream_id: u32,
        chunk: Bytes,
        end_stream: bool,
    },
    /// Stream closed. `errored` is set when the close was a reset.
    StreamClose { stream_id: u32, errored: bool },
    /// Server push announced on `parent_id`.
    PushPromise {
        parent_id: u32,
        promised_id: u32,
        request: Message,
    },
    /// Peer is shutting the session down.
    GoAway {
        last_stream_id: u32,
        error_code: u32,
    },
}

/// The frame codec state machine, one instance per HTTP/2 session.
pub trait FrameCodec {
    /// Enqueue a SETTINGS frame.
    fn submit_settings(&mut self, entries: &[(u16, u32)]) -> Result<(), CodecError>;

    /// Enqueue a request; the codec assigns and returns the stream id.
    fn submit_request(&mut self, message: &Message) -> Result<u32, CodecError>;

    /// Enqueue a response on an open stream.
    fn submit_response(&mut self, stream_id: u32, message: &Message) -> Result<(), CodecError>;

    /// Next pending span of wire bytes; an empty span means nothing pending.
    /// The returned span stays valid until fully written.
    fn mem_send(&mut self) -> Result<Bytes, CodecError>;

    /// Deliver inbound wire bytes; returns the consumed count and queues the
    /// resulting events.
    fn mem_recv(&mut self, data: &[u8]) -> Result<usize, CodecError>;

    /// Drain the next queued event.
    fn poll_event(&mut self) -> Option<CodecEvent>;

    fn wants_read(&self) -> bool;

    fn wants_write(&self) -> bool;

    /// Enqueue GOAWAY and enter the closing state.
    fn terminate(&mut self, error_code: u32) -> Result<(), CodecError>;
}

/// Creates a codec for each session that negotiates HTTP/2.
pub type CodecFactory = dyn Fn(Side) -> Box<dyn FrameCodec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_settings_produce_no_entries() {
        assert!(Http2Settings::default().entries().is_empty());
    }

    #[test]
    fn entries_follow_wire_identifiers() {
        let s = Http2Settings {
            enable_push: Some(false),
            max_concurrent_streams: Some(100),
            initial_window_size: Some(1 << 20),
            ..Http2Settings::default()
        };
        assert_eq!(
            s.entries(),
            vec![
                (SETTINGS_ENABLE_PUSH, 0),
                (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
                (SETTINGS_INITIAL_WINDOW_SIZE, 1 << 20),
            ]
        );
    }
}
