/*
 * stream.rs
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

//! One request/response exchange on a session.
//!
//! Streams live in the owning session's FIFO. HTTP/2 stream ids come from
//! the codec; HTTP/1.1 ids are synthetic. User data attached to a stream is
//! dropped when the stream is freed.

use std::any::Any;

use bytes::{Bytes, BytesMut};

use crate::message::Message;

pub struct Stream {
    id: u32,
    pub(crate) request: Option<Message>,
    pub(crate) response: Option<Message>,
    /// Serialized send bytes (HTTP/1.1 head + body) and the read cursor.
    pub(crate) send_data: Bytes,
    pub(crate) send_off: usize,
    pub(crate) serialized: bool,
    /// Body accumulation for inbound HTTP/2 DATA chunks.
    pub(crate) recv_body: BytesMut,
    /// Stream announced by a server push.
    pub(crate) promised: bool,
    user_data: Option<Box<dyn Any>>,
}

impl Stream {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            request: None,
            response: None,
            send_data: Bytes::new(),
            send_off: 0,
            serialized: false,
            recv_body: BytesMut::new(),
            promised: false,
            user_data: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn request(&self) -> Option<&Message> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub(crate) fn set_response(&mut self, response: Message) {
        self.response = Some(response);
    }

    /// Unsent remainder of the serialized send bytes.
    pub(crate) fn has_unsent(&self) -> bool {
        self.send_off < self.send_data.len()
    }

    /// Move accumulated DATA chunks into the message body.
    pub(crate) fn finish_recv_body(&mut self, into_response: bool) {
        if self.recv_body.is_empty() {
            return;
        }
        let body = self.recv_body.split().freeze();
        let msg = if into_response {
            self.response.get_or_insert_with(Message::new)
        } else {
            self.request.get_or_insert_with(Message::new)
        };
        msg.set_body(body);
    }

    /// Attach user data; replaces any previous value (which is dropped).
    pub fn set_user_data<T: Any>(&mut self, value: T) {
        self.user_data = Some(Box::new(value));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref().and_then(|d| d.downcast_ref())
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut().and_then(|d| d.downcast_mut())
    }

    pub fn take_user_data<T: Any>(&mut self) -> Option<Box<T>> {
        match self.user_data.take() {
            Some(d) => match d.downcast() {
                Ok(v) => Some(v),
                Err(d) => {
                    self.user_data = Some(d);
                    None
                }
            },
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_is_typed() {
        let mut s = Stream::new(1);
        s.set_user_data(42u32);
        assert_eq!(s.user_data::<u32>(), Some(&42));
        assert_eq!(s.user_data::<String>(), None);
        *s.user_data_mut::<u32>().unwrap() = 7;
        assert_eq!(*s.take_user_data::<u32>().unwrap(), 7);
        assert!(s.user_data::<u32>().is_none());
    }

    #[test]
    fn recv_body_moves_into_message() {
        let mut s = Stream::new(3);
        s.recv_body.extend_from_slice(b"par");
        s.recv_body.extend_from_slice(b"tial");
        s.finish_recv_body(true);
        assert_eq!(&s.response().unwrap().body()[..], b"partial");
        assert!(s.recv_body.is_empty());
    }
}
