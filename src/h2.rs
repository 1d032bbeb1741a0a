/*
 * h2.rs
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

//! HTTP/2 adapter: the thin bridge between a session and its frame codec.
//!
//! Inbound bytes go to `mem_recv`; the events it queues are drained right
//! after and translated into stream open/attach, body accumulation,
//! completion callbacks and close accounting. Outbound, `mem_send` spans are
//! staged into the session write buffer until a span becomes the zero-copy
//! tail.

use tracing::debug;

use crate::codec::CodecEvent;
use crate::error::{CloseReason, Error};
use crate::session::{Session, Side};
use crate::stream::Stream;

impl Session {
    /// Feed inbound wire bytes to the codec, then translate the events they
    /// produced. Events for one stream arrive in protocol order.
    pub(crate) fn h2_receive(&mut self, data: &[u8]) -> Result<(), Error> {
        let failed = {
            let codec = self.codec.as_mut().ok_or(Error::NoCodec)?;
            let mut off = 0;
            let mut failed = None;
            while off < data.len() {
                match codec.mem_recv(&data[off..]) {
                    Ok(0) => break,
                    Ok(n) => off += n,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            failed
        };
        if let Some(e) = failed {
            self.tag(CloseReason::CodecErr);
            return Err(e.into());
        }

        loop {
            let event = match self.codec.as_mut() {
                Some(codec) => codec.poll_event(),
                None => None,
            };
            let Some(event) = event else { break };
            self.h2_event(event)?;
        }
        Ok(())
    }

    /// Pull pending codec output into the write buffer until the codec is
    /// drained or a span became the tail.
    pub(crate) fn h2_stage(&mut self) -> Result<(), Error> {
        let mut failed = None;
        if let Some(codec) = self.codec.as_mut() {
            while !self.wbuf.has_tail() {
                match codec.mem_send() {
                    Ok(span) if span.is_empty() => break,
                    Ok(span) => {
                        self.wbuf.stage(span);
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = failed {
            self.tag(CloseReason::CodecErr);
            return Err(e.into());
        }
        Ok(())
    }

    fn h2_event(&mut self, event: CodecEvent) -> Result<(), Error> {
        match event {
            CodecEvent::Headers {
                stream_id,
                message,
                end_stream,
            } => match self.side {
                Side::Server => {
                    // stream open on the first inbound header block
                    if self.find_stream(stream_id).is_none() {
                        self.streams.push_back(Stream::new(stream_id));
                    }
                    let idx = self.find_stream(stream_id).expect("opened stream");
                    self.streams[idx].request = Some(message);
                    if end_stream {
                        self.finish_h2_request(stream_id)?;
                    }
                }
                Side::Client => {
                    // headers for an unknown stream (e.g. a declined push)
                    // are dropped; the codec resets them on its own
                    if let Some(idx) = self.find_stream(stream_id) {
                        self.streams[idx].response = Some(message);
                        if end_stream {
                            self.finish_h2_response(stream_id)?;
                        }
                    }
                }
            },
            CodecEvent::Data {
                stream_id,
                chunk,
                end_stream,
            } => {
                if let Some(idx) = self.find_stream(stream_id) {
                    self.streams[idx].recv_body.extend_from_slice(&chunk);
                    if end_stream {
                        match self.side {
                            Side::Server => self.finish_h2_request(stream_id)?,
                            Side::Client => self.finish_h2_response(stream_id)?,
                        }
                    }
                }
            }
            CodecEvent::StreamClose { stream_id, errored } => {
                if errored {
                    self.stats.rsp_rst_cnt += 1;
                }
                if let Some(idx) = self.find_stream(stream_id) {
                    let answered = self.streams[idx].response.is_some();
                    self.streams.remove(idx);
                    self.stats.strm_close_cnt += 1;
                    if self.side == Side::Server && answered && !errored {
                        self.stats.rsp_cnt += 1;
                    }
                }
            }
            CodecEvent::PushPromise {
                parent_id,
                promised_id,
                request,
            } => {
                if self.side != Side::Client {
                    return Ok(());
                }
                let Some(parent_idx) = self.find_stream(parent_id) else {
                    return Ok(());
                };
                let accepted = {
                    let parent = &mut self.streams[parent_idx];
                    match self.handler.on_push_promise(parent, &request) {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            self.tag(CloseReason::CodecErr);
                            return Err(e);
                        }
                    }
                };
                if accepted {
                    let mut stream = Stream::new(promised_id);
                    stream.request = Some(request);
                    stream.promised = true;
                    self.streams.push_back(stream);
                }
            }
            CodecEvent::GoAway {
                last_stream_id,
                error_code,
            } => {
                debug!(
                    "[{}] goaway, last stream {} error {}",
                    self.log_id, last_stream_id, error_code
                );
            }
        }
        Ok(())
    }

    /// A request is complete on a server session. Mirrors the HTTP/1.1
    /// completion path: count, call the handler, submit any immediate
    /// response through the codec.
    fn finish_h2_request(&mut self, stream_id: u32) -> Result<(), Error> {
        let idx = self
            .find_stream(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        self.stats.req_cnt += 1;
        let response = {
            let stream = &mut self.streams[idx];
            stream.finish_recv_body(false);
            match self.handler.on_request(stream) {
                Ok(response) => response,
                Err(e) => {
                    self.tag(CloseReason::CodecErr);
                    return Err(e);
                }
            }
        };
        if let Some(response) = response {
            let failed = {
                let codec = self.codec.as_mut().ok_or(Error::NoCodec)?;
                codec.submit_response(stream_id, &response).err()
            };
            if let Some(e) = failed {
                self.tag(CloseReason::CodecErr);
                return Err(e.into());
            }
            self.streams[idx].set_response(response);
            self.send_pending = true;
        }
        Ok(())
    }

    /// A response is complete on a client session: deliver it and retire the
    /// stream. Pushed streams go to the push-response callback instead.
    fn finish_h2_response(&mut self, stream_id: u32) -> Result<(), Error> {
        let idx = self
            .find_stream(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let mut stream = self.streams.remove(idx).expect("indexed stream");
        stream.finish_recv_body(true);
        if !stream.promised {
            self.stats.rsp_cnt += 1;
        }
        let delivered = if stream.promised {
            self.handler.on_push_response(&mut stream)
        } else {
            self.handler.on_response(&mut stream)
        };
        if let Err(e) = delivered {
            self.tag(CloseReason::CodecErr);
            return Err(e);
        }
        self.stats.strm_close_cnt += 1;
        Ok(())
    }

    fn find_stream(&self, stream_id: u32) -> Option<usize> {
        self.streams.iter().position(|s| s.id() == stream_id)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use bytes::Bytes;

    use super::*;
    use crate::codec::{CodecError, FrameCodec, Http2Settings};
    use crate::error::Error;
    use crate::message::Message;
    use crate::session::{Phase, Proto, SessionHandler, SessionStats};

    #[derive(Default)]
    struct MockState {
        responses: Vec<(u32, u16)>,
        terminated: Option<u32>,
    }

    struct MockCodec {
        events: VecDeque<CodecEvent>,
        sends: VecDeque<Bytes>,
        wants_read: bool,
        wants_write: bool,
        state: Rc<RefCell<MockState>>,
    }

    impl MockCodec {
        fn new() -> Self {
            Self {
                events: VecDeque::new(),
                sends: VecDeque::new(),
                wants_read: true,
                wants_write: false,
                state: Rc::new(RefCell::new(MockState::default())),
            }
        }
    }

    impl FrameCodec for MockCodec {
        fn submit_settings(&mut self, _entries: &[(u16, u32)]) -> Result<(), CodecError> {
            Ok(())
        }

        fn submit_request(&mut self, _message: &Message) -> Result<u32, CodecError> {
            Ok(1)
        }

        fn submit_response(&mut self, stream_id: u32, message: &Message) -> Result<(), CodecError> {
            self.state
                .borrow_mut()
                .responses
                .push((stream_id, message.status().unwrap_or(0)));
            Ok(())
        }

        fn mem_send(&mut self) -> Result<Bytes, CodecError> {
            Ok(self.sends.pop_front().unwrap_or_default())
        }

        fn mem_recv(&mut self, data: &[u8]) -> Result<usize, CodecError> {
            Ok(data.len())
        }

        fn poll_event(&mut self) -> Option<CodecEvent> {
            self.events.pop_front()
        }

        fn wants_read(&self) -> bool {
            self.wants_read
        }

        fn wants_write(&self) -> bool {
            self.wants_write || !self.sends.is_empty()
        }

        fn terminate(&mut self, error_code: u32) -> Result<(), CodecError> {
            self.state.borrow_mut().terminated = Some(error_code);
            self.wants_read = false;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Seen {
        requests: Vec<String>,
        responses: Vec<u16>,
        pushed: Vec<u16>,
        promises: usize,
    }

    struct RecordingHandler {
        seen: Rc<RefCell<Seen>>,
        answer: Option<u16>,
        accept_push: bool,
    }

    impl SessionHandler for RecordingHandler {
        fn on_request(&mut self, stream: &mut crate::stream::Stream) -> Result<Option<Message>, Error> {
            let req = stream.request().expect("request set");
            self.seen
                .borrow_mut()
                .requests
                .push(format!(
                    "{} {} {}",
                    req.method().unwrap_or("-"),
                    req.path().unwrap_or("-"),
                    String::from_utf8_lossy(req.body())
                ));
            Ok(self.answer.map(Message::response))
        }

        fn on_response(&mut self, stream: &mut crate::stream::Stream) -> Result<(), Error> {
            let rsp = stream.response().expect("response set");
            self.seen.borrow_mut().responses.push(rsp.status().unwrap_or(0));
            Ok(())
        }

        fn on_push_promise(
            &mut self,
            _parent: &mut crate::stream::Stream,
            _request: &Message,
        ) -> Result<bool, Error> {
            self.seen.borrow_mut().promises += 1;
            Ok(self.accept_push)
        }

        fn on_push_response(&mut self, stream: &mut crate::stream::Stream) -> Result<(), Error> {
            let rsp = stream.response().expect("response set");
            self.seen.borrow_mut().pushed.push(rsp.status().unwrap_or(0));
            Ok(())
        }
    }

    fn make_session(side: Side, handler: RecordingHandler, codec: MockCodec) -> Session {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let sock = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        sock.set_nonblocking(true).unwrap();
        let sock = mio::net::TcpStream::from_std(sock);
        let mut session = Session::new(
            1,
            side,
            sock,
            None,
            "127.0.0.1:0".to_string(),
            Proto::H2,
            Http2Settings::default(),
            Box::new(handler),
            None,
            false,
        );
        session.proto = Proto::H2;
        session.phase = Phase::Ready;
        session.codec = Some(Box::new(codec));
        session
    }

    fn headers(stream_id: u32, message: Message, end_stream: bool) -> CodecEvent {
        CodecEvent::Headers {
            stream_id,
            message,
            end_stream,
        }
    }

    #[test]
    fn server_request_round_trip() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut codec = MockCodec::new();
        let codec_state = codec.state.clone();
        let mut req = Message::request("POST", "/x");
        req.set_authority("h:80");
        codec.events.push_back(headers(1, req, false));
        codec.events.push_back(CodecEvent::Data {
            stream_id: 1,
            chunk: Bytes::from_static(b"hello"),
            end_stream: true,
        });
        codec.events.push_back(CodecEvent::StreamClose {
            stream_id: 1,
            errored: false,
        });

        let handler = RecordingHandler {
            seen: seen.clone(),
            answer: Some(200),
            accept_push: false,
        };
        let mut session = make_session(Side::Server, handler, codec);
        session.h2_receive(b"wire").unwrap();

        assert_eq!(seen.borrow().requests, ["POST /x hello"]);
        assert_eq!(codec_state.borrow().responses, [(1, 200)]);
        let SessionStats {
            req_cnt,
            rsp_cnt,
            strm_close_cnt,
            ..
        } = session.stats;
        assert_eq!((req_cnt, rsp_cnt, strm_close_cnt), (1, 1, 1));
        assert!(session.streams.is_empty());
        assert!(session.send_pending);
    }

    #[test]
    fn client_response_and_reset_accounting() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut codec = MockCodec::new();
        codec.events.push_back(headers(1, Message::response(200), true));
        codec.events.push_back(CodecEvent::StreamClose {
            stream_id: 3,
            errored: true,
        });

        let handler = RecordingHandler {
            seen: seen.clone(),
            answer: None,
            accept_push: false,
        };
        let mut session = make_session(Side::Client, handler, codec);
        session.streams.push_back(Stream::new(1));
        session.streams.push_back(Stream::new(3));
        session.stats.req_cnt = 2;

        session.h2_receive(b"wire").unwrap();

        assert_eq!(seen.borrow().responses, [200]);
        assert_eq!(session.stats.rsp_cnt, 1);
        assert_eq!(session.stats.rsp_rst_cnt, 1);
        assert_eq!(session.stats.strm_close_cnt, 2);
        assert!(session.streams.is_empty());
    }

    #[test]
    fn accepted_push_is_delivered_separately() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut codec = MockCodec::new();
        codec.events.push_back(CodecEvent::PushPromise {
            parent_id: 1,
            promised_id: 2,
            request: Message::request("GET", "/asset"),
        });
        codec.events.push_back(headers(2, Message::response(203), true));
        codec.events.push_back(headers(1, Message::response(200), true));

        let handler = RecordingHandler {
            seen: seen.clone(),
            answer: None,
            accept_push: true,
        };
        let mut session = make_session(Side::Client, handler, codec);
        session.streams.push_back(Stream::new(1));
        session.stats.req_cnt = 1;

        session.h2_receive(b"wire").unwrap();

        assert_eq!(seen.borrow().promises, 1);
        assert_eq!(seen.borrow().pushed, [203]);
        assert_eq!(seen.borrow().responses, [200]);
        // pushed streams do not count as answered requests
        assert_eq!(session.stats.rsp_cnt, 1);
    }

    #[test]
    fn declined_push_headers_are_ignored() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut codec = MockCodec::new();
        codec.events.push_back(CodecEvent::PushPromise {
            parent_id: 1,
            promised_id: 2,
            request: Message::request("GET", "/asset"),
        });
        codec.events.push_back(headers(2, Message::response(203), true));

        let handler = RecordingHandler {
            seen: seen.clone(),
            answer: None,
            accept_push: false,
        };
        let mut session = make_session(Side::Client, handler, codec);
        session.streams.push_back(Stream::new(1));

        session.h2_receive(b"wire").unwrap();
        assert_eq!(seen.borrow().promises, 1);
        assert!(seen.borrow().pushed.is_empty());
        assert_eq!(session.streams.len(), 1);
    }

    #[test]
    fn stage_pulls_until_tail() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut codec = MockCodec::new();
        codec.sends.push_back(Bytes::from_static(b"small"));
        codec.sends.push_back(Bytes::from(vec![1u8; crate::buffer::MERGE_LIMIT]));
        codec.sends.push_back(Bytes::from_static(b"after tail"));

        let handler = RecordingHandler {
            seen,
            answer: None,
            accept_push: false,
        };
        let mut session = make_session(Side::Client, handler, codec);
        session.h2_stage().unwrap();

        assert!(session.wbuf.has_tail());
        // the span after the tail stays inside the codec
        assert!(session.codec.as_mut().unwrap().wants_write());
    }

    #[test]
    fn quiet_codec_ends_the_session() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut codec = MockCodec::new();
        codec.wants_read = false;
        let handler = RecordingHandler {
            seen,
            answer: None,
            accept_push: false,
        };
        let mut session = make_session(Side::Client, handler, codec);
        session.send().unwrap();
        assert_eq!(session.close_reason, Some(CloseReason::CodecEnd));
        assert!(session.interest().is_none());
    }
}
