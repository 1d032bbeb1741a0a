/*
 * h1.rs
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

//! HTTP/1.1 push parser and head serializers.
//!
//! The parser is incremental and restartable at arbitrary chunk boundaries:
//! request-line or status-line, headers, then a Content-Length-bounded body
//! delivered whole. Chunked transfer and folded headers are rejected.

use bytes::{Bytes, BytesMut};
use std::fmt::Write as _;

use crate::buffer::RecvBuf;
use crate::error::Error;
use crate::message::Message;
use crate::session::Side;

const WS: &[char] = &[' ', '\t'];

/// Parse progress for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Incomplete,
    Complete,
}

/// Incremental parser state, scoped to one message. Reset between messages.
#[derive(Debug, Default)]
pub(crate) struct Parser {
    header_done: bool,
    header_line: u32,
    content_length: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consume as much of one message as the buffer allows, filling `msg`.
    /// Server sessions parse a request line, client sessions a status line.
    pub fn receive(
        &mut self,
        rb: &mut RecvBuf,
        side: Side,
        secure: bool,
        msg: &mut Message,
    ) -> Result<Progress, Error> {
        while !self.header_done {
            let Some(line) = take_line(rb) else {
                return Ok(Progress::Incomplete);
            };
            if line.is_empty() {
                if self.header_line == 0 {
                    return Err(Error::Parse("empty first line"));
                }
                self.header_done = true;
                break;
            }
            let text = std::str::from_utf8(&line)
                .map_err(|_| Error::Parse("header bytes are not valid UTF-8"))?;
            if self.header_line == 0 {
                match side {
                    Side::Server => parse_request_line(text, secure, msg)?,
                    Side::Client => parse_status_line(text, msg)?,
                }
            } else {
                self.parse_header_line(text, side, msg)?;
            }
            self.header_line += 1;
        }

        if self.content_length > 0 {
            if rb.len() < self.content_length {
                return Ok(Progress::Incomplete);
            }
            msg.set_body(rb.take(self.content_length));
            self.content_length = 0;
        }
        Ok(Progress::Complete)
    }

    fn parse_header_line(&mut self, line: &str, side: Side, msg: &mut Message) -> Result<(), Error> {
        if line.starts_with(WS) {
            return Err(Error::Parse("folded header lines are not supported"));
        }
        let colon = line
            .find(':')
            .ok_or(Error::Parse("header line has no colon"))?;
        let name = &line[..colon];
        let value = line[colon + 1..].trim_matches(WS);

        if side == Side::Server && name.eq_ignore_ascii_case("host") {
            msg.set_authority(value);
        } else if name.eq_ignore_ascii_case("content-length") {
            self.content_length = value
                .parse()
                .map_err(|_| Error::Parse("invalid Content-Length value"))?;
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            return Err(Error::Parse("chunked transfer encoding is not supported"));
        } else {
            msg.add_header(name, value);
        }
        Ok(())
    }
}

/// Detach the next line, accepting CRLF or bare LF terminators.
fn take_line(rb: &mut RecvBuf) -> Option<Bytes> {
    let nl = rb.data().iter().position(|&b| b == b'\n')?;
    let mut line = rb.take(nl + 1);
    let end = if nl > 0 && line[nl - 1] == b'\r' {
        nl - 1
    } else {
        nl
    };
    line.truncate(end);
    Some(line)
}

/// `METHOD target HTTP/1.1`. The version suffix is mandatory; the target is
/// everything between the method and the version.
fn parse_request_line(line: &str, secure: bool, msg: &mut Message) -> Result<(), Error> {
    let line = line.trim_end_matches(WS);
    let before = line
        .strip_suffix("HTTP/1.1")
        .ok_or(Error::Parse("request line does not end in HTTP/1.1"))?;
    if !before.ends_with(WS) {
        return Err(Error::Parse("no whitespace before the protocol version"));
    }
    let before = before.trim_end_matches(WS);
    let split = before
        .find(WS)
        .ok_or(Error::Parse("request line has no target"))?;
    let method = &before[..split];
    let path = before[split..].trim_start_matches(WS);
    if path.is_empty() {
        return Err(Error::Parse("request line has no target"));
    }
    msg.set_method(method);
    msg.set_path(path);
    msg.set_scheme(if secure { "https" } else { "http" });
    // provisional; a Host header overrides it
    msg.set_authority("http");
    Ok(())
}

/// Status line: three digits after the version token, first digit 1..=5,
/// reason phrase ignored.
fn parse_status_line(line: &str, msg: &mut Message) -> Result<(), Error> {
    let sp = line
        .find(WS)
        .ok_or(Error::Parse("status line has no status code"))?;
    let rest = line[sp..].trim_start_matches(WS).as_bytes();
    if rest.len() < 3 || !rest[..3].iter().all(|b| b.is_ascii_digit()) {
        return Err(Error::Parse("status code is not three digits"));
    }
    if !(b'1'..=b'5').contains(&rest[0]) {
        return Err(Error::Parse("status code class out of range"));
    }
    if rest.len() > 3 && rest[3] != b' ' && rest[3] != b'\t' {
        return Err(Error::Parse("status code is not three digits"));
    }
    let status = (rest[0] - b'0') as u16 * 100 + (rest[1] - b'0') as u16 * 10 + (rest[2] - b'0') as u16;
    msg.set_status(status);
    Ok(())
}

/// Serialize a request head and body. Host is derived from the authority;
/// Content-Length is emitted only for a non-empty body.
pub(crate) fn encode_request(msg: &Message) -> Bytes {
    let mut head = String::with_capacity(128);
    let _ = write!(
        head,
        "{} {} HTTP/1.1\r\n",
        msg.method().unwrap_or("GET"),
        msg.path().unwrap_or("/")
    );
    if let Some(authority) = msg.authority() {
        let _ = write!(head, "Host: {}\r\n", authority);
    }
    push_headers(&mut head, msg);
    if !msg.body().is_empty() {
        let _ = write!(head, "Content-Length: {}\r\n", msg.body().len());
    }
    head.push_str("\r\n");
    finish(head, msg)
}

/// Serialize a response head and body. Content-Length is always emitted so
/// the peer can delimit the body.
pub(crate) fn encode_response(msg: &Message) -> Bytes {
    let status = msg.status().unwrap_or(200);
    let mut head = String::with_capacity(128);
    let reason = reason_phrase(status);
    if reason.is_empty() {
        let _ = write!(head, "HTTP/1.1 {}\r\n", status);
    } else {
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", status, reason);
    }
    push_headers(&mut head, msg);
    let _ = write!(head, "Content-Length: {}\r\n", msg.body().len());
    head.push_str("\r\n");
    finish(head, msg)
}

fn push_headers(head: &mut String, msg: &Message) {
    for (name, value) in msg.headers() {
        // the engine owns framing and the request target
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let _ = write!(head, "{}: {}\r\n", name, value);
    }
}

fn finish(head: String, msg: &Message) -> Bytes {
    let mut out = BytesMut::with_capacity(head.len() + msg.body().len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(msg.body());
    out.freeze()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(side: Side, chunks: &[&[u8]]) -> (Message, usize) {
        let mut rb = RecvBuf::new();
        let mut parser = Parser::new();
        let mut msg = Message::new();
        let mut completes = 0;
        for chunk in chunks {
            rb.append(chunk);
            loop {
                match parser.receive(&mut rb, side, false, &mut msg).unwrap() {
                    Progress::Complete => {
                        completes += 1;
                        parser.reset();
                    }
                    Progress::Incomplete => break,
                }
                if rb.is_empty() {
                    break;
                }
            }
        }
        (msg, completes)
    }

    #[test]
    fn get_request_round_trip() {
        let wire: &[u8] = b"GET /a HTTP/1.1\r\nHost: h:80\r\n\r\n";
        let (msg, completes) = parse_all(Side::Server, &[wire]);
        assert_eq!(completes, 1);
        assert_eq!(msg.method(), Some("GET"));
        assert_eq!(msg.path(), Some("/a"));
        assert_eq!(msg.authority(), Some("h:80"));
        assert_eq!(msg.scheme(), Some("http"));
        assert!(msg.body().is_empty());

        let mut req = Message::request("GET", "/a");
        req.set_authority("h:80");
        assert_eq!(&encode_request(&req)[..], &wire[..]);
    }

    #[test]
    fn post_request_with_body() {
        let wire: &[u8] = b"POST /x HTTP/1.1\r\nHost: h:80\r\nContent-Length: 5\r\n\r\nhello";
        let (msg, completes) = parse_all(Side::Server, &[wire]);
        assert_eq!(completes, 1);
        assert_eq!(msg.method(), Some("POST"));
        assert_eq!(msg.path(), Some("/x"));
        assert_eq!(&msg.body()[..], b"hello");
    }

    #[test]
    fn response_status_and_body() {
        let wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        let (msg, completes) = parse_all(Side::Client, &[wire]);
        assert_eq!(completes, 1);
        assert_eq!(msg.status(), Some(200));
        assert_eq!(&msg.body()[..], b"OK");

        let mut rsp = Message::response(200);
        rsp.set_body(&b"OK"[..]);
        assert_eq!(&encode_response(&rsp)[..], &wire[..]);
    }

    #[test]
    fn parse_is_chunk_agnostic() {
        let wire: &[u8] = b"POST /x HTTP/1.1\r\nHost: h:80\r\nX-Tag: v\r\nContent-Length: 5\r\n\r\nhello";
        let (whole, completes) = parse_all(Side::Server, &[wire]);
        assert_eq!(completes, 1);

        // every two-cut partition
        for i in 0..=wire.len() {
            for j in i..=wire.len() {
                let (msg, completes) = parse_all(Side::Server, &[&wire[..i], &wire[i..j], &wire[j..]]);
                assert_eq!(completes, 1, "split at {}/{}", i, j);
                assert_eq!(msg.method(), whole.method());
                assert_eq!(msg.path(), whole.path());
                assert_eq!(msg.authority(), whole.authority());
                assert_eq!(msg.header("X-Tag"), Some("v"));
                assert_eq!(msg.body(), whole.body());
            }
        }

        // byte by byte
        let singles: Vec<&[u8]> = wire.chunks(1).collect();
        let (msg, completes) = parse_all(Side::Server, &singles);
        assert_eq!(completes, 1);
        assert_eq!(msg.body(), whole.body());
    }

    #[test]
    fn two_messages_in_one_chunk() {
        let wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 204 No Content\r\n\r\n";
        let (last, completes) = parse_all(Side::Client, &[wire]);
        assert_eq!(completes, 2);
        assert_eq!(last.status(), Some(204));
    }

    #[test]
    fn bare_lf_lines_are_accepted() {
        let wire: &[u8] = b"GET / HTTP/1.1\nHost: h\n\n";
        let (msg, completes) = parse_all(Side::Server, &[wire]);
        assert_eq!(completes, 1);
        assert_eq!(msg.authority(), Some("h"));
    }

    #[test]
    fn version_suffix_is_mandatory() {
        let mut rb = RecvBuf::new();
        rb.append(b"GET /a HTTP/1.0\r\n");
        let mut parser = Parser::new();
        let mut msg = Message::new();
        assert!(parser
            .receive(&mut rb, Side::Server, false, &mut msg)
            .is_err());

        let mut rb = RecvBuf::new();
        rb.append(b"GET /aHTTP/1.1\r\n");
        let mut parser = Parser::new();
        assert!(parser
            .receive(&mut rb, Side::Server, false, &mut msg)
            .is_err());
    }

    #[test]
    fn status_code_class_is_checked() {
        let mut rb = RecvBuf::new();
        rb.append(b"HTTP/1.1 999 Nope\r\n\r\n");
        let mut parser = Parser::new();
        let mut msg = Message::new();
        assert!(parser
            .receive(&mut rb, Side::Client, false, &mut msg)
            .is_err());
    }

    #[test]
    fn chunked_bodies_are_rejected() {
        let mut rb = RecvBuf::new();
        rb.append(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut parser = Parser::new();
        let mut msg = Message::new();
        assert!(parser
            .receive(&mut rb, Side::Server, false, &mut msg)
            .is_err());
    }

    #[test]
    fn folded_headers_are_rejected() {
        let mut rb = RecvBuf::new();
        rb.append(b"GET / HTTP/1.1\r\nX-A: 1\r\n  continued\r\n\r\n");
        let mut parser = Parser::new();
        let mut msg = Message::new();
        assert!(parser
            .receive(&mut rb, Side::Server, false, &mut msg)
            .is_err());
    }

    #[test]
    fn tls_sets_https_scheme() {
        let mut rb = RecvBuf::new();
        rb.append(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut parser = Parser::new();
        let mut msg = Message::new();
        let progress = parser.receive(&mut rb, Side::Server, true, &mut msg).unwrap();
        assert_eq!(progress, Progress::Complete);
        assert_eq!(msg.scheme(), Some("https"));
    }
}
