/*
 * message.rs
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

//! HTTP message: pseudo-values (method, scheme, authority, path, status),
//! ordered headers, opaque body.

use bytes::Bytes;

/// One HTTP message, request or response. Same shape for both protocols:
/// HTTP/1.1 parsing fills the pseudo-values from the first line, HTTP/2
/// carries them as pseudo-headers.
#[derive(Debug, Clone, Default)]
pub struct Message {
    method: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request skeleton: method and path set, scheme/authority left to the
    /// sending session.
    pub fn request(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Response skeleton with a status code.
    pub fn response(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.method = Some(method.into());
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = Some(scheme.into());
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn set_authority(&mut self, authority: impl Into<String>) {
        self.authority = Some(authority.into());
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Append a header pair. Order is preserved; names are stored as given.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// First header value with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut m = Message::new();
        m.add_header("Content-Type", "text/plain");
        assert_eq!(m.header("content-type"), Some("text/plain"));
        assert_eq!(m.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(m.header("content-length"), None);
    }

    #[test]
    fn header_order_is_preserved() {
        let mut m = Message::new();
        m.add_header("a", "1");
        m.add_header("b", "2");
        m.add_header("a", "3");
        let names: Vec<&str> = m.headers().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a", "b", "a"]);
        // first match wins on lookup
        assert_eq!(m.header("a"), Some("1"));
    }

    #[test]
    fn request_skeleton() {
        let m = Message::request("GET", "/index");
        assert_eq!(m.method(), Some("GET"));
        assert_eq!(m.path(), Some("/index"));
        assert!(m.status().is_none());
        assert!(m.body().is_empty());
    }
}
