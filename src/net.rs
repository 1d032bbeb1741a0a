/*
 * net.rs
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

//! Authority strings and socket setup.
//!
//! Authorities are `host:port` or `[v6]:port`; scheme prefixes are the
//! caller's concern. Sockets get TCP_NODELAY and close-on-exec; listeners
//! additionally SO_REUSEADDR and a 1024 backlog.

use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Error;

const LISTEN_BACKLOG: i32 = 1024;

/// Split an authority into host and port. Bracketed IPv6 literals are
/// returned without the brackets.
pub(crate) fn split_authority(authority: &str) -> Result<(&str, u16), Error> {
    let bad = || Error::Authority(authority.to_string());
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(bad)?;
        (&rest[..end], port)
    } else {
        let i = authority.rfind(':').ok_or_else(bad)?;
        (&authority[..i], &authority[i + 1..])
    };
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse().map_err(|_| bad())?;
    Ok((host, port))
}

/// Resolve an authority to its address candidates.
pub(crate) fn resolve(authority: &str) -> Result<Vec<SocketAddr>, Error> {
    split_authority(authority)?;
    let addrs: Vec<SocketAddr> = authority
        .to_socket_addrs()
        .map_err(|_| Error::Authority(authority.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Authority(authority.to_string()));
    }
    Ok(addrs)
}

/// Connect to the first reachable candidate. The socket stays blocking; the
/// caller flips it non-blocking after any TLS handshake.
pub(crate) fn connect_blocking(authority: &str) -> Result<StdTcpStream, Error> {
    let mut last = None;
    for addr in resolve(authority)? {
        match StdTcpStream::connect(addr) {
            Ok(sock) => {
                sock.set_nodelay(true)?;
                return Ok(sock);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last
        .map(Error::Io)
        .unwrap_or_else(|| Error::Authority(authority.to_string())))
}

/// Bind a non-blocking listener on the first workable candidate.
pub(crate) fn bind_listener(authority: &str) -> Result<mio::net::TcpListener, Error> {
    let mut last = None;
    for addr in resolve(authority)? {
        match try_bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last = Some(e),
        }
    }
    Err(last
        .map(Error::Io)
        .unwrap_or_else(|| Error::Authority(authority.to_string())))
}

fn try_bind(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_cloexec(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_authority() {
        assert_eq!(split_authority("example.net:8080").unwrap(), ("example.net", 8080));
        assert_eq!(split_authority("127.0.0.1:80").unwrap(), ("127.0.0.1", 80));
    }

    #[test]
    fn bracketed_ipv6_authority() {
        assert_eq!(split_authority("[::1]:443").unwrap(), ("::1", 443));
        assert_eq!(
            split_authority("[fe80::1]:8443").unwrap(),
            ("fe80::1", 8443)
        );
    }

    #[test]
    fn malformed_authorities_are_rejected() {
        assert!(split_authority("no-port").is_err());
        assert!(split_authority(":8080").is_err());
        assert!(split_authority("[::1]").is_err());
        assert!(split_authority("[::1]443").is_err());
        assert!(split_authority("host:notaport").is_err());
    }

    #[test]
    fn loopback_resolves() {
        let addrs = resolve("127.0.0.1:0").unwrap();
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }
}
