//! The SASL authentication handshake which D-Bus performs.
//!
//! The handshake is line-oriented and CRLF-terminated: a zero transport
//! preamble byte and an `AUTH` probe, a `REJECTED` response advertising the
//! daemon's mechanisms, one `AUTH <MECHANISM> <initial-response>` attempt
//! per allowed mechanism, and a final `BEGIN` after which the socket speaks
//! the binary D-Bus protocol.

#[cfg(test)]
mod tests;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::ErrorKind;
use crate::utils::{split_once, trim_end};
use crate::{Error, Result};

/// Cap on the length of a single SASL line.
const MAX_LINE: usize = 8192;

/// A SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthMethod {
    /// EXTERNAL authentication, asserting the credentials the kernel
    /// reported for the socket. The initial response is the hex-encoded
    /// decimal uid.
    External,
    /// ANONYMOUS authentication with a hex-encoded trace string.
    Anonymous,
}

impl AuthMethod {
    /// The set of mechanisms attempted by default, in order of preference.
    pub const DEFAULT: &'static [AuthMethod] = &[AuthMethod::External, AuthMethod::Anonymous];

    fn name(&self) -> &'static str {
        match self {
            AuthMethod::External => "EXTERNAL",
            AuthMethod::Anonymous => "ANONYMOUS",
        }
    }
}

/// The daemon's response to a single handshake line.
#[derive(Debug, PartialEq, Eq)]
enum Response {
    Ok,
    Rejected(Vec<String>),
}

fn parse_response(line: &[u8]) -> Result<Response> {
    let line = trim_end(line);

    let (command, rest) = match split_once(line, b' ') {
        Some((command, rest)) => (command, rest),
        None => (line, &[][..]),
    };

    match command {
        b"OK" => Ok(Response::Ok),
        b"REJECTED" => {
            let rest = std::str::from_utf8(rest)?;

            Ok(Response::Rejected(
                rest.split(' ')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect(),
            ))
        }
        _ => Err(Error::new(ErrorKind::InvalidSasl)),
    }
}

/// Hex-encode bytes for use as an initial response.
fn ascii_hex(bytes: &[u8]) -> String {
    const HEX: [u8; 16] = *b"0123456789abcdef";

    let mut out = String::with_capacity(bytes.len() * 2);

    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }

    out
}

/// The EXTERNAL initial response for a uid: its decimal form, hex-encoded.
pub(crate) fn uid_ascii_hex(id: u32) -> String {
    ascii_hex(id.to_string().as_bytes())
}

async fn read_line(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);

        if byte[0] == b'\n' {
            return Ok(line);
        }

        if line.len() > MAX_LINE {
            return Err(Error::new(ErrorKind::InvalidSasl));
        }
    }
}

/// Authenticate the freshly opened stream.
///
/// On success the socket has sent `BEGIN` and is ready for the binary D-Bus
/// protocol; on failure the caller should close it and try the next
/// endpoint.
pub(crate) async fn authenticate(
    stream: &mut UnixStream,
    allowed: &[AuthMethod],
) -> Result<()> {
    // The transport preamble byte, then probe for the advertised methods.
    stream.write_all(b"\0AUTH\r\n").await?;

    let line = read_line(stream).await?;

    let Response::Rejected(advertised) = parse_response(&line)? else {
        return Err(Error::new(ErrorKind::InvalidSasl));
    };

    for method in allowed {
        if !advertised.iter().any(|a| a == method.name()) {
            continue;
        }

        let initial = match method {
            AuthMethod::External => {
                let uid = unsafe { libc::getuid() };
                uid_ascii_hex(uid)
            }
            AuthMethod::Anonymous => ascii_hex(b"busmux"),
        };

        let request = format!("AUTH {} {}\r\n", method.name(), initial);
        stream.write_all(request.as_bytes()).await?;

        let line = read_line(stream).await?;

        match parse_response(&line)? {
            Response::Ok => {
                stream.write_all(b"BEGIN\r\n").await?;
                return Ok(());
            }
            Response::Rejected(..) => {
                tracing::debug!("{} rejected by daemon", method.name());
            }
        }
    }

    Err(Error::new(ErrorKind::AuthRejected))
}
