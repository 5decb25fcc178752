//! Destination hostname sniffing from the first client bytes
//!
//! Reads the SNI extension out of a TLS ClientHello, or the `Host` header
//! out of a plaintext HTTP/1 request. The bytes are peeked, never consumed,
//! so whatever handles the connection afterwards sees the full stream.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

/// Bytes peeked while looking for a hostname
pub const PEEK_LIMIT: usize = 8192;

const HTTP_METHODS: &[&str] = &[
    "GET ", "POST ", "PUT ", "HEAD ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    Tls { sni: Option<String> },
    Http { host: Option<String> },
    /// Neither TLS nor HTTP (or the client sent nothing in time)
    Opaque,
    /// Need more bytes to decide
    Incomplete,
}

impl Sniffed {
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Sniffed::Tls { sni } => sni.as_deref(),
            Sniffed::Http { host } => host.as_deref(),
            _ => None,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Sniffed::Http { .. })
    }
}

/// Classify the first bytes of a client stream
pub fn sniff(buf: &[u8]) -> Sniffed {
    if buf.is_empty() {
        return Sniffed::Incomplete;
    }
    if buf[0] == 0x16 {
        return parse_client_hello(buf);
    }
    if looks_like_http(buf) {
        return parse_http_host(buf);
    }
    Sniffed::Opaque
}

fn looks_like_http(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| {
        let m = m.as_bytes();
        if buf.len() >= m.len() {
            buf.starts_with(m)
        } else {
            m.starts_with(buf)
        }
    })
}

fn parse_http_host(buf: &[u8]) -> Sniffed {
    let head_end = match find(buf, b"\r\n\r\n") {
        Some(i) => i,
        None if buf.len() >= PEEK_LIMIT => return Sniffed::Http { host: None },
        None => return Sniffed::Incomplete,
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let host = head.split("\r\n").skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("host")
            .then(|| strip_port(value.trim()).to_ascii_lowercase())
    });
    Sniffed::Http {
        host: host.filter(|h| !h.is_empty()),
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal cursor over a byte slice; every read is bounds checked
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<usize> {
        Some(((self.u8()? as usize) << 8) | self.u8()? as usize)
    }

    fn u24(&mut self) -> Option<usize> {
        Some(((self.u8()? as usize) << 16) | self.u16()?)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(out)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

fn parse_client_hello(buf: &[u8]) -> Sniffed {
    // record header: type(1) version(2) length(2)
    if buf.len() < 5 {
        return Sniffed::Incomplete;
    }
    let record_len = ((buf[3] as usize) << 8) | buf[4] as usize;
    if buf.len() < 5 + record_len {
        if buf.len() >= PEEK_LIMIT {
            return Sniffed::Tls { sni: None };
        }
        return Sniffed::Incomplete;
    }

    let mut r = Reader {
        buf: &buf[5..5 + record_len],
        pos: 0,
    };
    Sniffed::Tls {
        sni: read_sni(&mut r),
    }
}

fn read_sni(r: &mut Reader<'_>) -> Option<String> {
    // ClientHello
    if r.u8()? != 0x01 {
        return None;
    }
    r.u24()?;
    r.skip(2 + 32)?; // version, random
    let session_id = r.u8()? as usize;
    r.skip(session_id)?;
    let suites = r.u16()?;
    r.skip(suites)?;
    let compression = r.u8()? as usize;
    r.skip(compression)?;

    let ext_total = r.u16()?;
    let mut ext = Reader {
        buf: r.take(ext_total)?,
        pos: 0,
    };
    while ext.pos < ext.buf.len() {
        let kind = ext.u16()?;
        let len = ext.u16()?;
        let data = ext.take(len)?;
        if kind != 0x0000 {
            continue;
        }
        let mut sni = Reader { buf: data, pos: 0 };
        let list_len = sni.u16()?;
        let mut list = Reader {
            buf: sni.take(list_len)?,
            pos: 0,
        };
        while list.pos < list.buf.len() {
            let name_type = list.u8()?;
            let name_len = list.u16()?;
            let name = list.take(name_len)?;
            if name_type == 0 {
                return std::str::from_utf8(name).ok().map(|s| s.to_ascii_lowercase());
            }
        }
    }
    None
}

/// Peek at `stream` until the first bytes classify or `timeout` passes
pub async fn sniff_stream(stream: &TcpStream, timeout: Duration) -> Sniffed {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut last_len = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = match tokio::time::timeout(remaining, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => return Sniffed::Opaque,
        };
        if n == 0 {
            return Sniffed::Opaque;
        }
        match sniff(&buf[..n]) {
            Sniffed::Incomplete if Instant::now() < deadline => {
                // peek returns immediately while data is buffered; wait for more
                if n == last_len {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                last_len = n;
            }
            Sniffed::Incomplete => return Sniffed::Opaque,
            done => return done,
        }
    }
}
