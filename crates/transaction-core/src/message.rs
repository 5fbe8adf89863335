//! Minimal SIP message view
//!
//! Just enough of a SIP message to key transactions and to build the few
//! messages the transaction layer generates on its own (hop-by-hop ACK,
//! CANCEL, overload responses). Headers are kept as raw name/value pairs in
//! arrival order and written back out unchanged.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use rvoip_sip_transport::Transport;
use rand::Rng;
use rand::distributions::Alphanumeric;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Magic cookie that starts every RFC 3261 branch
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Prack,
    Bye,
    Register,
    Options,
    Info,
    Update,
    Subscribe,
    Notify,
    Message,
    Refer,
    Publish,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Prack => "PRACK",
            Method::Bye => "BYE",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Message => "MESSAGE",
            Method::Refer => "REFER",
            Method::Publish => "PUBLISH",
            Method::Other(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = |b: u8| b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b);
        if s.is_empty() || !s.bytes().all(token) {
            return Err(Error::InvalidMessage(format!("bad method token: {:?}", s)));
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "PRACK" => Method::Prack,
            "BYE" => Method::Bye,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "MESSAGE" => Method::Message,
            "REFER" => Method::Refer,
            "PUBLISH" => Method::Publish,
            other => Method::Other(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: String },
    Response { status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Compact header forms (RFC 3261 section 7.3.3)
const COMPACT_FORMS: &[(&str, &str)] = &[
    ("v", "Via"),
    ("i", "Call-ID"),
    ("f", "From"),
    ("t", "To"),
    ("l", "Content-Length"),
    ("m", "Contact"),
    ("c", "Content-Type"),
    ("k", "Supported"),
    ("s", "Subject"),
    ("e", "Content-Encoding"),
];

fn full_name(name: &str) -> &str {
    COMPACT_FORMS
        .iter()
        .find(|(short, _)| short.eq_ignore_ascii_case(name))
        .map(|(_, long)| *long)
        .unwrap_or(name)
}

fn same_header(a: &str, b: &str) -> bool {
    full_name(a).eq_ignore_ascii_case(full_name(b))
}

/// Value of parameter `name` in a From/To/Contact/Via value
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value.split_once(';').map(|(_, p)| p)?,
    };
    params
        .split(';')
        .filter_map(|p| {
            let p = p.trim();
            match p.split_once('=') {
                Some((k, v)) => Some((k.trim(), v.trim())),
                None if !p.is_empty() => Some((p, "")),
                None => None,
            }
        })
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// Top Via of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: Transport,
    pub host: String,
    pub port: Option<u16>,
    pub branch: Option<String>,
}

impl Via {
    /// Parses one Via value such as `SIP/2.0/UDP host:5060;branch=z9hG4bK1`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (protocol, rest) = value
            .split_once(|c: char| c.is_ascii_whitespace())
            .ok_or(Error::MissingHeader("Via"))?;
        let transport = protocol
            .rsplit('/')
            .next()
            .and_then(|t| Transport::from_str(t).ok())
            .ok_or_else(|| {
                Error::InvalidMessage(format!("unsupported Via transport: {}", protocol))
            })?;

        let rest = rest.trim_start();
        let sent_by = rest.split(';').next().unwrap_or("").trim();
        let (host, port) = split_host_port(sent_by)?;
        let params = rest.split_once(';').map(|(_, p)| p).unwrap_or("");
        let branch = header_param(&format!("x;{}", params), "branch")
            .filter(|b| !b.is_empty())
            .map(str::to_string);

        Ok(Self {
            transport,
            host,
            port,
            branch,
        })
    }

    /// Port with the transport default filled in
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(self.transport.default_port())
    }

    pub fn is_rfc3261_branch(&self) -> bool {
        self.branch
            .as_deref()
            .is_some_and(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        Ok(())
    }
}

fn split_host_port(sent_by: &str) -> Result<(String, Option<u16>)> {
    if sent_by.is_empty() {
        return Err(Error::MissingHeader("Via"));
    }
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::InvalidMessage(format!("bad port in {}", sent_by)))
    };
    if let Some(v6) = sent_by.strip_prefix('[') {
        let (host, rest) = v6
            .split_once(']')
            .ok_or_else(|| Error::InvalidMessage(format!("bad IPv6 host: {}", sent_by)))?;
        let port = match rest.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((format!("[{}]", host.to_ascii_lowercase()), port));
    }
    match sent_by.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_ascii_lowercase(), Some(parse_port(port)?))),
        None => Ok((sent_by.to_ascii_lowercase(), None)),
    }
}

/// A parsed SIP request or response
#[derive(Debug, Clone)]
pub struct SipMessage {
    start: StartLine,
    headers: Vec<Header>,
    body: Bytes,
}

impl SipMessage {
    pub fn new_request(method: Method, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn new_response(status: u16, reason: Option<&str>) -> Self {
        Self {
            start: StartLine::Response {
                status,
                reason: reason.unwrap_or(default_reason(status)).to_string(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Parses one framed message
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head_end, body_start) = match find(data, b"\r\n\r\n") {
            Some(i) => (i, i + 4),
            None => (data.len(), data.len()),
        };
        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| Error::InvalidMessage("headers are not UTF-8".to_string()))?;
        let mut lines = head.split("\r\n");
        let first = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::InvalidMessage("empty message".to_string()))?;
        let start = parse_start_line(first)?;

        let mut headers: Vec<Header> = Vec::new();
        for line in lines {
            if line.starts_with([' ', '\t']) {
                // folded continuation
                let last = headers
                    .last_mut()
                    .ok_or_else(|| {
                        Error::InvalidMessage("continuation before any header".to_string())
                    })?;
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidMessage(format!("bad header line: {:?}", line)))?;
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }

        let mut message = Self {
            start,
            headers,
            body: Bytes::new(),
        };
        let available = &data[body_start..];
        let body_len = match message.header("Content-Length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| Error::InvalidMessage(format!("bad Content-Length: {}", v)))?
                .min(available.len()),
            None => available.len(),
        };
        message.body = Bytes::copy_from_slice(&available[..body_len]);
        Ok(message)
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// Request method; `None` for responses
    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    /// Host part of the request URI
    pub fn request_uri_host(&self) -> Option<&str> {
        let uri = self.request_uri()?;
        let rest = uri.split_once(':').map(|(_, r)| r).unwrap_or(uri);
        let rest = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
        let end = rest.find([';', '?']).unwrap_or(rest.len());
        let host_port = &rest[..end];
        if host_port.starts_with('[') {
            return host_port.find(']').map(|i| &host_port[..=i]);
        }
        Some(host_port.split(':').next().unwrap_or(host_port))
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of `name`, compact forms included
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    pub fn header_values<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| same_header(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Inserts a header ahead of all others, as a new top Via is
    pub fn prepend_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(
            0,
            Header {
                name: name.into(),
                value: value.into(),
            },
        );
    }

    /// Replaces the first `name` header, or appends one
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|h| same_header(&h.name, name)) {
            Some(header) => header.value = value,
            None => self.push_header(name, value),
        }
    }

    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !same_header(&h.name, name));
        before - self.headers.len()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.set_header("Content-Length", self.body.len().to_string());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID").filter(|v| !v.is_empty())
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.header("From")
            .and_then(|v| header_param(v, "tag"))
            .filter(|t| !t.is_empty())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.header("To")
            .and_then(|v| header_param(v, "tag"))
            .filter(|t| !t.is_empty())
    }

    /// Adds a To tag unless one is present
    pub fn set_to_tag(&mut self, tag: &str) {
        if self.to_tag().is_some() {
            return;
        }
        if let Some(header) = self.headers.iter_mut().find(|h| same_header(&h.name, "To")) {
            header.value = format!("{};tag={}", header.value, tag);
        }
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_ascii_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = parts.next()?.parse().ok()?;
        Some((number, method))
    }

    /// RAck of a PRACK: response number, CSeq number and method
    pub fn rack(&self) -> Option<(u32, u32, Method)> {
        let value = self.header("RAck")?;
        let mut parts = value.split_ascii_whitespace();
        let rseq = parts.next()?.parse().ok()?;
        let cseq = parts.next()?.parse().ok()?;
        let method = parts.next()?.parse().ok()?;
        Some((rseq, cseq, method))
    }

    pub fn top_via(&self) -> Option<Via> {
        let first = self.header("Via")?.split(',').next()?;
        Via::parse(first).ok()
    }

    /// Method the transaction is keyed under: the request method, or the
    /// CSeq method for responses
    pub fn transaction_method(&self) -> Option<Method> {
        match self.method() {
            Some(method) => Some(method.clone()),
            None => self.cseq().map(|(_, m)| m),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.status().is_some_and(|s| (100..200).contains(&s))
    }

    pub fn is_success(&self) -> bool {
        self.status().is_some_and(|s| (200..300).contains(&s))
    }

    /// Reliable provisional (RFC 3262): 1xx other than 100 carrying RSeq
    pub fn is_reliable_provisional(&self) -> bool {
        self.status().is_some_and(|s| (101..200).contains(&s)) && self.header("RSeq").is_some()
    }

    /// Serialises the message; Content-Length always matches the body
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256 + self.body.len());
        match &self.start {
            StartLine::Request { method, uri } => {
                out.put_slice(format!("{} {} SIP/2.0\r\n", method, uri).as_bytes());
            }
            StartLine::Response { status, reason } => {
                out.put_slice(format!("SIP/2.0 {} {}\r\n", status, reason).as_bytes());
            }
        }
        for header in &self.headers {
            if same_header(&header.name, "Content-Length") {
                continue;
            }
            out.put_slice(header.name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(header.value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.put_slice(&self.body);
        out.freeze()
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            StartLine::Request { method, uri } => write!(f, "{} {}", method, uri),
            StartLine::Response { status, reason } => write!(f, "{} {}", status, reason),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = code
            .parse::<u16>()
            .ok()
            .filter(|s| (100..700).contains(s))
            .ok_or_else(|| Error::InvalidMessage(format!("bad status line: {}", line)))?;
        return Ok(StartLine::Response {
            status,
            reason: reason.to_string(),
        });
    }
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some("SIP/2.0"), None) if !uri.is_empty() => {
            Ok(StartLine::Request {
                method: method.parse()?,
                uri: uri.to_string(),
            })
        }
        _ => Err(Error::InvalidMessage(format!("bad request line: {}", line))),
    }
}

pub fn default_reason(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "",
    }
}

/// New RFC 3261 branch
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, Uuid::new_v4().simple())
}

pub fn generate_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Response to `request` echoing Via, From, To, Call-ID and CSeq
pub fn create_response(request: &SipMessage, status: u16, reason: Option<&str>) -> SipMessage {
    let mut response = SipMessage::new_response(status, reason);
    for header in &request.headers {
        let name = full_name(&header.name);
        if ["Via", "From", "To", "Call-ID", "CSeq", "Record-Route"]
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
        {
            response.headers.push(header.clone());
        }
    }
    response
}

fn copy_dialog_headers(request: &SipMessage, out: &mut SipMessage, method: &Method) {
    if let Some(via) = request.header("Via").and_then(|v| v.split(',').next()) {
        out.push_header("Via", via.trim());
    }
    for route in request.header_values("Route") {
        out.push_header("Route", route);
    }
    out.push_header("Max-Forwards", "70");
    if let Some(from) = request.header("From") {
        out.push_header("From", from);
    }
    if let Some(call_id) = request.header("Call-ID") {
        out.push_header("Call-ID", call_id);
    }
    if let Some((number, _)) = request.cseq() {
        out.push_header("CSeq", format!("{} {}", number, method));
    }
}

/// Hop-by-hop ACK for a non-2xx final response to an INVITE
pub fn create_ack(request: &SipMessage, response: &SipMessage) -> SipMessage {
    let uri = request.request_uri().unwrap_or_default();
    let mut ack = SipMessage::new_request(Method::Ack, uri);
    copy_dialog_headers(request, &mut ack, &Method::Ack);
    if let Some(to) = response.header("To").or_else(|| request.header("To")) {
        ack.push_header("To", to);
    }
    ack
}

/// CANCEL for a pending request; shares the request's branch
pub fn create_cancel(request: &SipMessage) -> SipMessage {
    let uri = request.request_uri().unwrap_or_default();
    let mut cancel = SipMessage::new_request(Method::Cancel, uri);
    copy_dialog_headers(request, &mut cancel, &Method::Cancel);
    if let Some(to) = request.header("To") {
        cancel.push_header("To", to);
    }
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
        v: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds\r\n\
        Via: SIP/2.0/TCP proxy.example.com:5070;branch=z9hG4bKproxy\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.example.com>\r\n\
        From: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
        i: a84b4c76e66710@pc33.atlanta.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Subject: long\r\n line\r\n\
        Content-Length: 4\r\n\r\nv=0\nextra";

    #[test]
    fn parses_request_with_compact_headers() {
        let msg = SipMessage::parse(INVITE.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(&Method::Invite));
        assert_eq!(msg.request_uri_host(), Some("biloxi.example.com"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33.atlanta.example.com"));
        assert_eq!(msg.from_tag(), Some("1928301774"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.cseq(), Some((314159, Method::Invite)));
        assert_eq!(msg.header("Subject"), Some("long line"));
        assert_eq!(&msg.body()[..], b"v=0\n");

        let via = msg.top_via().unwrap();
        assert_eq!(via.transport, Transport::Udp);
        assert_eq!(via.host, "pc33.atlanta.example.com");
        assert_eq!(via.effective_port(), 5060);
        assert_eq!(via.branch.as_deref(), Some("z9hG4bK776asdhds"));
        assert!(via.is_rfc3261_branch());
    }

    #[test]
    fn parses_response_and_rejects_garbage() {
        let raw = b"SIP/2.0 180 Ringing\r\nCSeq: 2 INVITE\r\nTo: <sip:b@x>;tag=abc\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        assert_eq!(msg.status(), Some(180));
        assert!(msg.is_provisional());
        assert_eq!(msg.to_tag(), Some("abc"));
        assert_eq!(msg.transaction_method(), Some(Method::Invite));

        assert!(SipMessage::parse(b"SIP/2.0 99 Nope\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:x SIP/3.0\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"").is_err());
    }

    #[test]
    fn via_forms() {
        let v6 = Via::parse("SIP/2.0/TLS [2001:DB8::1]:5071;rport;branch=z9hG4bKx").unwrap();
        assert_eq!(v6.host, "[2001:db8::1]");
        assert_eq!(v6.port, Some(5071));
        assert_eq!(v6.branch.as_deref(), Some("z9hG4bKx"));

        let bare = Via::parse("SIP/2.0/TLS host.example.com").unwrap();
        assert_eq!(bare.effective_port(), 5061);
        assert_eq!(bare.branch, None);

        assert!(Via::parse("SIP/2.0/SCTP host").is_err());
    }

    #[test]
    fn response_echoes_transaction_headers() {
        let request = SipMessage::parse(INVITE.as_bytes()).unwrap();
        let mut response = create_response(&request, 486, None);
        response.set_to_tag("xyz");
        assert_eq!(response.reason(), Some("Busy Here"));
        assert_eq!(response.header_values("Via").count(), 2);
        assert_eq!(response.to_tag(), Some("xyz"));
        assert_eq!(response.header("Max-Forwards"), None);

        let reparsed = SipMessage::parse(&response.to_bytes()).unwrap();
        assert_eq!(reparsed.status(), Some(486));
        assert_eq!(reparsed.header("Content-Length"), Some("0"));
        assert_eq!(reparsed.cseq(), request.cseq());
    }

    #[test]
    fn ack_and_cancel_reuse_top_via() {
        let request = SipMessage::parse(INVITE.as_bytes()).unwrap();
        let mut response = create_response(&request, 404, None);
        response.set_to_tag("t1");

        let ack = create_ack(&request, &response);
        assert_eq!(ack.method(), Some(&Method::Ack));
        assert_eq!(ack.header_values("Via").count(), 1);
        assert_eq!(ack.top_via(), request.top_via());
        assert_eq!(ack.cseq(), Some((314159, Method::Ack)));
        assert_eq!(ack.to_tag(), Some("t1"));

        let cancel = create_cancel(&request);
        assert_eq!(cancel.cseq(), Some((314159, Method::Cancel)));
        assert_eq!(cancel.to_tag(), None);
        assert_eq!(cancel.request_uri(), request.request_uri());
    }
}
