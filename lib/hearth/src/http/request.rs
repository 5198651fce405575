use std::net::SocketAddr;
use std::path::PathBuf;

/// Multi-valued header collection. Names arrive already lowercased from
/// the parser, so lookups fold the query side only.
pub struct HeaderMap {
    entries: Vec<(String, Vec<u8>)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, name: String, value: Vec<u8>) {
        self.entries.push((name, value));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a [u8]> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(key, _)| *key == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A parsed request handed through the container pipeline. The body has
/// already been pulled through the input filter chain.
pub struct Request {
    pub method: String,
    pub uri: String,
    pub query: String,
    pub protocol: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: String::new(),
            uri: String::new(),
            query: String::new(),
            protocol: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            remote_addr: None,
        }
    }

    /// Clears everything for reuse by the next request on the connection.
    pub fn recycle(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.query.clear();
        self.protocol.clear();
        self.headers.clear();
        self.body.clear();
    }

    /// Host header with any port stripped; empty when absent (HTTP/1.0).
    pub fn server_name(&self) -> &str {
        match self.headers.get_str("host") {
            Some(host) => match host.rfind(':') {
                Some(colon) if host[colon + 1..].bytes().all(|b| b.is_ascii_digit()) => {
                    &host[..colon]
                }
                _ => host,
            },
            None => "",
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get_str("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_str("transfer-encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Keep-alive per protocol default and Connection header.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.headers.get_str("connection").unwrap_or("");
        let close = connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("close"));

        if close {
            return false;
        }

        match self.protocol.as_str() {
            "HTTP/1.1" => true,
            "HTTP/1.0" => connection
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("keep-alive")),
            // HTTP/0.9 and unknown protocols never keep the connection.
            _ => false,
        }
    }
}

/// Error surfaced to valves that violate the response state machine.
#[derive(Debug, Eq, PartialEq)]
pub enum HttpError {
    /// The response was already committed to the wire.
    IllegalState,
}

/// A send-file intent declared by a request handler and forwarded to the
/// poller's zero-copy path.
pub struct SendfilePlan {
    pub path: PathBuf,
    pub pos: u64,
    pub length: u64,
}

pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    committed: bool,
    sendfile: Option<SendfilePlan>,
}

impl Response {
    pub fn new() -> Response {
        Response {
            status: 200,
            headers: HeaderMap::new(),
            body: Vec::new(),
            committed: false,
            sendfile: None,
        }
    }

    pub fn recycle(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.committed = false;
        self.sendfile = None;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), HttpError> {
        if self.committed {
            return Err(HttpError::IllegalState);
        }
        self.status = status;
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        if self.committed {
            return Err(HttpError::IllegalState);
        }
        self.headers.add(name.to_ascii_lowercase(), value.as_bytes().to_vec());
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if self.committed {
            return Err(HttpError::IllegalState);
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Declares a zero-copy file transfer for the response body. The
    /// keep-alive disposition is decided by the processor.
    pub fn send_file(&mut self, path: PathBuf, pos: u64, length: u64) -> Result<(), HttpError> {
        if self.committed {
            return Err(HttpError::IllegalState);
        }
        self.sendfile = Some(SendfilePlan { path, pos, length });
        Ok(())
    }

    pub fn sendfile_plan(&self) -> Option<&SendfilePlan> {
        self.sendfile.as_ref()
    }

    pub fn take_sendfile_plan(&mut self) -> Option<SendfilePlan> {
        self.sendfile.take()
    }

    /// Marks the head of the response as on the wire.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

/// Reason phrases for the statuses the core produces itself.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.add("host".to_string(), b"example:8080".to_vec());

        assert_eq!(headers.get("Host"), Some(&b"example:8080"[..]));
        assert_eq!(headers.get_str("HOST"), Some("example:8080"));
        assert!(!headers.contains("cookie"));
    }

    #[test]
    fn test_server_name_strips_port() {
        let mut request = Request::new();
        request
            .headers
            .add("host".to_string(), b"example.com:8080".to_vec());

        assert_eq!(request.server_name(), "example.com");
    }

    #[test]
    fn test_keep_alive_defaults() {
        let mut request = Request::new();
        request.protocol = "HTTP/1.1".to_string();
        assert!(request.wants_keep_alive());

        request.protocol = "HTTP/1.0".to_string();
        assert!(!request.wants_keep_alive());

        request
            .headers
            .add("connection".to_string(), b"keep-alive".to_vec());
        assert!(request.wants_keep_alive());

        request.protocol = String::new();
        assert!(!request.wants_keep_alive());
    }

    #[test]
    fn test_keep_alive_close_wins() {
        let mut request = Request::new();
        request.protocol = "HTTP/1.1".to_string();
        request
            .headers
            .add("connection".to_string(), b"close".to_vec());

        assert!(!request.wants_keep_alive());
    }

    #[test]
    fn test_response_commit_guards() {
        let mut response = Response::new();
        response.set_status(404).unwrap();
        response.write(b"gone").unwrap();

        response.commit();

        assert_eq!(response.set_status(200), Err(HttpError::IllegalState));
        assert_eq!(response.write(b"more"), Err(HttpError::IllegalState));
        assert_eq!(response.status(), 404);
        assert_eq!(response.body(), b"gone");
    }

    #[test]
    fn test_chunked_detection() {
        let mut request = Request::new();
        request
            .headers
            .add("transfer-encoding".to_string(), b"gzip, Chunked".to_vec());

        assert!(request.is_chunked());
    }
}
