//! Agent client for the Unix-socket administration API.
//!
//! The agent speaks plain HTTP/1.1 on its socket with the virtual host
//! `v1`. Requests here are stateless - connect, write one request with
//! `Connection: close`, read the response to EOF - so a blocking
//! `UnixStream` is all the transport needed.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Default per-request timeout.
const TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from talking to the agent.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The agent socket does not exist or refused the connection.
    #[error("agent is not running (socket {0})")]
    AgentNotRunning(PathBuf),

    /// I/O error during the exchange.
    #[error("agent socket: {0}")]
    Io(#[from] std::io::Error),

    /// The response did not parse as HTTP.
    #[error("malformed response from agent: {0}")]
    BadResponse(&'static str),
}

/// One parsed response.
#[derive(Debug)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// Pretty-prints the body as JSON when possible, raw otherwise.
    pub fn body_pretty(&self) -> String {
        match serde_json::from_slice::<serde_json::Value>(&self.body) {
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_default(),
            Err(_) => String::from_utf8_lossy(&self.body).into_owned(),
        }
    }
}

/// Client over the agent's Unix socket.
pub struct AgentClient {
    socket: PathBuf,
}

impl AgentClient {
    /// Creates a client for the given socket path.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Sends a GET.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub fn get(&self, path: &str) -> Result<Response, ClientError> {
        self.request("GET", path, None)
    }

    /// Sends a DELETE.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub fn delete(&self, path: &str) -> Result<Response, ClientError> {
        self.request("DELETE", path, None)
    }

    /// Sends a PATCH.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub fn patch(&self, path: &str) -> Result<Response, ClientError> {
        self.request("PATCH", path, None)
    }

    /// Sends a POST with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub fn post_json(&self, path: &str, body: &[u8]) -> Result<Response, ClientError> {
        self.request("POST", path, Some(body))
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, ClientError> {
        let mut stream = connect(&self.socket)?;
        stream.set_read_timeout(Some(TIMEOUT))?;
        stream.set_write_timeout(Some(TIMEOUT))?;

        let body = body.unwrap_or_default();
        let header = format!(
            "{method} {path} HTTP/1.1\r\n\
             Host: v1\r\n\
             Connection: close\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(header.as_bytes())?;
        stream.write_all(body)?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        parse_response(&raw)
    }
}

fn connect(socket: &Path) -> Result<UnixStream, ClientError> {
    UnixStream::connect(socket).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
            ClientError::AgentNotRunning(socket.to_path_buf())
        },
        _ => ClientError::Io(e),
    })
}

fn parse_response(raw: &[u8]) -> Result<Response, ClientError> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(ClientError::BadResponse("no header terminator"))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| ClientError::BadResponse("header is not utf-8"))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or(ClientError::BadResponse("empty header"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(ClientError::BadResponse("bad status line"))?;

    let body = &raw[header_end + 4..];
    // With `Connection: close` the body runs to EOF; honor an explicit
    // content-length when present in case of trailing bytes.
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());
    let body = match content_length {
        Some(len) if len <= body.len() => body[..len].to_vec(),
        _ => body.to_vec(),
    };

    Ok(Response { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_json_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n[\"a\",\"b\",\"c\"]";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"[\"a\",\"b\",\"c\"]");
        assert_eq!(response.body_pretty(), "[\n  \"a\",\n  \"b\",\n  \"c\"\n]");
    }

    #[test]
    fn parses_an_empty_status_only_response() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 404);
        assert!(response.body.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_response(b"not http at all"),
            Err(ClientError::BadResponse(_))
        ));
    }

    #[test]
    fn missing_socket_reports_agent_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let client = AgentClient::new(dir.path().join("missing.sock"));
        assert!(matches!(
            client.get("/update"),
            Err(ClientError::AgentNotRunning(_))
        ));
    }
}
