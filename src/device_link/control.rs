//! Line-oriented request/response transport to the rigctld control daemon.
//!
//! The daemon answers one request at a time, so the transport is used by
//! exactly one owner (the command scheduler worker). The TCP connection is
//! opened lazily and dropped on any error; the next request reconnects.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::LinkError;

/// rigctld's success reply prefix.
pub const RPRT_OK: &str = "RPRT 0";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// host:port of rigctld
    pub address: String,
    pub response_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4532".to_string(),
            response_timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
pub trait ControlTransport: Send {
    /// Send one request line and read up to `lines` response lines. An
    /// `RPRT` line ends the response early.
    async fn request(&mut self, line: &str, lines: usize) -> Result<Vec<String>, LinkError>;
}

pub struct RigctlTransport {
    config: ControlConfig,
    stream: Option<BufReader<TcpStream>>,
}

impl RigctlTransport {
    pub fn new(config: ControlConfig) -> Self {
        Self { config, stream: None }
    }

    async fn exchange(&mut self, line: &str, lines: usize) -> Result<Vec<String>, LinkError> {
        if self.stream.is_none() {
            log::info!("Connecting to rigctld at {}...", self.config.address);
            let stream = TcpStream::connect(&self.config.address).await?;
            stream.set_nodelay(true)?;
            self.stream = Some(BufReader::new(stream));
            log::info!("Connected to rigctld at {}", self.config.address);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::Closed);
        };

        let mut request = line.to_string();
        request.push('\n');
        stream.get_mut().write_all(request.as_bytes()).await?;

        let mut response = Vec::with_capacity(lines);
        while response.len() < lines.max(1) {
            let mut buf = String::new();
            if stream.read_line(&mut buf).await? == 0 {
                return Err(LinkError::Closed);
            }
            let reply = buf.trim().to_string();
            let done = reply.starts_with("RPRT");
            response.push(reply);
            if done {
                break;
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl ControlTransport for RigctlTransport {
    async fn request(&mut self, line: &str, lines: usize) -> Result<Vec<String>, LinkError> {
        let limit = self.config.response_timeout;
        let result = match timeout(limit, self.exchange(line, lines)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(limit)),
        };

        match &result {
            Ok(response) => log::debug!("rigctld: sent {:?}, received {:?}", line, response),
            Err(e) => {
                // A late reply would desynchronize the next request.
                log::warn!("rigctld request {:?} failed: {}", line, e);
                self.stream = None;
            }
        }
        result
    }
}
