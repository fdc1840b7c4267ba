//! Tor onion-service publication (SPEC_FULL.md §6, §9a): a hand-rolled
//! control-port client.
//!
//! No crate in the pack wraps Tor's control protocol (`agora-org-agora`
//! uses it only at the SPI level, same as here). Implemented directly
//! against the documented control-port text protocol over a plain TCP
//! socket: `AUTHENTICATE`, then `ADD_ONION`, matching the wire format in
//! Tor's `control-spec.txt` §3.1/§3.27.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnionVersion {
    V2,
    V3,
}

impl OnionVersion {
    fn key_type(self) -> &'static str {
        match self {
            OnionVersion::V2 => "RSA1024",
            OnionVersion::V3 => "ED25519-V3",
        }
    }
}

pub struct AddOnionRequest {
    pub version: OnionVersion,
    pub virtual_port: u16,
    pub target_port: u16,
}

#[derive(Debug, Error)]
pub enum TorError {
    #[error("control port unreachable: {0}")]
    Unreachable(String),
    #[error("control port rejected the command: {0}")]
    Rejected(String),
    #[error("unexpected control port response: {0}")]
    Protocol(String),
}

/// External collaborator contract: publish an onion service pointing
/// back at this process's listener.
#[async_trait]
pub trait TorController: Send + Sync {
    async fn add_onion(&self, req: AddOnionRequest) -> Result<String, TorError>;
}

pub struct ControlPortClient {
    control_addr: String,
}

impl ControlPortClient {
    pub fn new(control_addr: String) -> Self {
        Self { control_addr }
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>, TorError> {
        let stream = TcpStream::connect(&self.control_addr)
            .await
            .map_err(|e| TorError::Unreachable(e.to_string()))?;
        Ok(BufReader::new(stream))
    }

    async fn send_command(
        conn: &mut BufReader<TcpStream>,
        command: &str,
    ) -> Result<String, TorError> {
        debug!(command, "sending tor control command");
        conn.get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .map_err(|e| TorError::Unreachable(e.to_string()))?;

        let mut line = String::new();
        let mut reply = String::new();
        loop {
            line.clear();
            let n = conn
                .read_line(&mut line)
                .await
                .map_err(|e| TorError::Unreachable(e.to_string()))?;
            if n == 0 {
                return Err(TorError::Protocol("connection closed mid-reply".to_string()));
            }
            let is_final = line.as_bytes().get(3) == Some(&b' ');
            reply.push_str(&line);
            if is_final {
                break;
            }
        }

        if reply.starts_with("250") {
            Ok(reply)
        } else {
            Err(TorError::Rejected(reply.trim().to_string()))
        }
    }
}

#[async_trait]
impl TorController for ControlPortClient {
    async fn add_onion(&self, req: AddOnionRequest) -> Result<String, TorError> {
        let mut conn = self.connect().await?;

        // Null authentication: the control port is expected to be
        // reachable only from the loopback interface with
        // `CookieAuthentication 0` (or an externally supplied cookie);
        // this implementation speaks the simplest accepted handshake.
        Self::send_command(&mut conn, "AUTHENTICATE").await?;

        let command = format!(
            "ADD_ONION NEW:{} Port={},{}",
            req.version.key_type(),
            req.virtual_port,
            req.target_port
        );
        let reply = Self::send_command(&mut conn, &command).await?;

        let address = reply
            .lines()
            .find_map(|line| line.strip_prefix("250-ServiceID="))
            .ok_or_else(|| TorError::Protocol("no ServiceID in ADD_ONION reply".to_string()))?;

        let onion_address = format!("{address}.onion");
        info!(onion_address = %onion_address, "published onion service");
        Ok(onion_address)
    }
}
