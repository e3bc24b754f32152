/**
 * channel/mod.rs
 *
 * Transport channel to one network peer: connect, send, non-blocking
 * receive poll, disconnect. Framing and payload decryption live here;
 * all retry policy lives in the session machine.
 */

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::{self, NetMessage, Opcode, SessionKey};

/// Frame flag: payload is AES-GCM encrypted with the session key.
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Frame header: opcode, flags, payload length (big endian).
const HEADER_SIZE: usize = 6;

/// Upper bound on a single payload; nothing in the protocol comes
/// close, so anything larger is a corrupt stream.
const MAX_PAYLOAD: usize = 64 * 1024;

/// Channel errors
#[derive(Debug)]
pub enum ChannelError {
    ConnectFailed(String),
    NotConnected,
    SendFailed(String),
    /// Frame or payload could not be decoded; the stream itself is
    /// still usable.
    Decode(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::ConnectFailed(e) => write!(f, "Connect failed: {}", e),
            ChannelError::NotConnected => write!(f, "Not connected"),
            ChannelError::SendFailed(e) => write!(f, "Send failed: {}", e),
            ChannelError::Decode(e) => write!(f, "Decode failed: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Connection to one network peer.
///
/// `recv` is a poll: it never blocks, and `Ok(None)` means no complete
/// message is queued. The optional key decrypts frames carrying the
/// encrypted flag.
#[async_trait]
pub trait Channel: Send {
    async fn connect(
        &mut self,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ChannelError>;

    async fn disconnect(&mut self, timeout: Duration);

    fn is_connected(&self) -> bool;

    async fn send(&mut self, message: &NetMessage) -> Result<(), ChannelError>;

    fn recv(&mut self, key: Option<&SessionKey>) -> Result<Option<NetMessage>, ChannelError>;
}

/// Encode one message into a wire frame. A key encrypts the payload
/// and sets the encrypted flag.
pub fn encode_frame(
    message: &NetMessage,
    key: Option<&SessionKey>,
) -> Result<Vec<u8>, ChannelError> {
    let payload =
        serde_json::to_vec(message).map_err(|e| ChannelError::Decode(e.to_string()))?;

    let (payload, flags) = match key {
        Some(key) => {
            let blob = protocol::encrypt_payload(&payload, key)
                .map_err(|e| ChannelError::Decode(e.to_string()))?;
            (blob, FLAG_ENCRYPTED)
        }
        None => (payload, 0),
    };

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.push(message.opcode() as u8);
    frame.push(flags);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one complete frame from the front of `buffer`, draining the
/// consumed bytes. `Ok(None)` means the frame is still incomplete.
pub fn decode_frame(
    buffer: &mut Vec<u8>,
    key: Option<&SessionKey>,
) -> Result<Option<NetMessage>, ChannelError> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }

    let opcode_byte = buffer[0];
    let flags = buffer[1];
    let length = u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]) as usize;

    if length > MAX_PAYLOAD {
        buffer.clear();
        return Err(ChannelError::Decode(format!(
            "Oversized payload: {} bytes",
            length
        )));
    }

    if buffer.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    let payload: Vec<u8> = buffer[HEADER_SIZE..HEADER_SIZE + length].to_vec();
    buffer.drain(..HEADER_SIZE + length);

    let opcode = Opcode::from_u8(opcode_byte)
        .ok_or_else(|| ChannelError::Decode(format!("Unknown opcode: {}", opcode_byte)))?;

    let payload = if flags & FLAG_ENCRYPTED != 0 {
        let key = key.ok_or_else(|| {
            ChannelError::Decode("Encrypted frame but no session key".to_string())
        })?;
        protocol::decrypt_payload(&payload, key)
            .map_err(|e| ChannelError::Decode(e.to_string()))?
    } else {
        payload
    };

    let message: NetMessage =
        serde_json::from_slice(&payload).map_err(|e| ChannelError::Decode(e.to_string()))?;

    if message.opcode() != opcode {
        return Err(ChannelError::Decode(format!(
            "Opcode {:?} does not match payload {:?}",
            opcode,
            message.opcode()
        )));
    }

    Ok(Some(message))
}

/// TCP channel
///
/// Framed messages over a plain TCP stream. Partial reads accumulate
/// in an internal buffer until a full frame is available.
pub struct TcpChannel {
    stream: Option<TcpStream>,
    read_buffer: Vec<u8>,
}

impl TcpChannel {
    pub fn new() -> Self {
        Self {
            stream: None,
            read_buffer: Vec::new(),
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.read_buffer.clear();
    }
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn connect(
        &mut self,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.drop_stream();

        let stream = tokio::time::timeout(timeout, TcpStream::connect((address, port)))
            .await
            .map_err(|_| ChannelError::ConnectFailed("Timeout".to_string()))?
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self, timeout: Duration) {
        if let Some(mut stream) = self.stream.take() {
            let _ = tokio::time::timeout(timeout, stream.shutdown()).await;
        }
        self.read_buffer.clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, message: &NetMessage) -> Result<(), ChannelError> {
        let frame = encode_frame(message, None)?;

        let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;

        if let Err(e) = stream.write_all(&frame).await {
            self.drop_stream();
            return Err(ChannelError::SendFailed(e.to_string()));
        }

        Ok(())
    }

    fn recv(&mut self, key: Option<&SessionKey>) -> Result<Option<NetMessage>, ChannelError> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(None),
        };

        // Pull whatever the socket has queued into the frame buffer.
        let mut chunk = [0u8; 4096];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!("Peer closed the connection");
                    self.drop_stream();
                    return Ok(None);
                }
                Ok(read) => {
                    self.read_buffer.extend_from_slice(&chunk[..read]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Socket read failed: {}", e);
                    self.drop_stream();
                    return Ok(None);
                }
            }
        }

        decode_frame(&mut self.read_buffer, key)
    }
}
