/**
 * protocol/mod.rs
 *
 * Wire protocol with the location servers: message set, opcodes and
 * result codes. Payloads are serde-encoded; the frame layout around
 * them lives in the channel module.
 */

mod crypto;

pub use crypto::{
    decrypt_nonce, decrypt_payload, derive_session_key, encrypt_nonce, encrypt_payload,
    password_hash, CryptoError, HashKind, SessionKey, SALT_SIZE,
};

use serde::{Deserialize, Serialize};

/// Protocol version sent with every auth request.
pub const PROTOCOL_VERSION: u8 = 1;

/// Result code: accepted.
pub const RESULT_OK: u8 = 0;

/// Result code: credentials or pairing proof rejected.
pub const RESULT_DENIED: u8 = 1;

/// Who a message claims to originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// The platform service (this crate).
    Platform,
    /// A paired application client.
    App,
}

impl ClientRole {
    pub fn as_u8(self) -> u8 {
        match self {
            ClientRole::Platform => 0,
            ClientRole::App => 1,
        }
    }
}

/// Message opcodes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    AuthRequest = 1,
    AuthChallenge = 2,
    AuthProof = 3,
    AuthResult = 4,
    ChannelRequest = 5,
    ChannelResponse = 6,
    PairRequest = 7,
    PairChallenge = 8,
    PairProof = 9,
    PairResult = 10,
    LocationUpdate = 11,
    PartnerClosed = 12,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Opcode::AuthRequest),
            2 => Some(Opcode::AuthChallenge),
            3 => Some(Opcode::AuthProof),
            4 => Some(Opcode::AuthResult),
            5 => Some(Opcode::ChannelRequest),
            6 => Some(Opcode::ChannelResponse),
            7 => Some(Opcode::PairRequest),
            8 => Some(Opcode::PairChallenge),
            9 => Some(Opcode::PairProof),
            10 => Some(Opcode::PairResult),
            11 => Some(Opcode::LocationUpdate),
            12 => Some(Opcode::PartnerClosed),
            _ => None,
        }
    }
}

/// Protocol message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetMessage {
    /// Client -> server: request authentication for an account.
    AuthRequest {
        mail: String,
        device_key: String,
        role: u8,
        version: u8,
    },
    /// Server -> client: password challenge.
    AuthChallenge {
        salt: [u8; SALT_SIZE],
        nonce: u32,
        hash_kind: u8,
    },
    /// Client -> server: the challenge nonce encrypted with the salted
    /// password hash.
    AuthProof { proof: Vec<u8> },
    /// Server -> client: authentication outcome.
    AuthResult { result: u8 },
    /// Client -> server: resolve a communication channel by name.
    ChannelRequest { channel: String },
    /// Server -> client: resolved communication server endpoint.
    ChannelResponse {
        channel: String,
        address: String,
        port: u16,
    },
    /// App client -> platform: ask to pair with this device.
    PairRequest { role: u8 },
    /// Platform -> app client: pairing nonce to prove against.
    PairChallenge { role: u8, nonce: u32 },
    /// App client -> platform: device key plus the challenge nonce
    /// encrypted with the device password key.
    PairProof { device_key: String, proof: Vec<u8> },
    /// Platform -> app client: pairing outcome.
    PairResult { result: u8 },
    /// App client -> platform: a location fix.
    LocationUpdate {
        latitude: f64,
        longitude: f64,
        elevation: f64,
        facing: f64,
        timestamp_ms: u64,
    },
    /// Server -> client: the paired partner went away.
    PartnerClosed,
}

impl NetMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            NetMessage::AuthRequest { .. } => Opcode::AuthRequest,
            NetMessage::AuthChallenge { .. } => Opcode::AuthChallenge,
            NetMessage::AuthProof { .. } => Opcode::AuthProof,
            NetMessage::AuthResult { .. } => Opcode::AuthResult,
            NetMessage::ChannelRequest { .. } => Opcode::ChannelRequest,
            NetMessage::ChannelResponse { .. } => Opcode::ChannelResponse,
            NetMessage::PairRequest { .. } => Opcode::PairRequest,
            NetMessage::PairChallenge { .. } => Opcode::PairChallenge,
            NetMessage::PairProof { .. } => Opcode::PairProof,
            NetMessage::PairResult { .. } => Opcode::PairResult,
            NetMessage::LocationUpdate { .. } => Opcode::LocationUpdate,
            NetMessage::PartnerClosed => Opcode::PartnerClosed,
        }
    }
}
