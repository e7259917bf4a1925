//! # Chain Data Transfer Objects
//!
//! What the ledger client hands back (headers, `ProcessRan` events, token
//! contents) and what the submission side hands to it (signed extrinsics).
//! The ledger's own encoding stays behind the client; these are the shapes
//! the core depends on.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::entities::ProcessedBlock;
use crate::errors::HashParseError;

/// A 32-byte block or call hash.
pub type Hash = [u8; 32];

/// Numeric on-chain token identifier.
pub type TokenId = u64;

/// Chain account address (hex-encoded public key).
pub type Address = String;

/// A 64-byte ed25519 signature.
pub type Signature = [u8; 64];

/// Lowercase hex rendering of a hash, used in logs and the REST layer.
pub fn hash_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Parse a (optionally `0x`-prefixed) hex hash.
pub fn parse_hash(s: &str) -> Result<Hash, HashParseError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| HashParseError::WrongLength(len))
}

/// SHA-256 over `data`.
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Finalised block header as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: Hash,
    pub parent: Hash,
    pub height: u64,
}

impl From<BlockHeader> for ProcessedBlock {
    fn from(header: BlockHeader) -> Self {
        ProcessedBlock {
            hash: header.hash,
            parent: header.parent,
            height: header.height,
        }
    }
}

/// Name and version of an on-chain process definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub id: String,
    pub version: u32,
}

impl ProcessId {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

/// A `ProcessRan` event: one process execution inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRanEvent {
    /// Hash of the extrinsic that ran the process.
    pub call_hash: Hash,
    pub block_hash: Hash,
    pub sender: Address,
    pub process: ProcessId,
    /// Burnt token ids, positional.
    pub inputs: Vec<TokenId>,
    /// Minted token ids, positional.
    pub outputs: Vec<TokenId>,
}

/// Full content of a token at a given block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenContent {
    pub id: TokenId,
    pub roles: BTreeMap<String, Address>,
    pub metadata: BTreeMap<String, String>,
}

/// Roles and metadata of a token to be minted by a process run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputToken {
    pub roles: BTreeMap<String, Address>,
    pub metadata: BTreeMap<String, String>,
}

impl OutputToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: &str, address: impl Into<Address>) -> Self {
        self.roles.insert(role.to_string(), address.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The `run_process` call: burn `inputs`, mint `outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProcessCall {
    pub process: ProcessId,
    pub inputs: Vec<TokenId>,
    pub outputs: Vec<OutputToken>,
}

/// A signed `run_process` extrinsic ready for submission.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedExtrinsic {
    pub call: RunProcessCall,
    pub signer: Address,
    pub nonce: u64,
    #[serde_as(as = "Bytes")]
    pub signature: Signature,
    /// Call hash; the idempotency key of the resulting `ProcessRan` event.
    pub hash: Hash,
}
