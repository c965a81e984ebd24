//! Relay frame codec.
//!
//! Wire layout: `len: u32 LE | rmp payload | crc32: u32 LE`.

use crate::error::{BrokerError, Result};
use crate::types::{Document, NodeId};
use serde::{Deserialize, Serialize};

const HEADER_LEN: usize = 4;
const CHECKSUM_LEN: usize = 4;

/// Frames larger than this are treated as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One publish forwarded between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Node that accepted the publish.
    pub origin: NodeId,
    /// Instance of the origin node; changes when the node restarts.
    pub incarnation: u64,
    /// Per-incarnation counter, used for duplicate suppression.
    pub sequence: u64,
    pub channel: String,
    pub message: Document,
}

pub fn encode_frame(frame: &RelayFrame) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(frame)?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(BrokerError::Serialization(format!(
            "relay frame of {} bytes exceeds limit",
            encoded.len()
        )));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + encoded.len() + CHECKSUM_LEN);
    out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    out.extend_from_slice(&encoded);
    out.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(out)
}

pub fn decode_frame(bytes: &[u8]) -> Result<RelayFrame> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(BrokerError::Corruption("relay frame truncated".into()));
    }
    let mut len_bytes = [0u8; HEADER_LEN];
    len_bytes.copy_from_slice(&bytes[..HEADER_LEN]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(BrokerError::Corruption("relay frame too large".into()));
    }
    if bytes.len() != HEADER_LEN + len + CHECKSUM_LEN {
        return Err(BrokerError::Corruption(format!(
            "relay frame length mismatch: header says {len}, got {}",
            bytes.len() - HEADER_LEN - CHECKSUM_LEN
        )));
    }

    let encoded = &bytes[HEADER_LEN..HEADER_LEN + len];
    let mut checksum_bytes = [0u8; CHECKSUM_LEN];
    checksum_bytes.copy_from_slice(&bytes[HEADER_LEN + len..]);
    if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(encoded) {
        return Err(BrokerError::Corruption("relay frame checksum mismatch".into()));
    }

    Ok(rmp_serde::from_slice(encoded)?)
}
