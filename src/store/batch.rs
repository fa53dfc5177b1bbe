//! Email-batch payload layout (raw-bytes encoding).
//!
//! ```text
//! count:u32
//! repeated:
//!   entry header (16 bytes):
//!     offset:u32    absolute offset of the email bytes within the payload
//!     length:u32
//!     flags:u32
//!     local_id:i32  0-based insertion index
//!   email bytes (length bytes, immediately after the header)
//! ```
//!
//! All fields little-endian.  The whole payload may then be compressed and
//! encrypted as one unit by the codec pipeline; this layout describes the
//! plaintext.

use crate::crypto::sha256;
use crate::error::{Error, Result};

/// Per-entry framing overhead inside a batch payload.
pub const ENTRY_HEADER_LEN: usize = 16;

/// Count prefix length.
pub const BATCH_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub local_id: i32,
    pub flags: u32,
    pub bytes: Vec<u8>,
}

/// Payload size the given email sizes will occupy.
pub fn payload_size(email_sizes: impl Iterator<Item = usize>) -> usize {
    BATCH_PREFIX_LEN + email_sizes.map(|s| ENTRY_HEADER_LEN + s).sum::<usize>()
}

/// Serialize emails in local-id order.
pub fn encode_batch(emails: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let total = payload_size(emails.iter().map(|(_, b)| b.len()));
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(emails.len() as u32).to_le_bytes());
    for (local_id, (flags, bytes)) in emails.iter().enumerate() {
        let offset = (out.len() + ENTRY_HEADER_LEN) as u32;
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(local_id as i32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Parse a plaintext batch payload back into entries.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<BatchEntry>> {
    let malformed = |detail: String| Error::Internal(format!("malformed batch payload: {detail}"));

    if payload.len() < BATCH_PREFIX_LEN {
        return Err(malformed("missing count prefix".into()));
    }
    let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = BATCH_PREFIX_LEN;

    for i in 0..count {
        if payload.len() < pos + ENTRY_HEADER_LEN {
            return Err(malformed(format!("entry {i} header overruns payload")));
        }
        let offset = u32::from_le_bytes(payload[pos..pos + 4].try_into().unwrap()) as usize;
        let length = u32::from_le_bytes(payload[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let flags = u32::from_le_bytes(payload[pos + 8..pos + 12].try_into().unwrap());
        let local_id = i32::from_le_bytes(payload[pos + 12..pos + 16].try_into().unwrap());
        if local_id != i as i32 {
            return Err(malformed(format!("entry {i} carries local id {local_id}")));
        }
        if offset != pos + ENTRY_HEADER_LEN || payload.len() < offset + length {
            return Err(malformed(format!("entry {i} bytes overrun payload")));
        }
        entries.push(BatchEntry {
            local_id,
            flags,
            bytes: payload[offset..offset + length].to_vec(),
        });
        pos = offset + length;
    }
    Ok(entries)
}

/// SHA-256 of each email in local-id order — the batch's Merkle hash list.
pub fn entry_hashes<'a>(emails: impl Iterator<Item = &'a [u8]>) -> Vec<[u8; 32]> {
    emails.map(|b| sha256(&[b])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order_and_bytes() {
        let emails = vec![
            (0u32, b"first email".to_vec()),
            (0, b"second, a bit longer".to_vec()),
            (4, Vec::new()),
        ];
        let payload = encode_batch(&emails);
        assert_eq!(payload.len(), payload_size(emails.iter().map(|(_, b)| b.len())));

        let entries = decode_batch(&payload).unwrap();
        assert_eq!(entries.len(), 3);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.local_id, i as i32);
            assert_eq!(e.bytes, emails[i].1);
            assert_eq!(e.flags, emails[i].0);
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = encode_batch(&[(0, b"hello".to_vec())]);
        assert!(decode_batch(&payload[..payload.len() - 2]).is_err());
    }
}
