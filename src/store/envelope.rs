//! Envelope derivation — canonical hashing of per-email metadata.
//!
//! The envelope hash covers a canonicalized header tuple (message-id, from,
//! recipients, subject, date), newline-separated with comma-joined address
//! lists, so two deliveries of the same message hash identically regardless
//! of transport framing.  The content hash covers the raw bytes exactly.

use crate::content::Envelope;
use crate::crypto::sha256;

/// SHA-256 over the raw email bytes.
pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    sha256(&[bytes])
}

/// SHA-256 over the canonicalized header tuple.
pub fn envelope_hash(e: &Envelope) -> [u8; 32] {
    let to = e.to.join(",");
    let cc = e.cc.join(",");
    let date = e.date.to_string();
    sha256(&[
        e.message_id.as_bytes(),
        b"\n",
        e.from.as_bytes(),
        b"\n",
        to.as_bytes(),
        b"\n",
        cc.as_bytes(),
        b"\n",
        e.subject.as_bytes(),
        b"\n",
        date.as_bytes(),
    ])
}

/// Fill the derived fields of a caller-supplied envelope: size and both
/// hashes.  The header fields themselves come from the external MIME parser.
pub fn seal_envelope(mut e: Envelope, bytes: &[u8]) -> Envelope {
    e.size = bytes.len() as i64;
    e.content_hash = content_hash(bytes).to_vec();
    e.envelope_hash = envelope_hash(&e).to_vec();
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            message_id: "m1@example.com".into(),
            from: "alice@example.com".into(),
            to: vec!["bob@example.com".into(), "carol@example.com".into()],
            cc: vec![],
            subject: "hello".into(),
            date: 1_700_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn envelope_hash_is_header_sensitive() {
        let a = envelope_hash(&sample());
        let mut changed = sample();
        changed.subject = "hello!".into();
        assert_ne!(a, envelope_hash(&changed));
        // Same headers, same hash — body plays no part.
        assert_eq!(a, envelope_hash(&sample()));
    }

    #[test]
    fn seal_fills_derived_fields() {
        let e = seal_envelope(sample(), b"raw email bytes");
        assert_eq!(e.size, 15);
        assert_eq!(e.content_hash, content_hash(b"raw email bytes").to_vec());
        assert_eq!(e.envelope_hash.len(), 32);
    }
}
