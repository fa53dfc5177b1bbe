//! Shared helpers for the integration tests.

use emaildb::{CompressionAlgorithm, EmailDbConfig, Envelope};

/// Small-threshold config so tests seal batches quickly.
pub fn small_config(block_size_bytes: usize) -> EmailDbConfig {
    EmailDbConfig {
        block_size_bytes,
        compression: CompressionAlgorithm::None,
        ..EmailDbConfig::default()
    }
}

/// A deterministic envelope for email number `n`.
pub fn envelope(n: usize, folder: &str) -> Envelope {
    Envelope {
        message_id: format!("msg-{n}@example.com"),
        from: format!("sender{n}@example.com"),
        to: vec!["archive@example.com".to_string()],
        cc: vec![],
        subject: format!("test message number {n}"),
        date: 1_700_000_000 + n as i64,
        folder_path: folder.to_string(),
        ..Default::default()
    }
}

/// Email bytes of exactly `size` bytes, distinct per `n`.
pub fn email_bytes(n: usize, size: usize) -> Vec<u8> {
    let mut bytes = format!("From: sender{n}@example.com\r\nSubject: test message number {n}\r\n\r\n")
        .into_bytes();
    while bytes.len() < size {
        bytes.push(b'a' + (n % 26) as u8);
    }
    bytes.truncate(size);
    bytes
}
