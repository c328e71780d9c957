//! Running content checksums
//!
//! The whole-object MD5 is accumulated across every byte written. When a
//! write is split into fragments, each fragment boundary also closes a
//! per-fragment MD5, and the ETag becomes the multipart form
//! `md5(concat(fragment digests))-N` a client would get from a true multipart
//! upload of the same parts.

use crate::error::{GatewayError, Result};
use base64::{engine::general_purpose, Engine as _};
use md5::{Digest, Md5};

/// Final checksums of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChecksums {
    /// Hex MD5 of the whole content
    pub md5_hex: String,
    /// Hex MD5 of each fragment, in order
    pub fragment_md5s: Vec<String>,
    /// Plain MD5 for one fragment, multipart form otherwise
    pub etag: String,
}

/// Incremental hasher tracking whole-object and per-fragment digests
#[derive(Clone, Default)]
pub struct ContentHasher {
    whole: Md5,
    fragment: Md5,
    fragment_bytes: u64,
    closed: Vec<[u8; 16]>,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.whole.update(data);
        self.fragment.update(data);
        self.fragment_bytes += data.len() as u64;
    }

    /// Close the current fragment's digest and start a new one
    pub fn close_fragment(&mut self) -> String {
        let digest: [u8; 16] = std::mem::take(&mut self.fragment).finalize().into();
        self.fragment_bytes = 0;
        self.closed.push(digest);
        hex::encode(digest)
    }

    /// Fragments closed so far
    pub fn fragments_closed(&self) -> usize {
        self.closed.len()
    }

    /// Finalize, closing the open fragment if it received data or none was closed yet
    pub fn finish(mut self) -> ContentChecksums {
        if self.fragment_bytes > 0 || self.closed.is_empty() {
            self.close_fragment();
        }
        let md5_hex = hex::encode(self.whole.finalize());
        let fragment_md5s: Vec<String> = self.closed.iter().map(hex::encode).collect();

        let etag = if self.closed.len() > 1 {
            multipart_etag(&self.closed)
        } else {
            md5_hex.clone()
        };

        ContentChecksums {
            md5_hex,
            fragment_md5s,
            etag,
        }
    }
}

/// `md5(concat(part digests))-N`
pub fn multipart_etag(parts: &[[u8; 16]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
}

/// Hex MD5 of a buffer
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Decode a Content-MD5 header value (base64 of the raw digest) to hex
pub fn content_md5_to_hex(header: &str) -> Result<String> {
    let raw = general_purpose::STANDARD
        .decode(header.trim())
        .map_err(|e| GatewayError::InvalidArgument(format!("bad Content-MD5: {}", e)))?;
    if raw.len() != 16 {
        return Err(GatewayError::InvalidArgument(format!(
            "Content-MD5 must decode to 16 bytes, got {}",
            raw.len()
        )));
    }
    Ok(hex::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fragment_etag_is_plain_md5() {
        let mut h = ContentHasher::new();
        h.update(b"hello ");
        h.update(b"world");
        let sums = h.finish();
        assert_eq!(sums.md5_hex, md5_hex(b"hello world"));
        assert_eq!(sums.etag, sums.md5_hex);
        assert_eq!(sums.fragment_md5s.len(), 1);
    }

    #[test]
    fn test_empty_body() {
        let sums = ContentHasher::new().finish();
        assert_eq!(sums.md5_hex, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(sums.etag, sums.md5_hex);
    }

    #[test]
    fn test_fragmented_etag_matches_multipart() {
        let mut h = ContentHasher::new();
        h.update(b"part-one");
        let first = h.close_fragment();
        h.update(b"part-two");
        let sums = h.finish();

        assert_eq!(first, md5_hex(b"part-one"));
        assert_eq!(sums.fragment_md5s, vec![md5_hex(b"part-one"), md5_hex(b"part-two")]);
        assert_eq!(sums.md5_hex, md5_hex(b"part-onepart-two"));

        let digests: Vec<[u8; 16]> = [b"part-one", b"part-two"]
            .iter()
            .map(|p| Md5::digest(p).into())
            .collect();
        assert_eq!(sums.etag, multipart_etag(&digests));
        assert!(sums.etag.ends_with("-2"));
    }

    #[test]
    fn test_content_md5_header() {
        // base64 of md5("hello world")
        let hex = content_md5_to_hex("XrY7u+Ae7tCTyyK7j1rNww==").unwrap();
        assert_eq!(hex, md5_hex(b"hello world"));
        assert!(content_md5_to_hex("not base64!").is_err());
        assert!(content_md5_to_hex("AAAA").is_err());
    }
}
