use alloy_primitives::B256;
use sha2::{Digest, Sha256};

/// Streaming 256-bit hasher used for all archive commitments.
///
/// Thin wrapper over sha-256 so call sites read in terms of the archive's
/// [`B256`] hash type.
#[derive(Debug, Default)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the running digest.
    pub fn ingest(&mut self, bytes: impl AsRef<[u8]>) {
        self.0.update(bytes.as_ref());
    }

    /// Consume the hasher and produce the 32-byte digest.
    ///
    /// With no prior `ingest` this is the hash of the empty byte string.
    pub fn finish(self) -> B256 {
        B256::from_slice(&self.0.finalize())
    }
}

/// Extend a hash chain: `combine(a, b) = sha256(a || b)`.
pub fn combine(a: &B256, b: &B256) -> B256 {
    let mut hasher = Hasher::new();
    hasher.ingest(a);
    hasher.ingest(b);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn empty_digest_is_sha256_of_empty_string() {
        assert_eq!(
            Hasher::new().finish(),
            b256!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"),
        );
    }

    #[test]
    fn ingest_is_streaming() {
        let mut one = Hasher::new();
        one.ingest(b"hello world");

        let mut split = Hasher::new();
        split.ingest(b"hello");
        split.ingest(b" world");

        assert_eq!(one.finish(), split.finish());
    }

    #[test]
    fn combine_is_digest_of_concatenation() {
        let a = b256!("0101010101010101010101010101010101010101010101010101010101010101");
        let b = b256!("0202020202020202020202020202020202020202020202020202020202020202");

        let mut hasher = Hasher::new();
        hasher.ingest(a);
        hasher.ingest(b);

        assert_eq!(combine(&a, &b), hasher.finish());
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = b256!("0101010101010101010101010101010101010101010101010101010101010101");
        let b = b256!("0202020202020202020202020202020202020202020202020202020202020202");
        assert_ne!(combine(&a, &b), combine(&b, &a));
    }
}
