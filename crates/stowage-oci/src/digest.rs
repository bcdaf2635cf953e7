//! Content digests.
//!
//! A [`Digest`] names a blob by the hash of its bytes, rendered as
//! `<algorithm>:<hex>` (for example `sha256:e3b0c442...`). The same type is
//! used for layer diff IDs, which hash the uncompressed layer content.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use stowage_common::{StowageError, StowageResult};

/// The only algorithm stowage can verify, and so the only one it accepts.
pub const SHA256: &str = "sha256";

/// A content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Build a digest from its parts, validating the hex encoding.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::InvalidDigest`] if the algorithm is not
    /// `sha256` or the hex string has the wrong length or characters.
    pub fn new(algorithm: &str, hex: &str) -> StowageResult<Self> {
        let valid = algorithm == SHA256
            && hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(StowageError::InvalidDigest {
                value: format!("{algorithm}:{hex}"),
            });
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }

    /// SHA-256 digest of an in-memory buffer.
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_sha256(Sha256::digest(data).as_slice())
    }

    /// SHA-256 digest and byte count of a stream, read to the end.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the reader.
    pub fn sha256_reader(mut reader: impl Read) -> io::Result<(Self, i64)> {
        let mut writer = HashingWriter::new(io::sink());
        io::copy(&mut reader, &mut writer)?;
        let (_, digest, size) = writer.finish();
        Ok((digest, size))
    }

    fn from_sha256(bytes: &[u8]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(bytes),
        }
    }

    /// Hash algorithm name.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Lowercase hex encoding of the hash.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hex)) => Self::new(algorithm, hex),
            None => Err(StowageError::InvalidDigest {
                value: s.to_string(),
            }),
        }
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Writer adapter that hashes and counts everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: i64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the adapter, returning the inner writer, digest and byte count.
    pub fn finish(self) -> (W, Digest, i64) {
        let digest = Digest::from_sha256(self.hasher.finalize().as_slice());
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as i64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(Digest::sha256(b"").to_string(), EMPTY_SHA256);

        let (digest, size) = Digest::sha256_reader(&b""[..]).unwrap();
        assert_eq!(digest.to_string(), EMPTY_SHA256);
        assert_eq!(size, 0);
    }

    #[test]
    fn reader_matches_buffer() {
        let data = b"hello world";
        let (digest, size) = Digest::sha256_reader(&data[..]).unwrap();
        assert_eq!(digest, Digest::sha256(data));
        assert_eq!(size, 11);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!("md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Digest>().is_err());
        assert!("e3b0c44298fc1c149afbf4c8996fb924".parse::<Digest>().is_err());
        let upper = EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(upper.parse::<Digest>().is_err());
    }

    #[test]
    fn unverifiable_algorithms_are_rejected() {
        let sha512 = "sha512:".to_string() + &"ab".repeat(64);
        assert!(matches!(
            sha512.parse::<Digest>(),
            Err(StowageError::InvalidDigest { .. })
        ));
        assert!(Digest::new("sha512", &"ab".repeat(64)).is_err());
        assert!(Digest::new(SHA256, &"ab".repeat(32)).is_ok());
    }

    #[test]
    fn serde_as_string() {
        let digest: Digest = EMPTY_SHA256.parse().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{EMPTY_SHA256}\""));
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }

    #[test]
    fn hashing_writer_passes_bytes_through() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"layer bytes").unwrap();
        let (inner, digest, size) = writer.finish();
        assert_eq!(inner, b"layer bytes");
        assert_eq!(digest, Digest::sha256(b"layer bytes"));
        assert_eq!(size, 11);
    }

    proptest! {
        #[test]
        fn display_parses_back(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let digest = Digest::sha256(&data);
            let parsed: Digest = digest.to_string().parse().unwrap();
            prop_assert_eq!(parsed, digest);
        }

        #[test]
        fn strings_without_separator_are_rejected(s in "[a-f0-9]{0,80}") {
            prop_assert!(s.parse::<Digest>().is_err());
        }
    }
}
