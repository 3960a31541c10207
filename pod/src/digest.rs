// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Artifact digest verification.
//!
//! A digest file is `sha256sum` output: one `<hex>  <relative path>`
//! line per file in the artifact. Verification re-hashes every regular
//! file under an install directory and demands an exact match in both
//! directions; extra files are as much of a failure as missing ones.
//!
//! Whether the digest itself is trusted is a separate question answered
//! by a [`SignaturePolicy`], which is an external collaborator; only
//! the accept-all development policy lives here.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest as _, Sha256};
use slog::{Logger, o, warn};
use tokio::io::AsyncReadExt;

use crate::fetch::{ArtifactFetcher, FetchError};

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unparseable digest line {line:?}")]
    Parse { line: String },

    #[error("file {path} is listed in the digest but missing on disk")]
    MissingFile { path: Utf8PathBuf },

    #[error("file {path} is on disk but not listed in the digest")]
    ExtraFile { path: Utf8PathBuf },

    #[error("file {path} does not match its digest")]
    Mismatch { path: Utf8PathBuf },

    #[error("I/O failure on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("digest is not signed")]
    Unsigned,

    #[error("digest signature is not valid: {0}")]
    BadSignature(String),
}

/// Decides whether a digest (and its signature) is trusted before any
/// content comparison happens.
pub trait SignaturePolicy: Send + Sync {
    fn check_digest(
        &self,
        digest: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<(), PolicyError>;
}

/// Accept-all policy for development and tests. Every acceptance is
/// logged loudly.
pub struct InsecurePolicy {
    log: Logger,
}

impl InsecurePolicy {
    pub fn new(log: &Logger) -> InsecurePolicy {
        InsecurePolicy { log: log.new(o!("component" => "InsecurePolicy")) }
    }
}

impl SignaturePolicy for InsecurePolicy {
    fn check_digest(
        &self,
        _digest: &[u8],
        _signature: Option<&[u8]>,
    ) -> Result<(), PolicyError> {
        warn!(self.log, "accepting digest without signature verification");
        Ok(())
    }
}

/// A fetched digest plus the raw bytes policies are checked against.
pub struct FetchedDigest {
    pub digest: ArtifactDigest,
    pub raw: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

/// Parsed digest file: relative path to expected SHA-256.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactDigest {
    files: BTreeMap<Utf8PathBuf, String>,
}

impl ArtifactDigest {
    pub fn parse(text: &str) -> Result<ArtifactDigest, DigestError> {
        let mut files = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((hash, path)) = line.split_once(char::is_whitespace)
            else {
                return Err(DigestError::Parse { line: line.to_string() });
            };
            let hash = hash.trim();
            let path = path.trim();
            if hash.len() != 64
                || !hash.chars().all(|c| c.is_ascii_hexdigit())
                || path.is_empty()
            {
                return Err(DigestError::Parse { line: line.to_string() });
            }
            files.insert(
                Utf8PathBuf::from(path),
                hash.to_ascii_lowercase(),
            );
        }
        Ok(ArtifactDigest { files })
    }

    /// Fetch and parse a digest, plus its signature when a location for
    /// one is given.
    pub async fn fetch(
        fetcher: &ArtifactFetcher,
        digest_location: &str,
        signature_location: Option<&str>,
    ) -> Result<FetchedDigest, DigestError> {
        let raw = fetcher.fetch_bytes(digest_location).await?;
        let text = String::from_utf8_lossy(&raw);
        let digest = ArtifactDigest::parse(&text)?;
        let signature = match signature_location {
            None => None,
            Some(location) => Some(fetcher.fetch_bytes(location).await?),
        };
        Ok(FetchedDigest { digest, raw, signature })
    }

    /// Verify that `root`'s regular files are exactly the digest's
    /// files with matching content. Returns the first discrepancy.
    pub async fn verify_dir(&self, root: &Utf8Path) -> Result<(), DigestError> {
        let mut unseen: std::collections::BTreeSet<&Utf8PathBuf> =
            self.files.keys().collect();
        let walker = walkdir::WalkDir::new(root).sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|err| DigestError::Io {
                path: root.to_owned(),
                err: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8PathBuf::try_from(entry.path().to_owned())
                .map_err(|err| DigestError::Io {
                    path: root.to_owned(),
                    err: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        err,
                    ),
                })?;
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under its root")
                .to_owned();
            let Some(expected) = self.files.get(&rel) else {
                return Err(DigestError::ExtraFile { path: rel });
            };
            let actual = sha256_file(&path).await?;
            if actual != *expected {
                return Err(DigestError::Mismatch { path: rel });
            }
            unseen.remove(&rel);
        }
        if let Some(missing) = unseen.into_iter().next() {
            return Err(DigestError::MissingFile { path: missing.clone() });
        }
        Ok(())
    }
}

async fn sha256_file(path: &Utf8Path) -> Result<String, DigestError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|err| {
        DigestError::Io { path: path.to_owned(), err }
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|err| DigestError::Io {
            path: path.to_owned(),
            err,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn hex_digest(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    #[test]
    fn test_parse_sha256sum_format() {
        let text = format!(
            "{}  bin/launch\n{}  README\n",
            hex_digest(b"launch"),
            hex_digest(b"readme"),
        );
        let digest = ArtifactDigest::parse(&text).unwrap();
        assert_eq!(digest.files.len(), 2);
        assert_eq!(
            digest.files[&Utf8PathBuf::from("bin/launch")],
            hex_digest(b"launch")
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ArtifactDigest::parse("not a digest line"),
            Err(DigestError::Parse { .. })
        ));
        assert!(matches!(
            ArtifactDigest::parse("abc123  short-hash"),
            Err(DigestError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_dir_matches() {
        let tmp = Utf8TempDir::new().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("bin")).await.unwrap();
        tokio::fs::write(tmp.path().join("bin/launch"), b"launch")
            .await
            .unwrap();

        let text = format!("{}  bin/launch\n", hex_digest(b"launch"));
        let digest = ArtifactDigest::parse(&text).unwrap();
        digest.verify_dir(tmp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_dir_catches_tampering() {
        let tmp = Utf8TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("launch"), b"tampered")
            .await
            .unwrap();

        let text = format!("{}  launch\n", hex_digest(b"launch"));
        let digest = ArtifactDigest::parse(&text).unwrap();
        assert!(matches!(
            digest.verify_dir(tmp.path()).await,
            Err(DigestError::Mismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_dir_catches_extra_and_missing() {
        let tmp = Utf8TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("launch"), b"launch")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("sneaky"), b"extra")
            .await
            .unwrap();

        let text = format!("{}  launch\n", hex_digest(b"launch"));
        let digest = ArtifactDigest::parse(&text).unwrap();
        assert!(matches!(
            digest.verify_dir(tmp.path()).await,
            Err(DigestError::ExtraFile { .. })
        ));

        tokio::fs::remove_file(tmp.path().join("sneaky")).await.unwrap();
        tokio::fs::remove_file(tmp.path().join("launch")).await.unwrap();
        assert!(matches!(
            digest.verify_dir(tmp.path()).await,
            Err(DigestError::MissingFile { .. })
        ));
    }
}
