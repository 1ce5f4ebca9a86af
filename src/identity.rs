//! Stable, content-addressable identities for source files.
//!
//! An identity is the name a file carries in the sink for its whole lifetime.
//! New files get an identity derived from the SHA-256 of their qualified URI,
//! formatted as a UUID and suffixed with the original extension:
//!
//! ```text
//! handbook:guides/setup.md  ──sha256──▶  3f1c9a2e-…-7b10.md
//! ```
//!
//! Derivation is deterministic, so a file whose record was lost maps back to
//! the same sink object instead of leaving an orphan behind. Files that
//! already have an identity keep it; only the extension follows the URI.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Read buffer used by [`hash_reader`].
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// An identity plus how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    /// `false` only for the random fallback used when no URI is available.
    pub deterministic: bool,
}

/// Assign an identity to the file at `uri`.
///
/// With `existing`, the existing identity is returned with its extension
/// normalized to match `uri`. Without it, the identity is derived from
/// `uri`. An empty `uri` falls back to a random UUID and is flagged as
/// non-deterministic.
pub fn assign_identity(uri: &str, existing: Option<&str>) -> Identity {
    let extension = extension_of(uri);

    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        return Identity {
            name: with_extension(strip_extension(existing), extension),
            deterministic: true,
        };
    }

    if uri.is_empty() {
        tracing::warn!("assigning random identity: no uri available");
        return Identity {
            name: Uuid::new_v4().to_string(),
            deterministic: false,
        };
    }

    let digest = Sha256::digest(uri.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    let stem = Uuid::from_bytes(bytes).hyphenated().to_string();

    Identity {
        name: with_extension(&stem, extension),
        deterministic: true,
    }
}

/// Hex SHA-256 of a byte slice.
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hex SHA-256 of everything `reader` yields, read in bounded chunks.
pub async fn hash_reader<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Extension of the last path segment of `uri`, without the dot.
fn extension_of(uri: &str) -> Option<&str> {
    let name = uri.rsplit(['/', '\\', ':']).next().unwrap_or(uri);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(pos) if pos + 1 < name.len() => Some(&name[pos + 1..]),
        Some(_) => None,
    }
}

fn strip_extension(identity: &str) -> &str {
    match identity.rfind('.') {
        Some(pos) if pos > 0 => &identity[..pos],
        _ => identity,
    }
}

fn with_extension(stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}
