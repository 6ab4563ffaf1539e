//! Persistent node identity.
//!
//! The node key-pair lives in a single binary file holding the libp2p
//! protobuf encoding of an Ed25519 key-pair. The file is created once
//! and reused for the life of the node so the peer id stays stable
//! across restarts.
//!
//! An unparsable file is a fatal error — it is never silently
//! regenerated, because that would quietly change the node's identity
//! and strand every peer record pointing at the old one.

use std::fs;
use std::path::Path;

use libp2p::identity::Keypair;

use diiisco_types::{DiiiscoError, Result};

/// Loads the identity from `path`, creating it when absent.
///
/// Creation writes atomically (temp file + rename), restricts the
/// file to the owner on unix, then re-reads the file and compares
/// public keys — the identity in use must equal the file's identity.
///
/// # Errors
///
/// - [`DiiiscoError::IdentityCorrupt`] when the file exists but does
///   not parse as a protobuf key-pair.
/// - [`DiiiscoError::IdentityMismatch`] when the persisted identity
///   does not round-trip to the generated one.
pub fn load_or_create(path: &Path) -> Result<Keypair> {
    if path.exists() {
        return load(path);
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| DiiiscoError::NetworkError {
            reason: format!("failed to encode identity: {e}"),
        })?;

    write_atomic(path, &encoded)?;

    // The identity used by the swarm must equal the file's identity.
    let persisted = load(path)?;
    if persisted.public() != keypair.public() {
        return Err(DiiiscoError::IdentityMismatch);
    }

    tracing::info!(
        peer_id = %keypair.public().to_peer_id(),
        path = %path.display(),
        "generated new node identity"
    );
    Ok(keypair)
}

fn load(path: &Path) -> Result<Keypair> {
    let bytes = fs::read(path).map_err(|e| DiiiscoError::IdentityCorrupt {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let keypair =
        Keypair::from_protobuf_encoding(&bytes).map_err(|e| DiiiscoError::IdentityCorrupt {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    tracing::info!(
        peer_id = %keypair.public().to_peer_id(),
        path = %path.display(),
        "loaded node identity"
    );
    Ok(keypair)
}

/// Writes `bytes` to `path` via a temp file in the same directory,
/// then renames into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");

    let io_err = |what: &str, e: std::io::Error| DiiiscoError::NetworkError {
        reason: format!("failed to {what} {}: {e}", tmp.display()),
    };

    {
        use std::io::Write;

        // Owner read/write only — the private key must never be
        // world-readable.
        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(|e| io_err("open", e))?
        };
        #[cfg(not(unix))]
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| io_err("open", e))?;

        file.write_all(bytes).map_err(|e| io_err("write", e))?;
        file.sync_all().map_err(|e| io_err("sync", e))?;
    }

    fs::rename(&tmp, path).map_err(|e| DiiiscoError::NetworkError {
        reason: format!("failed to move identity into place: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
