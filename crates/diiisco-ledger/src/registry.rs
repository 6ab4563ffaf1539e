//! Bootstrap alias validation.
//!
//! Bootstrap list entries may be registry aliases instead of raw
//! multiaddrs. An alias is a DNS-like name ending in the well-known
//! suffix; it resolves through the ledger registry to a full
//! multiaddr. Only resolved addresses of the exact shape
//! `/(dns4|ip4)/host/tcp/port/p2p/id` are accepted.

use diiisco_types::{DiiiscoError, Result};

/// Well-known suffix marking a bootstrap registry alias.
pub const ALIAS_SUFFIX: &str = ".diiisco.net";

/// Whether a bootstrap entry is a registry alias rather than a multiaddr.
pub fn is_alias(entry: &str) -> bool {
    !entry.starts_with('/') && entry.ends_with(ALIAS_SUFFIX)
}

/// Validates a resolved bootstrap multiaddr.
///
/// Accepts exactly `/(dns4|ip4)/host/tcp/port/p2p/id`.
pub fn validate_bootstrap_addr(addr: &str) -> Result<()> {
    let err = |reason: String| DiiiscoError::ConfigError { reason };

    let mut parts = addr.split('/');
    if parts.next() != Some("") {
        return Err(err(format!("bootstrap address must start with '/': {addr}")));
    }

    let segments: Vec<&str> = parts.collect();
    if segments.len() != 6 {
        return Err(err(format!(
            "bootstrap address must have 6 components, got {}: {addr}",
            segments.len()
        )));
    }

    if segments[0] != "dns4" && segments[0] != "ip4" {
        return Err(err(format!(
            "bootstrap address must start with /dns4 or /ip4: {addr}"
        )));
    }
    if segments[1].is_empty() {
        return Err(err(format!("bootstrap address host is empty: {addr}")));
    }
    if segments[2] != "tcp" {
        return Err(err(format!("bootstrap address must use /tcp: {addr}")));
    }
    if segments[3].parse::<u16>().is_err() {
        return Err(err(format!(
            "bootstrap address port is not a valid u16: {addr}"
        )));
    }
    if segments[4] != "p2p" {
        return Err(err(format!(
            "bootstrap address must end in /p2p/<peer-id>: {addr}"
        )));
    }
    if segments[5].is_empty() {
        return Err(err(format!("bootstrap address peer id is empty: {addr}")));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
