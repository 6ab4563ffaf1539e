//! TCP transport configuration.
//!
//! The swarm builder composes this with Noise encryption and Yamux
//! multiplexing; every connection is encrypted and multiplexed.

use libp2p::tcp;

/// TCP configuration for the diiisco swarm.
///
/// `nodelay` keeps small protocol frames (quotes, contract messages)
/// from sitting in Nagle buffers; port reuse lets the dialer share the
/// listening port, which observers need for hole punching.
pub fn tcp_config() -> tcp::Config {
    tcp::Config::default().nodelay(true).port_reuse(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
