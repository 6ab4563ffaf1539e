//! Ed25519 envelope signing and verification.
//!
//! Signatures are computed over the canonical JSON rendering of the
//! envelope with `signature` removed, never over the wire encoding.
//! The sender's wallet address doubles as the verification key: the
//! 32-byte Ed25519 public key is recovered straight from the address.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use diiisco_types::{DiiiscoError, Result, WalletAddr};

use crate::envelope::Envelope;

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Signs an envelope in place.
///
/// Canonicalizes the envelope without `signature`, signs those bytes,
/// and attaches the base64 signature. Signing is deterministic:
/// re-signing an unchanged envelope yields the identical signature.
pub fn sign_envelope(envelope: &mut Envelope, key: &SigningKey) -> Result<()> {
    let payload = envelope.signing_payload()?;
    let signature = key.sign(&payload);
    envelope.signature = Some(BASE64.encode(signature.to_bytes()));
    Ok(())
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verifies an inbound envelope through the ordered rejection pipeline.
///
/// 1. `fromWalletAddr` must be a well-formed ledger address
///    ([`DiiiscoError::BadSender`]).
/// 2. A signature must be present ([`DiiiscoError::Unsigned`]).
/// 3. The signature must verify against the address' public key over
///    the canonical envelope bytes ([`DiiiscoError::BadSignature`]).
pub fn verify_envelope(envelope: &Envelope) -> Result<()> {
    let addr: WalletAddr =
        envelope
            .from_wallet_addr
            .parse()
            .map_err(|_| DiiiscoError::BadSender {
                addr: envelope.from_wallet_addr.clone(),
            })?;

    let signature_b64 = envelope.signature.as_deref().ok_or(DiiiscoError::Unsigned)?;

    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| DiiiscoError::BadSignature)?;
    let signature_arr: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| DiiiscoError::BadSignature)?;
    let signature = Signature::from_bytes(&signature_arr);

    let verifying_key = VerifyingKey::from_bytes(&addr.public_key()?)
        .map_err(|_| DiiiscoError::BadSignature)?;

    let payload = envelope.signing_payload()?;
    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| DiiiscoError::BadSignature)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
