//! The handshake layer contract.
//!
//! Message stream obfuscation (BEP-like MSE/PE schemes some swarms
//! require) is deliberately not implemented; [`EncryptionMode`] exists so
//! the call sites that will eventually need to select a scheme are
//! already wired up, without this engine actually performing the
//! handshake negotiation or stream cipher.

/// The encryption mode a session would negotiate, if encryption were
/// implemented. Threaded through connection setup so a future encryption
/// layer has a single place to plug into; only `Plaintext` is usable
/// today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EncryptionMode {
    Plaintext,
}

impl Default for EncryptionMode {
    fn default() -> Self {
        Self::Plaintext
    }
}
