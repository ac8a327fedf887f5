//! Device-signature derivation for registration attempts.
//!
//! The signature is a stable digest of whatever client signals the request
//! carried. Front-end instrumentation submits perceptual render fingerprints
//! (canvas/WebGL/audio); requests without them degrade to a network-address
//! plus user-agent identity instead of erroring.

use sha2::{Digest, Sha256};

/// Signals available when a registration attempt arrives.
#[derive(Debug, Clone, Default)]
pub struct ClientSignals {
    pub ip_address: String,
    pub user_agent: String,
    /// Canvas render fingerprint from front-end instrumentation.
    pub canvas: Option<String>,
    /// WebGL render fingerprint.
    pub webgl: Option<String>,
    /// Audio-stack fingerprint.
    pub audio: Option<String>,
    /// Identifier the client instrumentation assigned to itself.
    pub fingerprint_id: Option<String>,
}

impl ClientSignals {
    fn has_perceptual_signals(&self) -> bool {
        self.canvas.is_some() || self.webgl.is_some() || self.audio.is_some()
    }
}

/// Strategy seam for the signature function. Implementations must be pure:
/// identical signals always produce an identical signature.
pub trait FingerprintStrategy: Send + Sync {
    fn derive(&self, signals: &ClientSignals) -> String;
}

/// Version prefix baked into every signature so a future algorithm change
/// produces values distinguishable from existing ledger rows.
const SIGNATURE_VERSION: &str = "fp1";

/// Default strategy: SHA-256 over a labeled concatenation of the present
/// signals, hex-encoded.
///
/// With perceptual signals the digest covers the user agent plus each
/// signal, deliberately excluding the network address so the signature
/// survives an IP change. Without them it falls back to address + agent.
pub struct Sha256Fingerprinter;

impl FingerprintStrategy for Sha256Fingerprinter {
    fn derive(&self, signals: &ClientSignals) -> String {
        let mut hasher = Sha256::new();

        if signals.has_perceptual_signals() {
            hasher.update(b"ua=");
            hasher.update(signals.user_agent.as_bytes());
            for (label, value) in [
                ("canvas", &signals.canvas),
                ("webgl", &signals.webgl),
                ("audio", &signals.audio),
            ] {
                if let Some(value) = value {
                    hasher.update(b"\n");
                    hasher.update(label.as_bytes());
                    hasher.update(b"=");
                    hasher.update(value.as_bytes());
                }
            }
        } else {
            hasher.update(b"ip=");
            hasher.update(signals.ip_address.as_bytes());
            hasher.update(b"\nua=");
            hasher.update(signals.user_agent.as_bytes());
        }

        format!("{}:{}", SIGNATURE_VERSION, hex::encode(hasher.finalize()))
    }
}
