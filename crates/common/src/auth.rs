//! Signed message envelope.
//!
//! Every message carries the sender's uid/gid and an HMAC-SHA256 over a
//! canonical rendering of the envelope. A receiver that holds the same
//! cluster key trusts the uid once the HMAC verifies.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::protocol::Message;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid authentication key: {0}")]
    InvalidKey(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Envelope {
    pub msg_id: String,
    pub uid: u32,
    pub gid: u32,
    pub ts: u64,
    pub nonce: String,
    pub hmac: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(uid: u32, gid: u32, message: Message) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            uid,
            gid,
            ts: now_ts(),
            nonce: Uuid::new_v4().to_string(),
            hmac: String::new(),
            message,
        }
    }

    fn canonical_body(&self) -> Result<String, AuthError> {
        let payload = serde_json::to_string(&self.message)?;
        Ok(format!(
            "{}|{}|{}|{}|{}|{}",
            self.msg_id, self.uid, self.gid, self.ts, self.nonce, payload
        ))
    }

    pub fn sign(&mut self, key: &[u8]) -> Result<(), AuthError> {
        let body = self.canonical_body()?;
        let mut mac =
            HmacSha256::new_from_slice(key).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        mac.update(body.as_bytes());
        self.hmac = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        Ok(())
    }

    pub fn verify(&self, key: &[u8]) -> bool {
        let Ok(body) = self.canonical_body() else {
            return false;
        };
        let Ok(provided) = general_purpose::STANDARD.decode(self.hmac.as_bytes()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(body.as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

/// Identity and key used to seal outgoing envelopes.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
    uid: u32,
    gid: u32,
}

impl Signer {
    pub fn new(key: impl Into<Vec<u8>>, uid: u32, gid: u32) -> Self {
        Self {
            key: key.into(),
            uid,
            gid,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn seal(&self, message: Message) -> Result<Envelope, AuthError> {
        let mut envelope = Envelope::new(self.uid, self.gid, message);
        envelope.sign(&self.key)?;
        Ok(envelope)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .finish_non_exhaustive()
    }
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
