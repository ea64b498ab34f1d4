//! Launch credentials issued by the controller.
//!
//! A credential binds `(job_id, step_id, uid)` to a host list and an expiry
//! and is signed with the cluster credential key. Nodes verify the signature
//! before letting a step start.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::ids::{JobId, StepId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCredential {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: u32,
    /// Host-list expression naming the nodes the step may run on.
    pub hosts: String,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl LaunchCredential {
    /// Build and sign a credential.
    pub fn issue(
        job_id: JobId,
        step_id: StepId,
        uid: u32,
        hosts: impl Into<String>,
        expires_at: DateTime<Utc>,
        key: &[u8],
    ) -> anyhow::Result<Self> {
        let mut cred = Self {
            job_id,
            step_id,
            uid,
            hosts: hosts.into(),
            expires_at,
            signature: String::new(),
        };
        cred.signature = cred.compute_signature(key)?;
        Ok(cred)
    }

    fn signing_body(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.job_id,
            self.step_id,
            self.uid,
            self.hosts,
            self.expires_at.timestamp()
        )
    }

    fn compute_signature(&self, key: &[u8]) -> anyhow::Result<String> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("invalid credential key: {e}"))?;
        mac.update(self.signing_body().as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Pure signature check; expiry and host membership are the caller's
    /// concern.
    pub fn signature_matches(&self, key: &[u8]) -> bool {
        let Ok(provided) = general_purpose::STANDARD.decode(self.signature.as_bytes()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(self.signing_body().as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn issued_credential_verifies() {
        let cred =
            LaunchCredential::issue(7, 1, 42, "n0", Utc::now() + Duration::hours(1), b"k").unwrap();
        assert!(cred.signature_matches(b"k"));
        assert!(!cred.signature_matches(b"other"));
    }

    #[test]
    fn altered_fields_break_the_signature() {
        let mut cred =
            LaunchCredential::issue(7, 1, 42, "n0", Utc::now() + Duration::hours(1), b"k").unwrap();
        cred.uid = 0;
        assert!(!cred.signature_matches(b"k"));
    }
}
