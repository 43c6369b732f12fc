//! HMAC-SHA256 signed tokens.
//!
//! Transfer tokens are `base64url(claims-json).base64url(mac)`, handed to
//! clients in batch responses as `Authorization: Bearer …`. Artifact links
//! carry a bare MAC in their query string instead.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::repo::RepoId;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Operation a token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Upload,
    Download,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub repo_id: RepoId,
    pub op: Scope,
    pub user_id: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").field("ttl", &self.ttl).finish()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Result<Self> {
        let key = secret.as_ref().to_vec();
        if key.is_empty() {
            return Err(Error::Config("token secret must not be empty".into()));
        }
        Ok(TokenSigner { key, ttl })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length")
    }

    /// Issue a token for `op` on `repo_id`, valid for the configured TTL.
    pub fn issue(&self, repo_id: RepoId, op: Scope, user_id: i64) -> Result<String> {
        self.sign(&Claims {
            repo_id,
            op,
            user_id,
            exp: Utc::now().timestamp() + self.ttl.as_secs() as i64,
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    /// Check signature and expiry. Every failure is [`Error::Unauthorized`].
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| Error::Unauthorized("malformed token".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::Unauthorized("malformed token signature".into()))?;
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::Unauthorized("bad token signature".into()))?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|json| serde_json::from_slice(&json).ok())
            .ok_or_else(|| Error::Unauthorized("malformed token claims".into()))?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(Error::Unauthorized("token expired".into()));
        }
        Ok(claims)
    }

    fn artifact_mac(&self, endpoint: &str, expires: i64, run_id: i64, artifact_id: i64) -> HmacSha256 {
        // Fixed-width integers and a length-prefixed endpoint keep the
        // fields from running into each other.
        let mut mac = self.mac();
        mac.update(&(endpoint.len() as u64).to_be_bytes());
        mac.update(endpoint.as_bytes());
        mac.update(&expires.to_be_bytes());
        mac.update(&run_id.to_be_bytes());
        mac.update(&artifact_id.to_be_bytes());
        mac
    }

    /// Query parameters `(sig, expires)` authorizing `endpoint` for one
    /// artifact until the TTL runs out.
    pub fn sign_artifact(&self, endpoint: &str, run_id: i64, artifact_id: i64) -> (String, i64) {
        let expires = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let mac = self.artifact_mac(endpoint, expires, run_id, artifact_id);
        (URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()), expires)
    }

    pub fn verify_artifact(
        &self,
        endpoint: &str,
        run_id: i64,
        artifact_id: i64,
        sig: &str,
        expires: i64,
    ) -> Result<()> {
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| Error::Unauthorized("malformed signature".into()))?;
        self.artifact_mac(endpoint, expires, run_id, artifact_id)
            .verify_slice(&sig)
            .map_err(|_| Error::Unauthorized("bad signature".into()))?;
        if expires <= Utc::now().timestamp() {
            return Err(Error::Unauthorized("link expired".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("s3cr3t", Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let s = signer();
        let token = s.issue(7, Scope::Upload, 3).unwrap();
        let claims = s.verify(&token).unwrap();
        assert_eq!(claims.repo_id, 7);
        assert_eq!(claims.op, Scope::Upload);
        assert_eq!(claims.user_id, 3);
    }

    #[test]
    fn test_rejects_tampering() {
        let s = signer();
        let token = s.issue(7, Scope::Download, 3).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = Claims {
            repo_id: 8,
            op: Scope::Upload,
            user_id: 3,
            exp: i64::MAX,
        };
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap()),
            sig
        );
        assert!(matches!(s.verify(&forged), Err(Error::Unauthorized(_))));
        assert!(matches!(s.verify("garbage"), Err(Error::Unauthorized(_))));

        let other = TokenSigner::new("other", Duration::from_secs(60)).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_expired() {
        let s = signer();
        let token = s
            .sign(&Claims {
                repo_id: 1,
                op: Scope::Download,
                user_id: 1,
                exp: Utc::now().timestamp() - 1,
            })
            .unwrap();
        assert!(matches!(s.verify(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_artifact_signature_scoped() {
        let s = signer();
        let (sig, expires) = s.sign_artifact("upload", 12, 34);
        s.verify_artifact("upload", 12, 34, &sig, expires).unwrap();
        assert!(s.verify_artifact("download", 12, 34, &sig, expires).is_err());
        assert!(s.verify_artifact("upload", 1, 234, &sig, expires).is_err());
        assert!(s.verify_artifact("upload", 12, 34, &sig, expires + 1).is_err());
    }

    #[test]
    fn test_artifact_signature_fields_do_not_shift() {
        let s = signer();
        let (sig, expires) = s.sign_artifact("download", 12, 7);
        // Moving the run's leading digit into `expires` must not verify.
        assert!(matches!(
            s.verify_artifact("download", 2, 7, &sig, expires * 10 + 1),
            Err(Error::Unauthorized(_))
        ));
        assert!(s.verify_artifact("downloa", 12, 7, &sig, expires).is_err());
        assert!(s.verify_artifact("download", 12, 7, &sig, expires).is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(TokenSigner::new("", Duration::from_secs(1)).is_err());
    }
}
