//! Signed session cookies.
//!
//! The cookie value is `s:<id>.<mac>`, where `<mac>` is the unpadded
//! base64 HMAC-SHA256 of the id under the session secret. The signature
//! keeps clients from guessing ids; the id itself stays opaque.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use cohort_protocol::SessionId;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::SessionError;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "s:";

/// Signs and verifies session cookie values.
#[derive(Clone)]
pub struct CookieSigner {
    keyed: HmacSha256,
}

impl CookieSigner {
    /// # Errors
    /// [`SessionError::Backend`] if the secret is rejected as an HMAC key.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SessionError> {
        let keyed = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| SessionError::Backend(format!("cookie secret: {e}")))?;
        Ok(Self { keyed })
    }

    /// Produces the cookie value for a session id.
    pub fn sign(&self, id: &SessionId) -> String {
        let mac = STANDARD_NO_PAD.encode(self.mac(id.as_str()).finalize().into_bytes());
        format!("{PREFIX}{}.{mac}", id.as_str())
    }

    /// Recovers the session id from a cookie value.
    ///
    /// Values that are not in signed form, or whose signature does not
    /// verify, yield [`SessionError::InvalidSignature`]. The comparison is
    /// constant-time.
    pub fn unsign(&self, value: &str) -> Result<SessionId, SessionError> {
        let signed = value
            .strip_prefix(PREFIX)
            .ok_or(SessionError::InvalidSignature)?;
        let (id, mac) = signed
            .rsplit_once('.')
            .ok_or(SessionError::InvalidSignature)?;
        if id.is_empty() {
            return Err(SessionError::InvalidSignature);
        }

        let expected = STANDARD_NO_PAD
            .decode(mac)
            .map_err(|_| SessionError::InvalidSignature)?;
        self.mac(id)
            .verify_slice(&expected)
            .map_err(|_| SessionError::InvalidSignature)?;

        Ok(SessionId::new(id))
    }

    fn mac(&self, id: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(id.as_bytes());
        mac
    }
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieSigner { .. }")
    }
}
