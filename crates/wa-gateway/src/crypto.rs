use ring::hmac;

pub const APP_SECRET_HEADER: &str = "x-app-secret";

const SECRET_TAG_KEY: &[u8] = b"wa-gateway/app-secret/v1";

/// Holds an HMAC tag of the configured shared secret; candidates are checked with
/// `hmac::verify`, so comparison time does not depend on where they differ.
pub struct SecretGuard {
    key: hmac::Key,
    tag: hmac::Tag,
}

impl SecretGuard {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, SECRET_TAG_KEY);
        let tag = hmac::sign(&key, secret.as_bytes());
        Self { key, tag }
    }

    #[must_use]
    pub fn verify(&self, candidate: &str) -> bool {
        hmac::verify(&self.key, candidate.as_bytes(), self.tag.as_ref()).is_ok()
    }

    /// Short hex prefix of the tag, safe to log for telling deployments apart.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.tag.as_ref()[..4])
    }
}

impl std::fmt::Debug for SecretGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretGuard")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
