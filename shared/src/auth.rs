//! HMAC request authentication (§4.F step 2, §6). Requests not originating
//! from a trusted loopback address must carry an `X-Request-Signature`
//! header equal to `hex(HMAC-SHA1(secret, method‖path‖body))`, where the
//! secret is looked up by the `X-Public-Key` header in the keystore.

use crate::error::AppError;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;
use std::net::IpAddr;

/// Maps a public key id (the `X-Public-Key` header value) to its HMAC
/// secret. Populated once at startup from configuration; read-only for the
/// lifetime of the process (§5: "shared mutable state: only the DB
/// connection pool and the HMAC keystore"; this keystore is never mutated
/// after load, so no interior mutability is needed here).
#[derive(Debug, Clone, Default)]
pub struct Keystore {
    secrets: HashMap<String, String>,
}

impl Keystore {
    pub fn new(secrets: HashMap<String, String>) -> Keystore {
        Keystore { secrets }
    }

    fn secret_for(&self, public_key: &str) -> Option<&str> {
        self.secrets.get(public_key).map(String::as_str)
    }
}

/// Returns `true` when `addr` should bypass signature verification (§4.F
/// step 2: "the request does not originate from a trusted loopback
/// address").
pub fn is_trusted_loopback(addr: Option<IpAddr>) -> bool {
    matches!(addr, Some(ip) if ip.is_loopback())
}

/// Verifies the request's `X-Request-Signature` against the HMAC over
/// `method‖path‖body`, using the secret named by `X-Public-Key`. Missing
/// header, unknown public key, or a signature mismatch all report the same
/// `Unauthorized` error so a prober can't distinguish the cause (§7).
pub fn verify(
    keystore: &Keystore,
    public_key: Option<&str>,
    signature: Option<&str>,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<(), AppError> {
    let public_key = public_key.ok_or_else(|| AppError::Unauthorized("missing X-Public-Key".into()))?;
    let signature = signature.ok_or_else(|| AppError::Unauthorized("missing X-Request-Signature".into()))?;
    let secret = keystore
        .secret_for(public_key)
        .ok_or_else(|| AppError::Unauthorized("unknown public key".into()))?;

    let expected = sign(secret, method, path, body);
    if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        return Err(AppError::Unauthorized("signature mismatch".into()));
    }
    Ok(())
}

/// Computes `hex(HMAC-SHA1(secret, method‖path‖body))` (§6).
pub fn sign(secret: &str, method: &str, path: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Byte-for-byte comparison in time proportional to length, not to the
/// position of the first mismatch, so timing can't leak how much of a
/// forged signature was correct.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystore() -> Keystore {
        Keystore::new(HashMap::from([("pub-1".to_string(), "s3cr3t".to_string())]))
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let ks = keystore();
        let sig = sign("s3cr3t", "POST", "/photo", b"{}");
        assert!(verify(&ks, Some("pub-1"), Some(&sig), "POST", "/photo", b"{}").is_ok());
    }

    #[test]
    fn verify_rejects_wrong_signature() {
        let ks = keystore();
        let err = verify(&ks, Some("pub-1"), Some("deadbeef"), "POST", "/photo", b"{}").unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");
    }

    #[test]
    fn verify_rejects_unknown_public_key() {
        let ks = keystore();
        let sig = sign("s3cr3t", "POST", "/photo", b"{}");
        let err = verify(&ks, Some("nope"), Some(&sig), "POST", "/photo", b"{}").unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");
    }

    #[test]
    fn verify_rejects_missing_headers() {
        let ks = keystore();
        assert!(verify(&ks, None, Some("x"), "GET", "/", b"").is_err());
        assert!(verify(&ks, Some("pub-1"), None, "GET", "/", b"").is_err());
    }

    #[test]
    fn loopback_detection() {
        assert!(is_trusted_loopback(Some("127.0.0.1".parse().unwrap())));
        assert!(is_trusted_loopback(Some("::1".parse().unwrap())));
        assert!(!is_trusted_loopback(Some("10.0.0.5".parse().unwrap())));
        assert!(!is_trusted_loopback(None));
    }

    #[test]
    fn sign_changes_with_any_input() {
        let base = sign("secret", "GET", "/a", b"{}");
        assert_ne!(base, sign("secret", "POST", "/a", b"{}"));
        assert_ne!(base, sign("secret", "GET", "/b", b"{}"));
        assert_ne!(base, sign("secret", "GET", "/a", b"{\"x\":1}"));
    }
}
