//! Signed, self-expiring session leases.
//!
//! Every connection this client opens carries a lease in its
//! database-visible session label:
//!
//! ```text
//! s=<service>;i=<instance>;e=<expiry-ms>;g=<signature>
//! ```
//!
//! The signature is the first 8 bytes of HMAC-SHA256 over the preceding
//! fields, base64 url-safe without padding (11 characters). Peers sharing
//! the coordination secret can verify a label locally and terminate the
//! session once the lease has expired; sessions they cannot verify are left
//! alone. The database never validates leases.
//!
//! The whole label must fit the 63-byte session-label truncation limit, so
//! service and instance names are sanitized and, when they would not fit,
//! replaced with a hash-disambiguated prefix.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use sha1::Digest;
use sha1::Sha1;
use sha2::Sha256;

use crate::config::TetherConfig;
use crate::error::ConfigSnafu;
use crate::error::InvariantViolationSnafu;
use crate::error::Result;
use crate::time::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Database session-label truncation limit.
pub const MAX_LABEL_LEN: usize = 63;

/// Signature length: 8 MAC bytes, base64 url-safe, no padding.
const SIG_CHARS: usize = 11;

/// MAC bytes kept from the full HMAC-SHA256 output.
const SIG_BYTES: usize = 8;

/// Fixed label overhead: the `s=`/`;i=`/`;e=`/`;g=` framing (11 bytes) plus
/// a 13-digit millisecond timestamp.
const FIXED_OVERHEAD: usize = 24;

/// Longest instance component ever embedded in a label.
const INSTANCE_MAX_LEN: usize = 16;

/// A successfully verified lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLease {
    /// Service component of the label.
    pub service: String,
    /// Instance component of the label.
    pub instance: String,
    /// Expiry the label was signed with.
    pub expires_at_ms: u64,
    /// Whether the expiry lies in the past of the verifying clock.
    pub is_expired: bool,
}

/// Mints and verifies lease labels for one `(service, instance)` identity.
pub struct LeaseManager {
    secret: Vec<u8>,
    service: String,
    instance: String,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    /// Build a manager from validated configuration.
    ///
    /// Fails when the secret is absent or shorter than
    /// [`TetherConfig::MIN_SECRET_LEN`], or when the normalized identity
    /// could never fit a label.
    pub fn from_config(config: &TetherConfig, instance_id: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let secret = config.coordination_secret.as_deref().unwrap_or("");
        Self::new(secret, &config.service_name, instance_id, clock)
    }

    pub fn new(secret: &str, service: &str, instance: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if secret.len() < TetherConfig::MIN_SECRET_LEN {
            return ConfigSnafu {
                message: format!(
                    "coordination secret must be at least {} bytes",
                    TetherConfig::MIN_SECRET_LEN
                ),
            }
            .fail();
        }
        let instance = normalize_component(instance, INSTANCE_MAX_LEN);
        let max_service_len = MAX_LABEL_LEN
            .checked_sub(FIXED_OVERHEAD + instance.len() + SIG_CHARS)
            .unwrap_or(0);
        if max_service_len < 1 {
            return InvariantViolationSnafu {
                message: format!("no label budget left for a service name (instance `{instance}`)"),
            }
            .fail();
        }
        let service = normalize_component(service, max_service_len);
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            service,
            instance,
            clock,
        })
    }

    /// The normalized service component embedded in every minted label.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The normalized instance component embedded in every minted label.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Label prefix shared by every lease of this service, for the reaper's
    /// coarse scan filter.
    pub fn service_prefix(&self) -> String {
        format!("s={};", self.service)
    }

    /// Mint a signed label expiring at `expires_at_ms`.
    ///
    /// The 63-byte bound is asserted, not silently truncated: identity
    /// normalization already guarantees it, so exceeding it here is a bug.
    pub fn mint(&self, expires_at_ms: u64) -> Result<String> {
        let base = format!("s={};i={};e={}", self.service, self.instance, expires_at_ms);
        let label = format!("{base};g={}", self.sign(&base));
        if label.len() > MAX_LABEL_LEN {
            return InvariantViolationSnafu {
                message: format!("minted label is {} bytes, limit is {MAX_LABEL_LEN}", label.len()),
            }
            .fail();
        }
        Ok(label)
    }

    /// Parse a label and verify its signature against the local secret.
    ///
    /// Returns `None` on any structural mismatch, bad signature, or
    /// unparsable expiry. A `None` from a reaper scan means "not ours to
    /// judge", possibly a neighbor service using a different secret.
    pub fn parse_and_verify(&self, label: &str) -> Option<VerifiedLease> {
        let rest = label.strip_prefix("s=")?;
        let (service, rest) = rest.split_once(";i=")?;
        let (instance, rest) = rest.split_once(";e=")?;
        let (expiry, sig) = rest.split_once(";g=")?;
        if service.is_empty() || instance.is_empty() || expiry.is_empty() || sig.is_empty() {
            return None;
        }
        // The fields are [^;]+ in the wire format; a stray separator means
        // the label is not one of ours.
        if [service, instance, expiry, sig].iter().any(|f| f.contains(';')) {
            return None;
        }

        let base = &label[..label.len() - sig.len() - 3];
        let expected = self.sign(base);
        if !constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
            return None;
        }

        let expires_at_ms: u64 = expiry.parse().ok()?;
        Some(VerifiedLease {
            service: service.to_string(),
            instance: instance.to_string(),
            expires_at_ms,
            is_expired: self.clock.now_ms() > expires_at_ms,
        })
    }

    fn sign(&self, base: &str) -> String {
        // HMAC-SHA256 accepts any key length per RFC 2104.
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size per RFC 2104");
        mac.update(base.as_bytes());
        let digest = mac.finalize().into_bytes();
        URL_SAFE_NO_PAD.encode(&digest[..SIG_BYTES])
    }
}

// The secret stays out of logs.
impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("service", &self.service)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Replace everything outside `[A-Za-z0-9:_-]` with `_`.
pub(crate) fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-') { c } else { '_' })
        .collect()
}

/// Normalize a label component to `max_len` bytes.
///
/// A name that sanitizes cleanly and fits is used verbatim. Otherwise it
/// becomes `<prefix>-<hash8>`, where `hash8` is the first 8 hex characters
/// of SHA-1 over the *original* text, so distinct raw names that sanitize
/// or truncate to the same token stay distinguishable.
fn normalize_component(raw: &str, max_len: usize) -> String {
    let sanitized = sanitize(raw);
    if !sanitized.is_empty() && sanitized == raw && sanitized.len() <= max_len {
        return sanitized;
    }

    let hash8 = sha1_hex8(raw);
    if max_len <= hash8.len() + 1 {
        return hash8[..max_len.min(hash8.len())].to_string();
    }
    let prefix: String = sanitized.chars().take(max_len - hash8.len() - 1).collect();
    format!("{prefix}-{hash8}")
}

fn sha1_hex8(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in &digest[..4] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Compare fixed-format MACs without leaking a mismatch position.
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
    use proptest::prelude::*;

    use super::*;
    use crate::time::SystemClock;
    use crate::time::current_time_ms;

    const SECRET: &str = "secret-1234567890";

    fn manager(service: &str, instance: &str) -> LeaseManager {
        LeaseManager::new(SECRET, service, instance, Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_mint_round_trips() {
        let mgr = manager("mysvc", "inst-1");
        let exp = current_time_ms() + 10_000;
        let label = mgr.mint(exp).unwrap();

        assert!(label.len() <= MAX_LABEL_LEN);
        assert!(label.starts_with("s=mysvc;i=inst-1;e="));

        let lease = mgr.parse_and_verify(&label).unwrap();
        assert_eq!(lease.service, "mysvc");
        assert_eq!(lease.instance, "inst-1");
        assert_eq!(lease.expires_at_ms, exp);
        assert!(!lease.is_expired);
    }

    #[test]
    fn test_signature_is_eleven_chars() {
        let mgr = manager("mysvc", "inst-1");
        let label = mgr.mint(current_time_ms()).unwrap();
        let sig = label.rsplit_once(";g=").unwrap().1;
        assert_eq!(sig.len(), 11);
    }

    #[test]
    fn test_expired_lease_detected() {
        let mgr = manager("mysvc", "inst-1");
        let label = mgr.mint(current_time_ms().saturating_sub(5_000)).unwrap();
        assert!(mgr.parse_and_verify(&label).unwrap().is_expired);
    }

    #[test]
    fn test_short_secret_rejected() {
        let err = LeaseManager::new("short", "svc", "inst", Arc::new(SystemClock));
        assert!(err.is_err());
        let err = LeaseManager::new("", "svc", "inst", Arc::new(SystemClock));
        assert!(err.is_err());
    }

    #[test]
    fn test_tampered_instance_rejected() {
        let mgr = manager("mysvc", "inst-1");
        let label = mgr.mint(current_time_ms() + 10_000).unwrap();
        let tampered = label.replace("i=inst-1", "i=hacker");
        assert!(mgr.parse_and_verify(&tampered).is_none());
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let ours = manager("mysvc", "inst-1");
        let theirs =
            LeaseManager::new("another-secret-xyz", "mysvc", "inst-1", Arc::new(SystemClock)).unwrap();
        let label = theirs.mint(current_time_ms() + 10_000).unwrap();
        assert!(ours.parse_and_verify(&label).is_none());
    }

    #[test]
    fn test_structural_garbage_rejected() {
        let mgr = manager("mysvc", "inst-1");
        for label in [
            "",
            "psql",
            "s=mysvc",
            "s=mysvc;i=inst-1",
            "s=mysvc;i=inst-1;e=123",
            "s=;i=inst-1;e=123;g=AAAAAAAAAAA",
            "s=mysvc;i=;e=123;g=AAAAAAAAAAA",
            "s=mysvc;i=inst-1;e=;g=AAAAAAAAAAA",
            "s=mysvc;i=inst-1;e=123;g=",
        ] {
            assert!(mgr.parse_and_verify(label).is_none(), "{label:?} must be rejected");
        }
    }

    #[test]
    fn test_non_numeric_expiry_rejected() {
        let mgr = manager("mysvc", "inst-1");
        // Correctly signed label whose expiry still fails to parse: the
        // structural and signature checks pass, the numeric check rejects.
        for expiry in ["NaN", "1e13", "-5", "184467440737095516160"] {
            let base = format!("s=mysvc;i=inst-1;e={expiry}");
            let forged = format!("{base};g={}", mgr.sign(&base));
            assert!(mgr.parse_and_verify(&forged).is_none(), "e={expiry} must be rejected");
        }
    }

    #[test]
    fn test_sanitization_replaces_bad_chars() {
        assert_eq!(sanitize("my svc!"), "my_svc_");
        assert_eq!(sanitize("a:b_c-d9"), "a:b_c-d9");
    }

    #[test]
    fn test_normalization_disambiguates_collisions() {
        // Both raw names sanitize to the same token; hashes must differ.
        let a = normalize_component("svc one", 28);
        let b = normalize_component("svc,one", 28);
        assert_ne!(a, b);
        assert!(a.starts_with("svc_one-"));
        assert!(b.starts_with("svc_one-"));
    }

    #[test]
    fn test_normalization_keeps_clean_names() {
        assert_eq!(normalize_component("checkout", 28), "checkout");
    }

    #[test]
    fn test_normalization_never_yields_empty_component() {
        let normalized = normalize_component("", 16);
        assert!(!normalized.is_empty());
        let label_ready = normalize_component("???", 16);
        assert!(!label_ready.is_empty());
        assert!(!label_ready.contains(';'));
    }

    #[test]
    fn test_service_prefix_shape() {
        let mgr = manager("mysvc", "inst-1");
        assert_eq!(mgr.service_prefix(), "s=mysvc;");
    }

    proptest! {
        /// Any printable-ASCII service and instance names up to 200 bytes
        /// mint a label within the limit that verifies with the normalized
        /// instance.
        #[test]
        fn test_label_length_invariant(
            service in "[ -~]{1,200}",
            instance in "[ -~]{1,200}",
        ) {
            let mgr = LeaseManager::new(SECRET, &service, &instance, Arc::new(SystemClock)).unwrap();
            let label = mgr.mint(current_time_ms() + 60_000).unwrap();
            prop_assert!(label.len() <= MAX_LABEL_LEN);

            let lease = mgr.parse_and_verify(&label);
            prop_assert!(lease.is_some());
            let lease = lease.unwrap();
            prop_assert_eq!(lease.instance.as_str(), mgr.instance());
        }

        /// Flipping any single character of the signed fields invalidates
        /// the label.
        #[test]
        fn test_single_character_tampering_rejected(idx in 0usize..40) {
            let mgr = LeaseManager::new(SECRET, "mysvc", "inst-1", Arc::new(SystemClock)).unwrap();
            let label = mgr.mint(1_999_999_999_999).unwrap();
            let base_len = label.rfind(";g=").unwrap();
            prop_assume!(idx < base_len);

            let mut bytes = label.clone().into_bytes();
            let original = bytes[idx];
            bytes[idx] = if original == b'x' { b'y' } else { b'x' };
            prop_assume!(bytes[idx] != original);

            let tampered = String::from_utf8(bytes).unwrap();
            prop_assert!(mgr.parse_and_verify(&tampered).is_none());
        }

        /// Leases expire exactly by timestamp comparison.
        #[test]
        fn test_expiration_monotonicity(offset in 1u64..1_000_000) {
            let mgr = LeaseManager::new(SECRET, "mysvc", "inst-1", Arc::new(SystemClock)).unwrap();
            let now = current_time_ms();

            let past = mgr.mint(now.saturating_sub(offset)).unwrap();
            prop_assert!(mgr.parse_and_verify(&past).unwrap().is_expired);

            let future = mgr.mint(now + offset + 60_000).unwrap();
            prop_assert!(!mgr.parse_and_verify(&future).unwrap().is_expired);
        }
    }
}
