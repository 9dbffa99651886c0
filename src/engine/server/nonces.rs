// Used-nonce registry behind POST /nonce and the form relay.
//
// A claim is atomic: the first caller for a nonce gets `Claimed`, every
// later one `Reused`, until the record ages out after NONCE_RECORD_TTL_SECS.

use crate::atoms::constants::NONCE_RECORD_TTL_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::NonceClaim;
use crate::engine::gate::NonceRegistrar;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_NONCE_LEN: usize = 256;

/// A nonce must be a non-empty string of printable ASCII.
pub fn is_valid_nonce(nonce: &str) -> bool {
    !nonce.is_empty() && nonce.len() <= MAX_NONCE_LEN && nonce.bytes().all(|b| b.is_ascii_graphic())
}

pub struct NonceRegistry {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for NonceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(NONCE_RECORD_TTL_SECS))
    }
}

impl NonceRegistry {
    pub fn new(ttl: Duration) -> Self {
        NonceRegistry { ttl, seen: Mutex::new(HashMap::new()) }
    }

    pub fn claim(&self, nonce: &str) -> NonceClaim {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        match seen.get(nonce) {
            Some(at) if now.duration_since(*at) < self.ttl => {
                warn!("[server] Nonce reuse rejected");
                NonceClaim::Reused
            }
            _ => {
                seen.insert(nonce.to_string(), now);
                NonceClaim::Claimed
            }
        }
    }

    pub fn is_claimed(&self, nonce: &str) -> bool {
        self.seen
            .lock()
            .get(nonce)
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Drop records past their TTL. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, at| at.elapsed() < self.ttl);
        let removed = before - seen.len();
        if removed > 0 {
            debug!("[server] Pruned {} expired nonces", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NonceRegistrar for NonceRegistry {
    async fn register(&self, nonce: &str) -> EngineResult<NonceClaim> {
        Ok(self.claim(nonce))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_a_reuse() {
        let reg = NonceRegistry::default();
        assert_eq!(reg.claim("n-1"), NonceClaim::Claimed);
        assert_eq!(reg.claim("n-1"), NonceClaim::Reused);
        assert_eq!(reg.claim("n-2"), NonceClaim::Claimed);
        assert!(reg.is_claimed("n-1"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn expired_records_free_the_nonce() {
        let reg = NonceRegistry::new(Duration::ZERO);
        assert_eq!(reg.claim("n"), NonceClaim::Claimed);
        assert!(!reg.is_claimed("n"));
        assert_eq!(reg.claim("n"), NonceClaim::Claimed);
        assert_eq!(reg.prune(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn nonce_format() {
        assert!(is_valid_nonce("4f1c2e9a"));
        assert!(!is_valid_nonce(""));
        assert!(!is_valid_nonce("has space"));
        assert!(!is_valid_nonce(&"a".repeat(MAX_NONCE_LEN + 1)));
    }

    #[tokio::test]
    async fn registrar_trait_claims() {
        let reg = NonceRegistry::default();
        let registrar: &dyn NonceRegistrar = &reg;
        assert_eq!(registrar.register("x").await.unwrap(), NonceClaim::Claimed);
        assert_eq!(registrar.register("x").await.unwrap(), NonceClaim::Reused);
    }
}
