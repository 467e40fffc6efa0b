use std::collections::HashMap;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

/// Quota tiers selectable by the deterministic derivation. These tables are
/// a deployment constant: every node must ship the identical values or
/// nodes would disagree on a key's limits.
const INPUT_TPM_TIERS: [u64; 7] = [10_000, 20_000, 40_000, 60_000, 100_000, 500_000, 1_000_000];
const OUTPUT_TPM_TIERS: [u64; 7] = [5_000, 10_000, 20_000, 30_000, 60_000, 250_000, 500_000];
const RPM_TIERS: [u64; 7] = [60, 100, 200, 500, 1_000, 5_000, 10_000];

const CONFIG_CACHE_CAPACITY: u64 = 10_000;

/// Rate limit configuration for one API key.
///
/// Immutable for the process lifetime of the key.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub input_tpm: u64,
    pub output_tpm: u64,
    pub rpm: u64,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.input_tpm == 0 || self.output_tpm == 0 || self.rpm == 0 {
            return Err("rate limits must be positive integers".to_string());
        }
        Ok(())
    }
}

/// Maps an API key to its `RateLimitConfig` without any cross-node
/// coordination: identical key, identical config, on every node.
///
/// Resolution order: static override table, then deterministic derivation
/// from a 128-bit hash of the key. The cache is advisory only; resolution is
/// pure, so a stale or missing entry can never change an admission outcome.
pub struct ConfigResolver {
    overrides: HashMap<String, RateLimitConfig>,
    ceiling: RateLimitConfig,
    cache: Cache<String, RateLimitConfig>,
}

impl ConfigResolver {
    pub fn new(overrides: HashMap<String, RateLimitConfig>, ceiling: RateLimitConfig) -> Self {
        Self {
            overrides,
            ceiling,
            cache: Cache::new(CONFIG_CACHE_CAPACITY),
        }
    }

    pub fn resolve(&self, api_key: &str) -> RateLimitConfig {
        if let Some(config) = self.overrides.get(api_key) {
            return *config;
        }
        if let Some(config) = self.cache.get(api_key) {
            return config;
        }
        let config = self.derive(api_key);
        self.cache.insert(api_key.to_string(), config);
        config
    }

    /// Derive a config from disjoint 16-bit fields of a blake3 digest,
    /// clamped to the deployment ceilings.
    fn derive(&self, api_key: &str) -> RateLimitConfig {
        let digest = blake3::hash(api_key.as_bytes());
        let bytes = digest.as_bytes();
        let field = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;

        RateLimitConfig {
            input_tpm: INPUT_TPM_TIERS[field(0) % INPUT_TPM_TIERS.len()].min(self.ceiling.input_tpm),
            output_tpm: OUTPUT_TPM_TIERS[field(2) % OUTPUT_TPM_TIERS.len()]
                .min(self.ceiling.output_tpm),
            rpm: RPM_TIERS[field(4) % RPM_TIERS.len()].min(self.ceiling.rpm),
        }
    }
}

/// The default ceiling permits every tier.
pub fn default_ceiling() -> RateLimitConfig {
    RateLimitConfig {
        input_tpm: INPUT_TPM_TIERS[INPUT_TPM_TIERS.len() - 1],
        output_tpm: OUTPUT_TPM_TIERS[OUTPUT_TPM_TIERS.len() - 1],
        rpm: RPM_TIERS[RPM_TIERS.len() - 1],
    }
}
