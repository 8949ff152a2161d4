use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;

use crate::token_map::TokenMapResolver;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub evm: EvmConfig,
    pub solana: SolanaConfig,
    pub keyring: KeyringConfig,
    pub claims: ClaimsConfig,
    pub relayer: RelayerConfig,
    /// Optional external verification gateway. When unset, verification
    /// falls back to the settlement contract's finalized() read-back.
    pub verification: Option<VerificationConfig>,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// EVM chain configuration (settlement side)
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub settlement_address: String,
    pub private_key: String,
    pub finality_blocks: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("settlement_address", &self.settlement_address)
            .field("private_key", &"<redacted>")
            .field("finality_blocks", &self.finality_blocks)
            .finish()
    }
}

/// Solana chain configuration (origin side)
#[derive(Debug, Clone)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub program_id: String,
}

/// Versioned event encryption keys
#[derive(Clone)]
pub struct KeyringConfig {
    pub keys: HashMap<u32, [u8; 32]>,
    pub active_version: u32,
}

/// Custom Debug that never prints key material.
impl fmt::Debug for KeyringConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut versions: Vec<u32> = self.keys.keys().copied().collect();
        versions.sort_unstable();
        f.debug_struct("KeyringConfig")
            .field("versions", &versions)
            .field("active_version", &self.active_version)
            .finish()
    }
}

/// Solver claim parameters. Claim deadlines come from the settlement
/// contract's BridgeClaimed event, not from configuration.
#[derive(Debug, Clone)]
pub struct ClaimsConfig {
    /// Minimum bond (destination base units, decimal string)
    pub min_bond: String,
    /// Expired-claim reaper interval, in seconds
    pub reap_interval_secs: u64,
}

/// Relayer configuration
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Bounded intake channel capacity; monitors block when full
    pub intake_capacity: usize,
    pub token_mappings: TokenMapResolver,
}

/// Optional external verification gateway
#[derive(Clone)]
pub struct VerificationConfig {
    pub base_url: String,
    pub api_token: Option<String>,
}

impl fmt::Debug for VerificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// HTTP API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    /// Enables POST /dev/emit-line; never set in production
    pub dev_endpoints: bool,
}

/// Default functions
fn default_finality_blocks() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_intake_capacity() -> usize {
    256
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let evm = EvmConfig {
            rpc_url: env::var("EVM_RPC_URL")
                .map_err(|_| eyre!("EVM_RPC_URL environment variable is required"))?,
            chain_id: env::var("EVM_CHAIN_ID")
                .map_err(|_| eyre!("EVM_CHAIN_ID environment variable is required"))?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            settlement_address: env::var("EVM_SETTLEMENT_ADDRESS")
                .map_err(|_| eyre!("EVM_SETTLEMENT_ADDRESS environment variable is required"))?,
            private_key: env::var("EVM_PRIVATE_KEY")
                .map_err(|_| eyre!("EVM_PRIVATE_KEY environment variable is required"))?,
            finality_blocks: env::var("FINALITY_BLOCKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_finality_blocks()),
        };

        let solana = SolanaConfig {
            rpc_url: env::var("SOLANA_RPC_URL")
                .map_err(|_| eyre!("SOLANA_RPC_URL environment variable is required"))?,
            program_id: env::var("SOLANA_PROGRAM_ID")
                .map_err(|_| eyre!("SOLANA_PROGRAM_ID environment variable is required"))?,
        };

        let keyring = Self::load_keyring()?;

        let claims = ClaimsConfig {
            min_bond: env::var("CLAIM_MIN_BOND").unwrap_or_else(|_| "0".to_string()),
            reap_interval_secs: env::var("CLAIM_REAP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_reap_interval_secs()),
        };

        let token_mappings = match env::var("TOKEN_MAPPINGS") {
            Ok(raw) => TokenMapResolver::from_env_value(&raw)
                .wrap_err("TOKEN_MAPPINGS is malformed")?,
            Err(_) => TokenMapResolver::default(),
        };

        let relayer = RelayerConfig {
            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_poll_interval()),
            retry_attempts: env::var("RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_retry_attempts()),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_retry_delay()),
            intake_capacity: env::var("INTAKE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_intake_capacity()),
            token_mappings,
        };

        let verification = env::var("VERIFICATION_URL").ok().map(|base_url| {
            VerificationConfig {
                base_url,
                api_token: env::var("VERIFICATION_API_TOKEN").ok(),
            }
        });

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_api_port()),
            dev_endpoints: env::var("DEV_ENDPOINTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        };

        let config = Config {
            database,
            evm,
            solana,
            keyring,
            claims,
            relayer,
            verification,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Keyring sources, in precedence order:
    /// - EVENT_KEYS: "1=<64 hex>,2=<64 hex>" versioned list
    /// - EVENT_ENC_KEY_HEX: single key, becomes version 1
    fn load_keyring() -> Result<KeyringConfig> {
        if let Ok(raw) = env::var("EVENT_KEYS") {
            let keys = parse_event_keys(&raw)?;
            let active_version = env::var("EVENT_ACTIVE_KEY_VERSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .or_else(|| keys.keys().max().copied())
                .ok_or_else(|| eyre!("EVENT_KEYS contains no keys"))?;
            return Ok(KeyringConfig {
                keys,
                active_version,
            });
        }

        if let Ok(raw) = env::var("EVENT_ENC_KEY_HEX") {
            let key = parse_key_hex(&raw)
                .wrap_err("EVENT_ENC_KEY_HEX must be 64 hex chars (32 bytes)")?;
            let mut keys = HashMap::new();
            keys.insert(1, key);
            return Ok(KeyringConfig {
                keys,
                active_version: 1,
            });
        }

        Err(eyre!(
            "Either EVENT_KEYS or EVENT_ENC_KEY_HEX environment variable is required"
        ))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.evm.rpc_url.is_empty() {
            return Err(eyre!("evm.rpc_url cannot be empty"));
        }

        if self.evm.settlement_address.len() != 42 || !self.evm.settlement_address.starts_with("0x")
        {
            return Err(eyre!(
                "evm.settlement_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.evm.private_key.len() != 66 || !self.evm.private_key.starts_with("0x") {
            return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.solana.rpc_url.is_empty() {
            return Err(eyre!("solana.rpc_url cannot be empty"));
        }

        if self.solana.program_id.is_empty() {
            return Err(eyre!("solana.program_id cannot be empty"));
        }

        if self.keyring.keys.is_empty() {
            return Err(eyre!("keyring must contain at least one key"));
        }

        if !self.keyring.keys.contains_key(&self.keyring.active_version) {
            return Err(eyre!(
                "active key version {} is not present in the keyring",
                self.keyring.active_version
            ));
        }

        if alloy::primitives::U256::from_str_radix(&self.claims.min_bond, 10).is_err() {
            return Err(eyre!("claims.min_bond must be a decimal integer"));
        }

        if self.relayer.intake_capacity == 0 {
            return Err(eyre!("relayer.intake_capacity must be at least 1"));
        }

        Ok(())
    }
}

/// Parse the versioned keyring list: "1=<64 hex>,2=<64 hex>"
fn parse_event_keys(raw: &str) -> Result<HashMap<u32, [u8; 32]>> {
    let mut keys = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (version, hex_key) = entry
            .split_once('=')
            .ok_or_else(|| eyre!("EVENT_KEYS entry missing '=': {}", entry))?;
        let version: u32 = version
            .trim()
            .parse()
            .map_err(|_| eyre!("EVENT_KEYS entry has non-numeric version: {}", entry))?;
        let key = parse_key_hex(hex_key.trim())
            .wrap_err_with(|| format!("EVENT_KEYS entry for version {} is invalid", version))?;
        if keys.insert(version, key).is_some() {
            return Err(eyre!("EVENT_KEYS has duplicate version {}", version));
        }
    }
    if keys.is_empty() {
        return Err(eyre!("EVENT_KEYS cannot be empty"));
    }
    Ok(keys)
}

fn parse_key_hex(raw: &str) -> Result<[u8; 32]> {
    let hex_part = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(hex_part).wrap_err("key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|_| eyre!("key must be exactly 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut keys = HashMap::new();
        keys.insert(1, [0x11; 32]);
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            evm: EvmConfig {
                rpc_url: "http://localhost:8545".to_string(),
                chain_id: 11155111,
                settlement_address: "0x0000000000000000000000000000000000000001".to_string(),
                private_key:
                    "0x0000000000000000000000000000000000000000000000000000000000000001"
                        .to_string(),
                finality_blocks: 1,
            },
            solana: SolanaConfig {
                rpc_url: "http://localhost:8899".to_string(),
                program_id: "BridgeProg1111111111111111111111111111111111".to_string(),
            },
            keyring: KeyringConfig {
                keys,
                active_version: 1,
            },
            claims: ClaimsConfig {
                min_bond: "1000000".to_string(),
                reap_interval_secs: 30,
            },
            relayer: RelayerConfig {
                poll_interval_ms: 1000,
                retry_attempts: 3,
                retry_delay_ms: 5000,
                intake_capacity: 256,
                token_mappings: TokenMapResolver::default(),
            },
            verification: None,
            api: ApiConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                dev_endpoints: false,
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_finality_blocks(), 1);
        assert_eq!(default_poll_interval(), 1000);
        assert_eq!(default_retry_attempts(), 3);
        assert_eq!(default_retry_delay(), 5000);
        assert_eq!(default_intake_capacity(), 256);
        assert_eq!(default_reap_interval_secs(), 30);
    }

    #[test]
    fn test_validation() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        // Invalid private key length
        config.evm.private_key = "0x123".to_string();
        assert!(config.validate().is_err());

        // Invalid settlement address
        config.evm.private_key =
            "0x0000000000000000000000000000000000000000000000000000000000000001".to_string();
        config.evm.settlement_address = "invalid".to_string();
        assert!(config.validate().is_err());

        // Active key version must exist in the keyring
        config.evm.settlement_address =
            "0x0000000000000000000000000000000000000001".to_string();
        config.keyring.active_version = 9;
        assert!(config.validate().is_err());

        // Zero intake capacity is rejected
        config.keyring.active_version = 1;
        config.relayer.intake_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_event_keys() {
        let raw = format!("1={},2={}", "11".repeat(32), "22".repeat(32));
        let keys = parse_event_keys(&raw).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[&1], [0x11; 32]);
        assert_eq!(keys[&2], [0x22; 32]);

        assert!(parse_event_keys("").is_err());
        assert!(parse_event_keys("1=short").is_err());
        assert!(parse_event_keys("x=abcd").is_err());
        let dup = format!("1={},1={}", "11".repeat(32), "22".repeat(32));
        assert!(parse_event_keys(&dup).is_err());
    }

    #[test]
    fn test_parse_key_hex() {
        assert_eq!(parse_key_hex(&"aa".repeat(32)).unwrap(), [0xaa; 32]);
        assert_eq!(
            parse_key_hex(&format!("0x{}", "bb".repeat(32))).unwrap(),
            [0xbb; 32]
        );
        assert!(parse_key_hex("zz").is_err());
        assert!(parse_key_hex("aabb").is_err());
    }

    #[test]
    fn test_keyring_debug_redacts() {
        let config = test_config();
        let dbg = format!("{:?}", config.keyring);
        assert!(dbg.contains("versions"));
        assert!(!dbg.contains("11, 11"));
        let dbg = format!("{:?}", config.evm);
        assert!(dbg.contains("<redacted>"));
    }
}
