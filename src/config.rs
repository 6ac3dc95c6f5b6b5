//! Environment-based Configuration for the Bridge Client
//!
//! All deployment-specific values come from environment variables. Program
//! addresses default to the devnet deployment only on devnet; every other
//! network requires them explicitly.
//!
//! # Environment Variables
//!
//! ## Network Configuration
//! - `BRIDGE_NETWORK` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `BRIDGE_SOLANA_RPC` - Solana RPC endpoint URL
//! - `BRIDGE_BITCOIN_RPC` - Bitcoin/Esplora API endpoint URL
//!
//! ## Program IDs (must match deployed contracts)
//! - `BRIDGE_RELAY_PROGRAM_ID` - BTC header relay program
//! - `BRIDGE_SWAP_PROGRAM_ID` - swap escrow program
//!
//! ## Signing
//! - `BRIDGE_SIGNER_KEY` - JSON byte-array keypair (id.json contents)
//! - `BRIDGE_SIGNER_KEY_FILE` - path to an id.json keypair file
//!
//! ## Optional Settings
//! - `BRIDGE_DB_PATH` - SQLite path for the cleanup ledger
//! - `BRIDGE_PRIORITY_FEE` - compute unit price in micro-lamports
//! - `BRIDGE_LOG_LEVEL` - logging level (debug, info, warn, error)

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("network mismatch: expected {0}, got {1}")]
    NetworkMismatch(String, String),

    #[error("signer key unavailable: {0}")]
    SignerUnavailable(String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "BRIDGE_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get default Solana RPC for this network
    pub fn default_solana_rpc(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
        }
    }

    /// Get default Bitcoin/Esplora API for this network
    pub fn default_bitcoin_api(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://blockstream.info/api",
            Network::Testnet => "https://blockstream.info/testnet/api",
            Network::Devnet => "https://blockstream.info/testnet/api",
        }
    }

    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet | Network::Devnet => bitcoin::Network::Testnet,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Network environment
    pub network: Network,

    /// Solana RPC endpoint
    pub solana_rpc: String,

    /// Bitcoin/Esplora API endpoint
    pub bitcoin_api: String,

    /// BTC header relay program ID
    pub relay_program_id: String,

    /// Swap escrow program ID
    pub swap_program_id: String,

    /// SQLite path for the cleanup ledger
    pub db_path: String,

    /// Compute unit price in micro-lamports (0 disables priority fees)
    pub priority_fee: u64,

    /// Log level
    pub log_level: String,
}

impl BridgeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("BRIDGE_NETWORK")
            .unwrap_or_else(|_| "devnet".to_string())
            .parse()?;

        let solana_rpc = env::var("BRIDGE_SOLANA_RPC")
            .unwrap_or_else(|_| network.default_solana_rpc().to_string());

        let bitcoin_api = env::var("BRIDGE_BITCOIN_RPC")
            .unwrap_or_else(|_| network.default_bitcoin_api().to_string());

        let relay_program_id = get_required_or_devnet_default(
            "BRIDGE_RELAY_PROGRAM_ID",
            "8wTPp99NtoCt9q9V2xARfYZkaZfzBg9SS72u3qHZSiyP",
            network,
        )?;

        let swap_program_id = get_required_or_devnet_default(
            "BRIDGE_SWAP_PROGRAM_ID",
            "EEa6uwX8wrNCX9zMPDruhmd5HxbQsxzzJnNQUfo3y7jS",
            network,
        )?;

        let db_path = env::var("BRIDGE_DB_PATH").unwrap_or_else(|_| "btcbridge.db".to_string());

        let priority_fee = env::var("BRIDGE_PRIORITY_FEE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let log_level = env::var("BRIDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            network,
            solana_rpc,
            bitcoin_api,
            relay_program_id,
            swap_program_id,
            db_path,
            priority_fee,
            log_level,
        })
    }

    /// Load the submitter keypair from `BRIDGE_SIGNER_KEY` or
    /// `BRIDGE_SIGNER_KEY_FILE` (standard id.json byte-array format).
    pub fn load_signer(&self) -> Result<solana_sdk::signature::Keypair, ConfigError> {
        let raw = match env::var("BRIDGE_SIGNER_KEY") {
            Ok(inline) => inline,
            Err(_) => {
                let path = env::var("BRIDGE_SIGNER_KEY_FILE")
                    .map_err(|_| ConfigError::MissingEnvVar("BRIDGE_SIGNER_KEY".to_string()))?;
                std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::SignerUnavailable(format!("{}: {}", path, e)))?
            }
        };

        let bytes: Vec<u8> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::SignerUnavailable(format!("not a byte array: {}", e)))?;
        solana_sdk::signature::Keypair::from_bytes(&bytes)
            .map_err(|e| ConfigError::SignerUnavailable(e.to_string()))
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.network != Network::Mainnet {
            return Err(ConfigError::NetworkMismatch(
                "mainnet".to_string(),
                format!("{:?}", self.network),
            ));
        }
        Ok(())
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Bridge Configuration ===");
        println!("Network: {:?}", self.network);
        println!("Solana RPC: {}", self.solana_rpc);
        println!("Bitcoin API: {}", self.bitcoin_api);
        println!("Relay Program: {}", self.relay_program_id);
        println!("Swap Program: {}", self.swap_program_id);
        println!("Ledger DB: {}", self.db_path);
        println!("Priority Fee: {} ulamports/cu", self.priority_fee);
        println!("Log Level: {}", self.log_level);
        println!("============================");
    }
}

/// Get required env var, or use default for devnet only
fn get_required_or_devnet_default(
    var_name: &str,
    devnet_default: &str,
    network: Network,
) -> Result<String, ConfigError> {
    match env::var(var_name) {
        Ok(value) => Ok(value),
        Err(_) => {
            if network == Network::Devnet {
                Ok(devnet_default.to_string())
            } else {
                Err(ConfigError::MissingEnvVar(var_name.to_string()))
            }
        }
    }
}
