//! Target network selection.
//!
//! Everything network-bound in walgo (RPC endpoints, tool contexts, pricing
//! fallbacks) keys off this enum. Tool invocations always pass the context
//! explicitly; relying on a tool's default context is forbidden.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The Sui/Walrus network a deployment targets.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    Default,
    Display,
    EnumString,
    Serialize,
    Deserialize,
    ValueEnum,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Testnet,
    Mainnet,
}

impl Network {
    /// The JSON-RPC endpoint for this network.
    pub fn rpc_url(&self) -> &'static str {
        match self {
            Network::Testnet => "https://fullnode.testnet.sui.io:443",
            Network::Mainnet => "https://fullnode.mainnet.sui.io:443",
        }
    }

    /// The `--context` value passed to the walrus and site-builder CLIs.
    pub fn context(&self) -> &'static str {
        match self {
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    /// Normalize a `sui client` active-env name.
    ///
    /// Sui envs are free-form strings; anything that isn't recognizably
    /// mainnet is routed to testnet pricing.
    pub fn from_active_env(env: &str) -> Self {
        if env.to_ascii_lowercase().contains("mainnet") {
            Network::Mainnet
        } else {
            Network::Testnet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("mainnet", Network::Mainnet; "exact mainnet")]
    #[test_case("sui-mainnet", Network::Mainnet; "prefixed mainnet")]
    #[test_case("testnet", Network::Testnet; "exact testnet")]
    #[test_case("localnet", Network::Testnet; "unknown env routes to testnet")]
    #[test]
    fn normalize_active_env(env: &str, expected: Network) {
        self::assert_eq!(Network::from_active_env(env), expected);
    }

    #[test]
    fn context_round_trips_through_strum() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!(Network::Testnet.to_string(), "testnet");
    }
}
