//! Pre-flight WAL and SUI cost estimation.
//!
//! The estimator combines live data (reference gas price over JSON-RPC,
//! storage pricing from `walrus info --json`) with size heuristics to
//! produce a cost range before any transaction is signed. It never deploys
//! and it never fails on network errors: every live input has a hardcoded
//! per-network fallback.

use std::time::Duration;

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::{network::Network, proc, toolchain};

/// Smallest-unit denominations: 10⁹ MIST = 1 SUI, 10⁹ FROST = 1 WAL.
const UNIT_SCALE: f64 = 1e9;

/// Deadline for the reference-gas-price RPC.
const RPC_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for `walrus info --json`.
const WALRUS_INFO_DEADLINE: Duration = Duration::from_secs(30);

/// Default file size used to estimate a file count when none is supplied.
const DEFAULT_FILE_SIZE: u64 = 50 * 1024;

/// Gas computation units for the base publish transaction.
const BASE_COMPUTATION_UNITS: u64 = 1_000_000;

/// Additional gas computation units per uploaded file.
const PER_FILE_COMPUTATION_UNITS: u64 = 50_000;

/// On-chain storage bytes consumed per site resource entry.
const PER_FILE_STORAGE_BYTES: u64 = 200;

/// Sui storage price in MIST per storage unit.
const STORAGE_UNIT_PRICE: u64 = 76;

impl Network {
    /// Fallback reference gas price in MIST when the RPC is unreachable.
    fn default_gas_price(&self) -> u64 {
        match self {
            Network::Testnet => 1_000,
            Network::Mainnet => 750,
        }
    }
}

/// Live (or fallback) Walrus storage pricing, everything in FROST.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct StoragePricing {
    /// FROST per storage unit per epoch.
    pub storage_price_per_unit_epoch: u64,
    /// FROST per storage unit written.
    pub write_price_per_unit: u64,
    /// Fixed FROST cost for blob metadata.
    pub metadata_price: u64,
    /// Marginal FROST per unencoded MiB, as reported by the tool.
    pub marginal_price_per_mib: u64,
    /// Size of one storage unit in bytes.
    pub storage_unit_bytes: u64,
    /// Encoding expansion factor derived from the example-blob round trip,
    /// when the live tool reported one.
    pub encoding_multiplier: Option<f64>,
}

impl StoragePricing {
    /// Hardcoded fallback pricing. Mainnet storage runs roughly an order of
    /// magnitude above testnet.
    pub fn defaults(network: Network) -> Self {
        match network {
            Network::Testnet => Self {
                storage_price_per_unit_epoch: 11_000,
                write_price_per_unit: 20_000,
                metadata_price: 6_600_000,
                marginal_price_per_mib: 55_000,
                storage_unit_bytes: 1024 * 1024,
                encoding_multiplier: None,
            },
            Network::Mainnet => Self {
                storage_price_per_unit_epoch: 110_000,
                write_price_per_unit: 200_000,
                metadata_price: 66_000_000,
                marginal_price_per_mib: 550_000,
                storage_unit_bytes: 1024 * 1024,
                encoding_multiplier: None,
            },
        }
    }
}

/// Inputs to one estimate.
#[derive(Clone, Debug, Builder)]
pub struct EstimateParams {
    /// Unencoded site size in bytes.
    pub size_bytes: u64,
    /// Storage duration in epochs.
    pub epochs: u64,
    /// Number of files; estimated from size when omitted.
    pub file_count: Option<u64>,
    /// Target network, selecting endpoints and fallbacks.
    #[builder(default)]
    pub network: Network,
    /// Caller-supplied gas price in MIST. Zero means "use live/fallback".
    pub gas_price_override: Option<u64>,
}

/// The four output numbers of an estimate, with their ranges.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Storage + write + metadata cost in WAL.
    pub total_wal: f64,
    /// Gas + on-chain storage cost in SUI.
    pub total_sui: f64,
    pub wal_min: f64,
    pub wal_max: f64,
    pub sui_min: f64,
    pub sui_max: f64,
    /// Projected encoded size in bytes.
    pub encoded_bytes: u64,
    /// The gas price the estimate was computed with, in MIST.
    pub gas_price: u64,
}

impl CostEstimate {
    /// The human fee string persisted on project records.
    pub fn fee_string(&self) -> String {
        format!("{:.6} WAL + {:.6} SUI", self.total_wal, self.total_sui)
    }
}

/// Encoding-expansion bands for the size-keyed heuristic: bytes within each
/// band expand by the band's factor. Smaller blobs expand more; integrating
/// over bands keeps the projected encoded size monotone in the input size.
const EXPANSION_BANDS: &[(u64, f64)] = &[
    (1024 * 1024, 10.0),
    (10 * 1024 * 1024, 8.0),
    (50 * 1024 * 1024, 6.5),
    (200 * 1024 * 1024, 5.5),
    (500 * 1024 * 1024, 5.0),
    (u64::MAX, 4.5),
];

/// Project the encoded size for an unencoded input.
///
/// Uses the live multiplier when the tool reported one; otherwise the
/// size-keyed heuristic. No other fallback is used.
pub fn encoded_size(size_bytes: u64, pricing: &StoragePricing) -> u64 {
    if let Some(multiplier) = pricing.encoding_multiplier {
        return (size_bytes as f64 * multiplier).ceil() as u64;
    }

    let mut encoded = 0.0;
    let mut consumed = 0u64;
    for (limit, factor) in EXPANSION_BANDS {
        if size_bytes <= consumed {
            break;
        }
        let in_band = size_bytes.min(*limit) - consumed;
        encoded += in_band as f64 * factor;
        consumed += in_band;
    }
    encoded.ceil() as u64
}

/// Pure estimate arithmetic over resolved inputs.
///
/// WAL (in FROST, scaled down): `metadata + units × storagePrice × epochs +
/// units × writePrice` where `units = max(1, ceil(encoded / unitSize))`.
/// SUI (in MIST, scaled down): `(base + perFile × files) × gasPrice +
/// storageBytes × files × 100 × unitPrice`.
pub fn estimate(
    pricing: &StoragePricing,
    gas_price: u64,
    size_bytes: u64,
    epochs: u64,
    file_count: u64,
) -> CostEstimate {
    let encoded = encoded_size(size_bytes, pricing);
    let unit = pricing.storage_unit_bytes.max(1);
    let units = (encoded.div_ceil(unit)).max(1);

    let frost = pricing.metadata_price
        + units * pricing.storage_price_per_unit_epoch * epochs
        + units * pricing.write_price_per_unit;
    let total_wal = frost as f64 / UNIT_SCALE;

    let mist = (BASE_COMPUTATION_UNITS + PER_FILE_COMPUTATION_UNITS * file_count) * gas_price
        + PER_FILE_STORAGE_BYTES * file_count * 100 * STORAGE_UNIT_PRICE;
    let total_sui = mist as f64 / UNIT_SCALE;

    CostEstimate {
        total_wal,
        total_sui,
        wal_min: total_wal * 0.8,
        wal_max: total_wal * 1.2,
        sui_min: total_sui * 0.7,
        sui_max: total_sui * 1.5,
        encoded_bytes: encoded,
        gas_price,
    }
}

/// Fetch the reference gas price over JSON-RPC.
#[instrument]
pub async fn reference_gas_price(network: Network) -> Result<u64> {
    let client = reqwest::Client::builder()
        .timeout(RPC_DEADLINE)
        .build()
        .context("build http client")?;

    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "suix_getReferenceGasPrice",
        "params": [],
    });
    let response = client
        .post(network.rpc_url())
        .json(&body)
        .send()
        .await
        .context("send gas price rpc")?
        .error_for_status()
        .context("gas price rpc status")?
        .json::<Value>()
        .await
        .context("parse gas price rpc response")?;

    // The result is a string-encoded integer in MIST.
    response
        .get("result")
        .and_then(Value::as_str)
        .ok_or_eyre("gas price response has no result")?
        .parse::<u64>()
        .context("parse gas price")
}

/// Resolve the gas price for an estimate: a positive override wins, then the
/// live RPC, then the per-network fallback.
#[instrument]
pub async fn resolve_gas_price(network: Network, gas_price_override: Option<u64>) -> u64 {
    if let Some(price) = gas_price_override.filter(|price| *price > 0) {
        return price;
    }
    match reference_gas_price(network).await {
        Ok(price) => price,
        Err(err) => {
            warn!(?err, %network, "gas price rpc failed, using fallback");
            network.default_gas_price()
        }
    }
}

/// Fetch live storage pricing from `walrus info --json`, falling back to the
/// per-network defaults on any failure.
#[instrument]
pub async fn storage_pricing(network: Network) -> StoragePricing {
    let Some(walrus) = toolchain::resolve(toolchain::Tool::Walrus) else {
        warn!(%network, "walrus binary not found, using fallback pricing");
        return StoragePricing::defaults(network);
    };

    let result = proc::invoke_checked(
        &walrus,
        ["info", "--json", "--context", network.context()],
        WALRUS_INFO_DEADLINE,
    )
    .await;

    match result {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match parse_walrus_info(&stdout, network) {
                Ok(pricing) => pricing,
                Err(err) => {
                    warn!(?err, "unparseable walrus info output, using fallback pricing");
                    StoragePricing::defaults(network)
                }
            }
        }
        Err(err) => {
            warn!(?err, "walrus info failed, using fallback pricing");
            StoragePricing::defaults(network)
        }
    }
}

/// Parse the JSON document out of `walrus info --json` output.
///
/// The tool logs before printing JSON and may colorize, so each line is
/// stripped of ANSI escapes and the document starts at the first line whose
/// first character is `{`.
pub fn parse_walrus_info(stdout: &str, network: Network) -> Result<StoragePricing> {
    let mut lines = Vec::new();
    let mut in_json = false;
    for line in stdout.lines() {
        let clean = console::strip_ansi_codes(line);
        if !in_json && clean.trim_start().starts_with('{') {
            in_json = true;
        }
        if in_json {
            lines.push(clean.into_owned());
        }
    }
    if lines.is_empty() {
        bail!("no JSON document in walrus info output");
    }

    let doc: Value = serde_json::from_str(&lines.join("\n")).context("parse walrus info JSON")?;
    let defaults = StoragePricing::defaults(network);

    let lookup = |keys: &[&str]| -> Option<u64> {
        // Pricing fields appear either at the root or under price_info
        // depending on the tool version.
        for root in [&doc, doc.get("price_info").unwrap_or(&Value::Null)] {
            for key in keys {
                if let Some(value) = root.get(*key).and_then(Value::as_u64) {
                    return Some(value);
                }
            }
        }
        None
    };

    let encoding_multiplier = doc
        .get("example_blob_info")
        .and_then(Value::as_array)
        .and_then(|blobs| {
            let ratios = blobs
                .iter()
                .filter_map(|blob| {
                    let unencoded = blob.get("unencoded_size").and_then(Value::as_u64)?;
                    let encoded = blob.get("encoded_size").and_then(Value::as_u64)?;
                    (unencoded > 0).then(|| encoded as f64 / unencoded as f64)
                })
                .collect::<Vec<_>>();
            (!ratios.is_empty()).then(|| ratios.iter().sum::<f64>() / ratios.len() as f64)
        });

    let pricing = StoragePricing {
        storage_price_per_unit_epoch: lookup(&["storage_price_per_unit_size", "storage_price"])
            .unwrap_or(defaults.storage_price_per_unit_epoch),
        write_price_per_unit: lookup(&["write_price_per_unit_size", "write_price"])
            .unwrap_or(defaults.write_price_per_unit),
        metadata_price: lookup(&["metadata_price", "metadata_fee"])
            .unwrap_or(defaults.metadata_price),
        marginal_price_per_mib: lookup(&["marginal_price", "marginal_price_per_mib"])
            .unwrap_or(defaults.marginal_price_per_mib),
        storage_unit_bytes: lookup(&["storage_unit_size"]).unwrap_or(defaults.storage_unit_bytes),
        encoding_multiplier,
    };
    debug!(?pricing, "parsed walrus info pricing");
    Ok(pricing)
}

/// Estimate the cost of a full deployment.
#[instrument(skip(params))]
pub async fn estimate_deploy(params: &EstimateParams) -> CostEstimate {
    let gas_price = resolve_gas_price(params.network, params.gas_price_override).await;
    let pricing = storage_pricing(params.network).await;
    let file_count = params
        .file_count
        .unwrap_or_else(|| (params.size_bytes / DEFAULT_FILE_SIZE).max(1));
    estimate(&pricing, gas_price, params.size_bytes, params.epochs, file_count)
}

/// Estimate the cost of an incremental update: the same arithmetic over the
/// changed bytes and the count of new files.
#[instrument(skip(params))]
pub async fn estimate_update(params: &EstimateParams) -> CostEstimate {
    estimate_deploy(params).await
}

/// Estimate the gas for destroying a site object: a single transaction with
/// no storage purchase.
#[instrument]
pub async fn estimate_destroy(network: Network, gas_price_override: Option<u64>) -> CostEstimate {
    let gas_price = resolve_gas_price(network, gas_price_override).await;
    let total_sui = (BASE_COMPUTATION_UNITS * gas_price) as f64 / UNIT_SCALE;
    CostEstimate {
        total_wal: 0.0,
        total_sui,
        wal_min: 0.0,
        wal_max: 0.0,
        sui_min: total_sui * 0.7,
        sui_max: total_sui * 1.5,
        encoded_bytes: 0,
        gas_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn wal_is_monotone_in_size_and_epochs() {
        let pricing = StoragePricing::defaults(Network::Testnet);
        let base = estimate(&pricing, 1_000, 10 * MIB, 5, 20);

        let bigger = estimate(&pricing, 1_000, 20 * MIB, 5, 20);
        assert!(bigger.total_wal >= base.total_wal);

        let longer = estimate(&pricing, 1_000, 10 * MIB, 10, 20);
        assert!(longer.total_wal >= base.total_wal);

        // Ranges bracket the point estimate.
        assert!(base.wal_min <= base.total_wal && base.total_wal <= base.wal_max);
        assert!(base.sui_min <= base.total_sui && base.total_sui <= base.sui_max);
    }

    #[test]
    fn encoded_size_is_monotone_across_band_boundaries() {
        let pricing = StoragePricing::defaults(Network::Testnet);
        let mut previous = 0;
        for size in [0, MIB - 1, MIB, MIB + 1, 10 * MIB, 100 * MIB, 600 * MIB] {
            let encoded = encoded_size(size, &pricing);
            assert!(encoded >= previous, "encoded size regressed at {size}");
            previous = encoded;
        }

        // Small blobs expand by the top factor, huge blobs by much less.
        let small = encoded_size(MIB, &pricing) as f64 / MIB as f64;
        let huge = encoded_size(4_000 * MIB, &pricing) as f64 / (4_000 * MIB) as f64;
        assert!(small > 9.9 && small <= 10.0);
        assert!(huge < 5.0);
    }

    #[test]
    fn live_multiplier_overrides_heuristic() {
        let mut pricing = StoragePricing::defaults(Network::Testnet);
        pricing.encoding_multiplier = Some(5.0);
        assert_eq!(encoded_size(10 * MIB, &pricing), 50 * MIB);
    }

    #[test]
    fn minimum_one_storage_unit_is_billed() {
        let pricing = StoragePricing::defaults(Network::Testnet);
        let tiny = estimate(&pricing, 1_000, 1, 1, 1);
        let expected_frost = pricing.metadata_price
            + pricing.storage_price_per_unit_epoch
            + pricing.write_price_per_unit;
        assert_eq!(tiny.total_wal, expected_frost as f64 / 1e9);
    }

    #[test]
    fn mainnet_fallback_is_roughly_ten_times_testnet() {
        let testnet = StoragePricing::defaults(Network::Testnet);
        let mainnet = StoragePricing::defaults(Network::Mainnet);
        assert_eq!(
            mainnet.storage_price_per_unit_epoch,
            testnet.storage_price_per_unit_epoch * 10
        );
    }

    #[test]
    fn parses_walrus_info_behind_log_lines_and_ansi() {
        let stdout = concat!(
            "2026-08-01T10:00:00Z INFO walrus: connecting\n",
            "\u{1b}[32mINFO\u{1b}[0m fetched system state\n",
            "{\n",
            "  \"storage_unit_size\": 1048576,\n",
            "  \"price_info\": {\n",
            "    \"storage_price_per_unit_size\": 12000,\n",
            "    \"write_price_per_unit_size\": 21000,\n",
            "    \"metadata_price\": 7000000,\n",
            "    \"marginal_price\": 60000\n",
            "  },\n",
            "  \"example_blob_info\": [\n",
            "    {\"unencoded_size\": 1048576, \"encoded_size\": 7340032}\n",
            "  ]\n",
            "}\n"
        );
        let pricing = parse_walrus_info(stdout, Network::Testnet).unwrap();
        assert_eq!(pricing.storage_price_per_unit_epoch, 12000);
        assert_eq!(pricing.write_price_per_unit, 21000);
        assert_eq!(pricing.metadata_price, 7000000);
        assert_eq!(pricing.storage_unit_bytes, 1048576);
        assert_eq!(pricing.encoding_multiplier, Some(7.0));
    }

    #[test]
    fn missing_json_is_an_error_not_a_panic() {
        assert!(parse_walrus_info("only log lines here", Network::Testnet).is_err());
    }

    #[tokio::test]
    async fn positive_override_wins_without_any_rpc() {
        assert_eq!(resolve_gas_price(Network::Testnet, Some(750)).await, 750);
    }

    #[tokio::test]
    async fn zero_override_means_unset() {
        // Zero falls through to the live price or, failing that, the
        // per-network default; either way zero itself is never used.
        let price = resolve_gas_price(Network::Testnet, Some(0)).await;
        assert!(price > 0);
    }

    #[test]
    fn fee_string_format() {
        let pricing = StoragePricing::defaults(Network::Testnet);
        let estimate = estimate(&pricing, 1_000, MIB, 1, 2);
        let fee = estimate.fee_string();
        assert!(fee.contains("WAL + "), "unexpected fee string: {fee}");
        assert!(fee.ends_with("SUI"), "unexpected fee string: {fee}");
    }
}
