//! Pre-flight checks before a deployment touches the network.
//!
//! Everything here is diagnostic: missing balances or an unreachable network
//! produce warnings, not errors, because the signer may get funded or the
//! network may recover out-of-band. The only hard requirement, the presence
//! of the required tools, is enforced by the orchestrator itself right
//! before invocation.

use std::time::Duration;

use color_eyre::Result;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::{
    network::Network,
    proc,
    toolchain::{self, Tool, ToolStatus},
};

/// Deadline for the network ping through `walrus info`.
const PING_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for sui client queries (address, env, balances).
const SUI_DEADLINE: Duration = Duration::from_secs(30);

/// Signer wallet balances, as human strings from the sui client.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct BalanceReport {
    pub sui: Option<String>,
    pub wal: Option<String>,
}

/// Everything the pre-flight pass learned.
#[derive(Clone, Debug)]
pub struct PreflightReport {
    /// Status of site-builder, walrus, and sui.
    pub tools: Vec<ToolStatus>,
    /// Whether `walrus info` answered on the requested network.
    pub network_reachable: bool,
    /// The sui client's active address, when available.
    pub active_address: Option<String>,
    /// The sui client's active env, normalized to a network.
    pub active_network: Option<Network>,
    pub balances: BalanceReport,
    /// Human-readable findings that don't block deployment.
    pub warnings: Vec<String>,
}

impl PreflightReport {
    /// Required tools that did not resolve.
    pub fn missing_required(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .filter(|status| status.tool.required() && !status.installed())
            .map(|status| status.tool)
            .collect()
    }
}

/// Run the pre-flight pass for a target network.
#[instrument]
pub async fn run(network: Network) -> Result<PreflightReport> {
    let mut report = PreflightReport {
        tools: Vec::new(),
        network_reachable: false,
        active_address: None,
        active_network: None,
        balances: BalanceReport::default(),
        warnings: Vec::new(),
    };

    for tool in [Tool::SiteBuilder, Tool::Walrus, Tool::Sui] {
        let status = toolchain::status(tool).await;
        if !status.installed() && tool.required() {
            report
                .warnings
                .push(format!("{} is not installed ({})", tool, tool.description()));
        }
        report.tools.push(status);
    }

    // Network ping through the storage tool; its failure is advisory.
    if let Some(walrus) = toolchain::resolve(Tool::Walrus) {
        match proc::invoke_checked(
            &walrus,
            ["info", "--context", network.context()],
            PING_DEADLINE,
        )
        .await
        {
            Ok(_) => report.network_reachable = true,
            Err(err) => {
                warn!(?err, %network, "walrus network ping failed");
                report
                    .warnings
                    .push(format!("walrus could not reach {network}: {err:#}"));
            }
        }
    }

    if let Some(sui) = toolchain::resolve(Tool::Sui) {
        match proc::invoke_checked(&sui, ["client", "active-address"], SUI_DEADLINE).await {
            Ok(output) => {
                let address = proc::first_stdout_line(&output);
                if !address.is_empty() {
                    report.active_address = Some(address);
                }
            }
            Err(err) => {
                warn!(?err, "could not read active address");
                report.warnings.push(format!("sui active address unavailable: {err:#}"));
            }
        }

        match proc::invoke_checked(&sui, ["client", "active-env"], SUI_DEADLINE).await {
            Ok(output) => {
                let env = proc::first_stdout_line(&output);
                let active = Network::from_active_env(&env);
                if active != network {
                    report.warnings.push(format!(
                        "sui active env is {env:?} but the deployment targets {network}"
                    ));
                }
                report.active_network = Some(active);
            }
            Err(err) => warn!(?err, "could not read active env"),
        }

        match proc::invoke_checked(&sui, ["client", "balance", "--json"], SUI_DEADLINE).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                match serde_json::from_str::<Value>(strip_to_json(&stdout)) {
                    Ok(doc) => report.balances = extract_balances(&doc),
                    Err(err) => warn!(?err, "unparseable balance output"),
                }
            }
            Err(err) => {
                // Balance absence is warned, never errored: the wallet may be
                // funded between now and the upload.
                warn!(?err, "balance query failed");
                report.warnings.push(format!("could not query balances: {err:#}"));
            }
        }
    }

    Ok(report)
}

/// Skip any log lines before the first JSON bracket.
fn strip_to_json(stdout: &str) -> &str {
    let start = stdout
        .find(['{', '['])
        .unwrap_or(0);
    &stdout[start..]
}

/// Search a balance document for SUI and WAL totals.
///
/// The sui client's balance JSON shape has changed across releases, so this
/// looks for any object carrying a coin type and a total balance rather than
/// assuming a structure.
fn extract_balances(doc: &Value) -> BalanceReport {
    let mut report = BalanceReport::default();
    collect_balances(doc, &mut report);
    report
}

fn collect_balances(value: &Value, report: &mut BalanceReport) {
    match value {
        Value::Object(map) => {
            let coin_type = map
                .get("coinType")
                .or_else(|| map.get("coin_type"))
                .and_then(Value::as_str);
            let total = map
                .get("totalBalance")
                .or_else(|| map.get("total_balance"))
                .map(|total| match total {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            if let (Some(coin_type), Some(total)) = (coin_type, total) {
                if coin_type.ends_with("::sui::SUI") {
                    report.sui.get_or_insert(total);
                } else if coin_type.ends_with("::wal::WAL") {
                    report.wal.get_or_insert(total);
                }
            } else {
                for nested in map.values() {
                    collect_balances(nested, report);
                }
            }
        }
        Value::Array(values) => {
            for nested in values {
                collect_balances(nested, report);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn balances_are_found_in_nested_output() {
        let doc: Value = serde_json::from_str(
            r#"
            [
              [
                [
                  {"coinType": "0x2::sui::SUI", "totalBalance": "5000000000"},
                  {"coinType": "0xabc::wal::WAL", "totalBalance": "1200000000"}
                ]
              ]
            ]
            "#,
        )
        .unwrap();
        let report = extract_balances(&doc);
        assert_eq!(report.sui.as_deref(), Some("5000000000"));
        assert_eq!(report.wal.as_deref(), Some("1200000000"));
    }

    #[test]
    fn missing_balances_stay_none() {
        let doc: Value = serde_json::from_str(r#"{"unrelated": true}"#).unwrap();
        let report = extract_balances(&doc);
        assert_eq!(report.sui, None);
        assert_eq!(report.wal, None);
    }

    #[test]
    fn log_lines_before_json_are_skipped() {
        let raw = "warning: client/server api mismatch\n[{\"coinType\": \"0x2::sui::SUI\"}]";
        assert!(strip_to_json(raw).starts_with('['));
    }
}
