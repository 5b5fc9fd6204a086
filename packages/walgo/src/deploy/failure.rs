//! Classification of packager failures.
//!
//! site-builder failures surface as free-form text. The recognizable classes
//! each carry a curated remediation so the user isn't left staring at a
//! blockchain stack trace. Unrecognized failures propagate verbatim.

use color_eyre::{Section, eyre::eyre};
use strum::Display;

/// Known failure signatures in site-builder output.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum FailureKind {
    /// The network could not gather enough storage-node confirmations.
    Confirmations,
    /// The signer wallet cannot cover the WAL or gas cost.
    InsufficientFunds,
    /// The tool could not parse its own configuration.
    ConfigMismatch,
    /// No usable wallet was found.
    WalletMissing,
    /// The RPC endpoint rejected the request rate.
    RateLimited,
}

impl FailureKind {
    /// Scan combined tool output for a known failure signature.
    pub fn classify(output: &str) -> Option<Self> {
        let haystack = output.to_ascii_lowercase();
        let matches = |needle: &str| haystack.contains(needle);

        if matches("could not retrieve enough confirmations") {
            Some(Self::Confirmations)
        } else if matches("insufficient funds") || matches("insufficientgas") {
            Some(Self::InsufficientFunds)
        } else if matches("data did not match any variant") {
            Some(Self::ConfigMismatch)
        } else if matches("wallet not found") || matches("cannot open wallet") {
            Some(Self::WalletMissing)
        } else if matches("request rejected `429`") || matches("rate limit") {
            Some(Self::RateLimited)
        } else {
            None
        }
    }

    /// The curated remediation for this failure class.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Confirmations => {
                "The storage network is congested or briefly unreachable. \
                 Wait a minute and re-run the deployment; already-uploaded blobs are \
                 content-addressed and will not be re-uploaded."
            }
            Self::InsufficientFunds => {
                "The signer wallet cannot cover the cost. Acquire WAL (and SUI for gas) \
                 for the active address, then re-run. `walgo estimate` shows the expected cost."
            }
            Self::ConfigMismatch => {
                "The walrus client configuration does not match the tool version. \
                 Regenerate the config files under the walrus config directory or \
                 reinstall the toolchain with `walgo doctor install`."
            }
            Self::WalletMissing => {
                "No usable Sui wallet was found. Initialize one with `sui client` \
                 and make sure its active env matches the target network."
            }
            Self::RateLimited => {
                "The RPC endpoint is rate-limiting this client. Back off for a few \
                 minutes or configure a dedicated RPC endpoint before retrying."
            }
        }
    }
}

/// Build a user-facing error from failed packager output.
///
/// Classified failures carry their remediation as a suggestion; everything
/// else propagates with the raw output attached.
pub fn classified_error(output: &str, status: std::process::ExitStatus) -> color_eyre::Report {
    let tail = output
        .lines()
        .rev()
        .take(20)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");

    match FailureKind::classify(output) {
        Some(kind) => eyre!("site-builder failed ({status}): {kind}")
            .suggestion(kind.remediation())
            .section(tail),
        None => eyre!("site-builder failed ({status})").section(tail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case(
        "error: could not retrieve enough confirmations to certify blob",
        Some(FailureKind::Confirmations);
        "confirmations"
    )]
    #[test_case(
        "Error: InsufficientGas in transaction execution",
        Some(FailureKind::InsufficientFunds);
        "insufficient gas"
    )]
    #[test_case(
        "thread panicked: data did not match any variant of untagged enum",
        Some(FailureKind::ConfigMismatch);
        "config mismatch"
    )]
    #[test_case("Cannot open wallet at ~/.sui/sui_config", Some(FailureKind::WalletMissing); "wallet")]
    #[test_case("Request rejected `429` too many requests", Some(FailureKind::RateLimited); "rate limit")]
    #[test_case("some novel explosion", None; "unknown output")]
    #[test]
    fn classification(output: &str, expected: Option<FailureKind>) {
        self::assert_eq!(FailureKind::classify(output), expected);
    }

    #[test]
    fn every_kind_has_a_remediation() {
        for kind in [
            FailureKind::Confirmations,
            FailureKind::InsufficientFunds,
            FailureKind::ConfigMismatch,
            FailureKind::WalletMissing,
            FailureKind::RateLimited,
        ] {
            assert!(!kind.remediation().is_empty());
        }
    }
}
