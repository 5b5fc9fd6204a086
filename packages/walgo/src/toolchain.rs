//! Locating, version-checking, and installing the external toolchain.
//!
//! The orchestrator depends on three binaries it does not ship: the
//! site-builder packager, the walrus CLI, and the sui client. Hugo is listed
//! for diagnostics but is optional: the deployment engine consumes a finished
//! build directory and never needs it itself.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use lazy_regex::regex_captures;
use serde::Deserialize;
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, instrument, trace, warn};

use crate::{fs, network::Network, proc};

/// Deadline for one `suiup install` of a dependency.
const INSTALL_DEADLINE: Duration = Duration::from_secs(120);

/// Deadline for a `--version` probe.
const VERSION_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for a release-API query.
const RELEASE_API_DEADLINE: Duration = Duration::from_secs(10);

/// The closed set of external tools walgo knows about.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Tool {
    SiteBuilder,
    Walrus,
    Sui,
    Hugo,
}

impl Tool {
    /// The binary name to search for.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::SiteBuilder => "site-builder",
            Tool::Walrus => "walrus",
            Tool::Sui => "sui",
            Tool::Hugo => "hugo",
        }
    }

    /// Human description shown by `walgo doctor`.
    pub fn description(&self) -> &'static str {
        match self {
            Tool::SiteBuilder => "packages and publishes sites to Walrus",
            Tool::Walrus => "Walrus storage CLI (pricing, blob status)",
            Tool::Sui => "Sui client (wallet, gas, transactions)",
            Tool::Hugo => "static site generator (optional)",
        }
    }

    /// Whether a deployment can proceed without this tool.
    pub fn required(&self) -> bool {
        !matches!(self, Tool::Hugo)
    }

    /// The suiup release channel for this tool on the given network.
    ///
    /// site-builder is only released on the mainnet channel; the walrus and
    /// sui CLIs follow the caller's network.
    pub fn install_channel(&self, network: Network) -> Option<&'static str> {
        match self {
            Tool::SiteBuilder => Some("mainnet"),
            Tool::Walrus | Tool::Sui => Some(network.context()),
            Tool::Hugo => None,
        }
    }

    /// The canonical release API for the tool, used by the mainnet version
    /// check.
    fn release_api(&self) -> Option<&'static str> {
        match self {
            Tool::SiteBuilder => {
                Some("https://api.github.com/repos/MystenLabs/walrus-sites/releases/latest")
            }
            Tool::Walrus => Some("https://api.github.com/repos/MystenLabs/walrus/releases/latest"),
            Tool::Sui => Some("https://api.github.com/repos/MystenLabs/sui/releases/latest"),
            Tool::Hugo => None,
        }
    }

    /// Every known tool.
    pub fn all() -> impl Iterator<Item = Tool> {
        Tool::iter()
    }
}

/// What the resolver knows about one tool.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ToolStatus {
    pub tool: Tool,
    /// Absolute path of the resolved binary, when found.
    pub path: Option<Utf8PathBuf>,
    /// Version string reported by `--version`, when parseable.
    pub version: Option<String>,
}

impl ToolStatus {
    pub fn installed(&self) -> bool {
        self.path.is_some()
    }
}

/// Resolve a tool to an absolute path.
///
/// Search order: the OS PATH, then the per-user local bin, then the
/// platform's system bin directories. The first hit that is a regular file
/// (and executable, on POSIX) wins, so a PATH installation always shadows a
/// local-bin one.
#[instrument]
pub fn resolve(tool: Tool) -> Option<Utf8PathBuf> {
    resolve_binary(tool.binary_name())
}

fn resolve_binary(name: &str) -> Option<Utf8PathBuf> {
    let candidate = candidate_name(name);

    let path_dirs = std::env::var_os("PATH")
        .map(|path| {
            std::env::split_paths(&path)
                .filter_map(|dir| Utf8PathBuf::try_from(dir).ok())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let local_bin = fs::user_local_bin_path().ok();
    let system_dirs = system_bin_dirs();

    path_dirs
        .iter()
        .chain(local_bin.iter())
        .chain(system_dirs.iter())
        .map(|dir| dir.join(&candidate))
        .find(|path| is_usable(path))
        .inspect(|path| trace!(%name, %path, "resolved tool"))
}

fn candidate_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn system_bin_dirs() -> Vec<Utf8PathBuf> {
    if cfg!(windows) {
        [r"C:\Program Files", r"C:\Program Files (x86)"]
            .iter()
            .map(Utf8PathBuf::from)
            .collect()
    } else {
        ["/usr/local/bin", "/usr/bin", "/bin", "/opt/homebrew/bin"]
            .iter()
            .map(Utf8PathBuf::from)
            .collect()
    }
}

/// A binary is usable if it is a regular file; POSIX additionally requires
/// the executable bit. Windows path lookups are case-insensitive at the
/// filesystem level, which covers the case-folding requirement there.
fn is_usable(path: &Utf8Path) -> bool {
    let Ok(meta) = path.symlink_metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    if cfg!(windows) {
        true
    } else {
        is_executable::is_executable(path.as_std_path())
    }
}

/// Probe a binary's version by running `<tool> --version` and parsing the
/// first line of output.
#[instrument]
pub async fn version_of(binary: &Utf8Path) -> Result<Option<String>> {
    let output = proc::invoke_output(binary, ["--version"], VERSION_DEADLINE)
        .await
        .context("run version probe")?;
    Ok(extract_version(&proc::first_stdout_line(&output)))
}

/// Extract a version from free-form `--version` output.
///
/// Prefers a three-part semantic version; falls back to two parts for tools
/// that omit the patch number.
pub fn extract_version(line: &str) -> Option<String> {
    if let Some((_, version)) = regex_captures!(r"(\d+\.\d+\.\d+)", line) {
        return Some(version.to_string());
    }
    regex_captures!(r"(\d+\.\d+)", line).map(|(_, version)| version.to_string())
}

/// Full status for one tool: resolution plus version probe.
#[instrument]
pub async fn status(tool: Tool) -> ToolStatus {
    let path = resolve(tool);
    let version = match &path {
        Some(path) => version_of(path).await.unwrap_or_else(|err| {
            warn!(%tool, ?err, "version probe failed");
            None
        }),
        None => None,
    };
    ToolStatus { tool, path, version }
}

/// Status for every known tool.
#[instrument]
pub async fn status_all() -> Vec<ToolStatus> {
    let mut statuses = Vec::new();
    for tool in Tool::all() {
        statuses.push(status(tool).await);
    }
    statuses
}

/// Where the suiup release publishes per-platform binaries.
const SUIUP_RELEASE_BASE: &str = "https://github.com/MystenLabs/suiup/releases/latest/download";

fn suiup_asset_name() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => "suiup-linux-x86_64.gz",
        ("linux", "aarch64") => "suiup-linux-aarch64.gz",
        ("macos", "x86_64") => "suiup-macos-x86_64.gz",
        ("macos", "aarch64") => "suiup-macos-aarch64.gz",
        ("windows", _) => "suiup-windows-x86_64.exe.gz",
        _ => "suiup-linux-x86_64.gz",
    }
}

/// Locate suiup, downloading it into the per-user local bin if absent.
#[instrument]
pub async fn ensure_suiup() -> Result<Utf8PathBuf> {
    if let Some(path) = resolve_binary("suiup") {
        return Ok(path);
    }

    let bin_dir = fs::user_local_bin_path().context("locate local bin")?;
    fs::create_dir_all(&bin_dir).await?;
    let target = bin_dir.join(candidate_name("suiup"));

    let url = format!("{SUIUP_RELEASE_BASE}/{}", suiup_asset_name());
    debug!(%url, %target, "downloading suiup");

    let client = reqwest::Client::builder()
        .timeout(INSTALL_DEADLINE)
        .build()
        .context("build http client")?;
    let response = client
        .get(&url)
        .send()
        .await
        .context("download suiup")?
        .error_for_status()
        .context("suiup release download")?;
    let compressed = response.bytes().await.context("read suiup download")?;

    let binary = {
        use async_compression::tokio::bufread::GzipDecoder;
        use tokio::io::AsyncReadExt;
        let mut decoder = GzipDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.context("decompress suiup")?;
        out
    };
    fs::write(&target, &binary).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(target.as_std_path(), perms)
            .await
            .context("mark suiup executable")?;
    }

    Ok(target)
}

/// Install the deployment toolchain through suiup.
///
/// Each logical tool is installed from its network-appropriate channel, then
/// set as the suiup default so the bare binary name resolves to the selected
/// channel.
#[instrument]
pub async fn install(network: Network, tools: &[Tool]) -> Result<()> {
    let suiup = ensure_suiup().await.context("ensure suiup")?;

    for tool in tools {
        let Some(channel) = tool.install_channel(network) else {
            debug!(%tool, "tool is not managed by suiup, skipping");
            continue;
        };
        let spec = format!("{}@{channel}", tool.binary_name());

        debug!(%spec, "installing tool");
        proc::invoke_checked(&suiup, ["install", spec.as_str(), "--yes"], INSTALL_DEADLINE)
            .await
            .with_context(|| format!("install {spec}"))?;
        proc::invoke_checked(&suiup, ["default", "set", spec.as_str()], INSTALL_DEADLINE)
            .await
            .with_context(|| format!("set default {spec}"))?;
    }
    Ok(())
}

/// The outcome of comparing an installed tool against its latest release.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct VersionCheck {
    pub tool: Tool,
    pub installed: String,
    pub latest: String,
    pub outdated: bool,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

/// Query the tool's release API and compare against the installed version.
///
/// Used for mainnet deployments only; a network failure here is advisory and
/// surfaces as `Ok(None)` after a warning.
#[instrument]
pub async fn check_latest(tool: Tool) -> Result<Option<VersionCheck>> {
    let Some(api) = tool.release_api() else {
        return Ok(None);
    };
    let Some(path) = resolve(tool) else {
        return Ok(None);
    };
    let Some(installed) = version_of(&path).await? else {
        return Ok(None);
    };

    let client = reqwest::Client::builder()
        .timeout(RELEASE_API_DEADLINE)
        .user_agent("walgo")
        .build()
        .context("build http client")?;
    let release = match client.get(api).send().await {
        Ok(response) => response
            .error_for_status()
            .context("release api status")?
            .json::<ReleaseResponse>()
            .await
            .context("parse release api response")?,
        Err(err) => {
            warn!(%tool, ?err, "release api unreachable, skipping version check");
            return Ok(None);
        }
    };

    let latest = extract_version(&release.tag_name)
        .ok_or_eyre("release tag carries no version")?;
    let outdated = compare_versions(&installed, &latest) == std::cmp::Ordering::Less;
    Ok(Some(VersionCheck { tool, installed, latest, outdated }))
}

/// Compare two dotted version strings segment by segment.
///
/// Pre-release suffixes (`-rc.1`, `+build`) are stripped before comparison.
/// Missing segments compare as zero, so `1.2` == `1.2.0`.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    fn segments(version: &str) -> Vec<u64> {
        let stripped = version
            .split(['-', '+'])
            .next()
            .unwrap_or(version);
        stripped
            .split('.')
            .map(|segment| segment.parse::<u64>().unwrap_or(0))
            .collect()
    }

    let (a, b) = (segments(a), segments(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Ensure every required tool resolves, or fail with the full list of
/// missing tools.
#[instrument]
pub async fn ensure_required() -> Result<Vec<ToolStatus>> {
    let statuses = status_all().await;
    let missing = statuses
        .iter()
        .filter(|status| status.tool.required() && !status.installed())
        .map(|status| status.tool.binary_name())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        bail!(
            "missing required tools: {} (run `walgo doctor install`)",
            missing.join(", ")
        );
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::cmp::Ordering;

    #[test_case("site-builder 1.2.3", Some("1.2.3"); "plain semver")]
    #[test_case("walrus 1.40.1-rc.2 (build abc)", Some("1.40.1"); "semver with prerelease")]
    #[test_case("sui 1.40", Some("1.40"); "two part fallback")]
    #[test_case("no digits here", None; "no version")]
    #[test]
    fn version_extraction(line: &str, expected: Option<&str>) {
        self::assert_eq!(extract_version(line).as_deref(), expected);
    }

    #[test_case("1.2.3", "1.2.3", Ordering::Equal; "equal")]
    #[test_case("1.2", "1.2.0", Ordering::Equal; "missing segment is zero")]
    #[test_case("1.2.3", "1.10.0", Ordering::Less; "numeric not lexicographic")]
    #[test_case("2.0.0", "1.99.99", Ordering::Greater; "major wins")]
    #[test_case("1.2.3-rc.1", "1.2.3", Ordering::Equal; "prerelease stripped")]
    #[test]
    fn version_comparison(a: &str, b: &str, expected: Ordering) {
        self::assert_eq!(compare_versions(a, b), expected);
    }

    #[test]
    fn site_builder_always_installs_from_mainnet() {
        assert_eq!(Tool::SiteBuilder.install_channel(Network::Testnet), Some("mainnet"));
        assert_eq!(Tool::SiteBuilder.install_channel(Network::Mainnet), Some("mainnet"));
        assert_eq!(Tool::Walrus.install_channel(Network::Testnet), Some("testnet"));
        assert_eq!(Tool::Sui.install_channel(Network::Mainnet), Some("mainnet"));
        assert_eq!(Tool::Hugo.install_channel(Network::Mainnet), None);
    }

    #[test]
    fn path_resolution_prefers_earlier_dirs() {
        // `sh` exists in a system bin dir on any POSIX host; resolution must
        // return an absolute path to a regular executable file.
        #[cfg(unix)]
        {
            let path = resolve_binary("sh").expect("sh resolves");
            assert!(path.is_absolute());
            assert!(is_usable(&path));
        }
    }

    #[test]
    fn hugo_is_optional() {
        assert!(!Tool::Hugo.required());
        assert!(Tool::SiteBuilder.required());
    }
}
