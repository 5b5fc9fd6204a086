//! The site configuration file, `walgo.yaml`.
//!
//! The file is owned by the site author and carries settings for subsystems
//! outside this engine (generator integration, compression toggles). The
//! deployment engine reads `walrus.project_id` to detect updates and writes
//! it back after a successful deployment, preserving every other key.
//!
//! On the next run, this file is the canonical source for the deployed
//! object id; the resource manifest and the project ledger are consulted
//! only when it has no answer.

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::instrument;

use crate::fs;

/// Name of the site configuration file at the site root.
pub const SITE_CONFIG_FILE: &str = "walgo.yaml";

/// The `walrus:` section of the site configuration.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct WalrusSection {
    /// The deployed site object id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Storage duration to purchase, in epochs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u64>,
    /// Whether to Brotli-compress text assets before upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
}

/// Read the `walrus:` section from the site configuration, if the file and
/// section exist.
#[instrument]
pub async fn load_walrus_section(
    site_root: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<Option<WalrusSection>> {
    let path = site_root.as_ref().join(SITE_CONFIG_FILE);
    let Some(raw) = fs::read_buffered_utf8(&path).await? else {
        return Ok(None);
    };

    let doc: Value = serde_yaml::from_str(&raw).context("parse site config")?;
    match doc.get("walrus") {
        Some(section) => serde_yaml::from_value(section.clone())
            .context("parse walrus section")
            .map(Some),
        None => Ok(None),
    }
}

/// Write the deployed object id into `walrus.project_id`, creating the file
/// or section as needed and preserving every other key.
#[instrument]
pub async fn write_object_id(
    site_root: impl AsRef<Utf8Path> + std::fmt::Debug,
    object_id: &str,
) -> Result<()> {
    let path = site_root.as_ref().join(SITE_CONFIG_FILE);
    let raw = fs::read_buffered_utf8(&path).await?;

    let mut doc = match raw {
        Some(raw) => serde_yaml::from_str::<Value>(&raw).context("parse site config")?,
        None => Value::Mapping(Mapping::new()),
    };
    let root = match doc {
        Value::Mapping(ref mut mapping) => mapping,
        _ => color_eyre::eyre::bail!("site config is not a YAML mapping"),
    };

    let walrus = root
        .entry(Value::String("walrus".to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Value::Mapping(walrus) = walrus else {
        color_eyre::eyre::bail!("walrus section is not a YAML mapping");
    };
    walrus.insert(
        Value::String("project_id".to_string()),
        Value::String(object_id.to_string()),
    );

    let serialized = serde_yaml::to_string(&doc).context("serialize site config")?;
    fs::write(&path, serialized).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    fn site() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let (_dir, root) = site();
        assert_eq!(load_walrus_section(&root).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_back_preserves_unrelated_keys() {
        let (_dir, root) = site();
        fs::write(
            root.join(SITE_CONFIG_FILE),
            "hugo:\n  theme: paper\nwalrus:\n  epochs: 12\n  compress: true\n",
        )
        .await
        .unwrap();

        write_object_id(&root, "0xfeedbeef").await.unwrap();

        let section = load_walrus_section(&root).await.unwrap().unwrap();
        assert_eq!(section.project_id.as_deref(), Some("0xfeedbeef"));
        assert_eq!(section.epochs, Some(12));
        assert_eq!(section.compress, Some(true));

        let raw = fs::read_buffered_utf8(root.join(SITE_CONFIG_FILE)).await.unwrap().unwrap();
        assert!(raw.contains("theme: paper"), "hugo keys must survive: {raw}");
    }

    #[tokio::test]
    async fn write_back_creates_missing_file() {
        let (_dir, root) = site();
        write_object_id(&root, "0xabc").await.unwrap();
        let section = load_walrus_section(&root).await.unwrap().unwrap();
        assert_eq!(section.project_id.as_deref(), Some("0xabc"));
    }
}
