//! The resource manifest shipped inside the upload directory.
//!
//! `ws-resources.json` tells the Walrus gateway how to serve the site:
//! per-path HTTP headers, routing rules, ignore patterns, and display
//! metadata. The file is read by the external packager, so it must be
//! written before the upload phase runs.
//!
//! Serialization is deterministic: top-level keys keep a fixed order, header
//! maps are sorted by path, and routes are sorted lexicographically with the
//! wildcard `*` route emitted last. Updates to an existing manifest parse the
//! whole document as a generic map and mutate only the intended keys, so
//! unknown keys written by other tools survive a round trip.

use std::collections::{BTreeMap, BTreeSet};

use bon::Builder;
use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap};
use serde_json::Value;
use tracing::{instrument, trace, warn};

use crate::{cache::CACHE_DIR, fs};

/// Name of the manifest file inside the publish directory.
pub const RESOURCES_FILE: &str = "ws-resources.json";

/// Default `max-age` for immutable assets: one year.
pub const CACHE_LONG_SECS: u64 = 31_536_000;

/// Default `max-age` for everything else: five minutes.
pub const CACHE_SHORT_SECS: u64 = 300;

/// Ignore patterns always present in a generated manifest: platform metadata,
/// VCS files, and source maps.
const BUILTIN_IGNORE: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".git", "*.map"];

/// Basename patterns served with a long immutable cache lifetime. Ordered;
/// first match wins.
const IMMUTABLE_PATTERNS: &[&str] = &[
    "*.css", "*.js", "*.mjs", "*.woff", "*.woff2", "*.ttf", "*.otf", "*.png", "*.jpg", "*.jpeg",
    "*.gif", "*.webp", "*.avif", "*.svg", "*.ico", "*.wasm", "*.mp4", "*.webm", "*.mp3", "*.pdf",
];

/// Display metadata for the site object, rendered by portals.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct SiteMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl SiteMetadata {
    /// Fill blank fields with the documented defaults.
    pub fn with_defaults(mut self) -> Self {
        fn blank(field: &Option<String>) -> bool {
            field.as_deref().is_none_or(|s| s.trim().is_empty())
        }
        if blank(&self.description) {
            self.description = Some("Static site deployed to Walrus".to_string());
        }
        if blank(&self.creator) {
            self.creator = Some("walgo".to_string());
        }
        if blank(&self.category) {
            self.category = Some("website".to_string());
        }
        self
    }
}

/// The manifest document. Field order here is the serialization order.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ResourceManifest {
    /// Per-path HTTP headers, keyed by relative path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, BTreeMap<String, String>>,

    /// Patterns the gateway must not serve. A leading `/` anchors the
    /// pattern at the site root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,

    /// Routing table: request pattern to canonical resource.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        serialize_with = "serialize_routes"
    )]
    pub routes: BTreeMap<String, String>,

    /// Display metadata for portals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SiteMetadata>,

    /// The on-chain site object, once known. The legacy camelCase spelling
    /// is accepted on read for manifests written by older tools.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "objectId")]
    pub object_id: Option<String>,

    /// Human name for the site object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

/// Routes serialize lexicographically with the wildcard `*` key last, so the
/// consumer's first-match routing is deterministic.
fn serialize_routes<S: Serializer>(
    routes: &BTreeMap<String, String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(routes.len()))?;
    for (pattern, target) in routes.iter().filter(|(pattern, _)| pattern.as_str() != "*") {
        map.serialize_entry(pattern, target)?;
    }
    if let Some(target) = routes.get("*") {
        map.serialize_entry("*", target)?;
    }
    map.end()
}

impl ResourceManifest {
    /// Serialize the manifest deterministically.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize resource manifest")
    }

    /// Parse a manifest document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("parse resource manifest")
    }
}

/// Caller-supplied knobs for manifest generation.
#[derive(Clone, Debug, Builder)]
pub struct ResourceOptions {
    /// `max-age` for the immutable asset set.
    #[builder(default = CACHE_LONG_SECS)]
    pub cache_long_secs: u64,
    /// `max-age` for everything else.
    #[builder(default = CACHE_SHORT_SECS)]
    pub cache_short_secs: u64,
    /// Additional ignore patterns, appended after the built-in set.
    #[builder(default)]
    pub extra_ignore: Vec<String>,
    /// Emit one route per `<dir>/index.html` found in the tree.
    #[builder(default)]
    pub directory_routes: bool,
    /// Display metadata; blank fields get the documented defaults.
    pub metadata: Option<SiteMetadata>,
    /// Human name for the site object.
    pub site_name: Option<String>,
    /// Known site object id to carry into the manifest.
    pub object_id: Option<String>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Generate the manifest for a publish directory.
///
/// `compressed` is the set of relative paths the compression pass replaced
/// in place with a smaller Brotli variant; exactly those paths get a
/// `Content-Encoding: br` header.
#[instrument(skip(options, compressed))]
pub async fn generate(
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    options: &ResourceOptions,
    compressed: &BTreeSet<String>,
) -> Result<ResourceManifest> {
    let publish_dir = publish_dir.as_ref();
    let immutable = build_globset(IMMUTABLE_PATTERNS).context("build immutable globset")?;

    let (files, errors) = fs::walk_files(publish_dir).await?;
    for error in &errors {
        warn!(%error, "walk error during manifest generation");
    }

    let mut manifest = ResourceManifest {
        ignore: BUILTIN_IGNORE
            .iter()
            .map(|s| s.to_string())
            .chain(options.extra_ignore.iter().cloned())
            .collect(),
        metadata: options.metadata.clone().map(SiteMetadata::with_defaults),
        object_id: options.object_id.clone(),
        site_name: options.site_name.clone(),
        ..ResourceManifest::default()
    };

    let mut has_404 = false;
    let mut index_dirs = BTreeSet::new();
    for file in &files {
        let rel = file
            .strip_prefix(publish_dir)
            .with_context(|| format!("make {file:?} relative to {publish_dir:?}"))?
            .as_str()
            .replace('\\', "/");
        if rel == RESOURCES_FILE || rel == CACHE_DIR || rel.starts_with(&format!("{CACHE_DIR}/")) {
            continue;
        }

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), content_type(&rel).to_string());
        headers.insert(
            "Cache-Control".to_string(),
            cache_control(&rel, &immutable, options.cache_long_secs, options.cache_short_secs),
        );
        if compressed.contains(&rel) {
            headers.insert("Content-Encoding".to_string(), "br".to_string());
        }
        manifest.headers.insert(format!("/{rel}"), headers);

        if rel == "404.html" {
            has_404 = true;
        }
        if let Some(dir) = rel.strip_suffix("/index.html") {
            index_dirs.insert(dir.to_string());
        }
    }

    manifest.routes = routes(options.directory_routes, &index_dirs, has_404);

    trace!(
        headers = manifest.headers.len(),
        routes = manifest.routes.len(),
        "generated resource manifest"
    );
    Ok(manifest)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("parse glob {pattern:?}"))?);
    }
    builder.build().context("build globset")
}

/// The routing table for the generated manifest.
///
/// Root routes are always present. Directory routes are opt-in: one pair per
/// `<dir>/index.html`. The wildcard route exists only when the site ships a
/// top-level `404.html`.
fn routes(
    directory_routes: bool,
    index_dirs: &BTreeSet<String>,
    has_404: bool,
) -> BTreeMap<String, String> {
    let mut routes = BTreeMap::new();
    routes.insert("/".to_string(), "/index.html".to_string());
    routes.insert("/index.html".to_string(), "/index.html".to_string());

    if directory_routes {
        for dir in index_dirs {
            let canonical = format!("/{dir}/index.html");
            routes.insert(format!("/{dir}"), canonical.clone());
            routes.insert(format!("/{dir}/*"), canonical);
        }
    }
    if has_404 {
        routes.insert("*".to_string(), "/404.html".to_string());
    }
    routes
}

/// Content type by extension. Unknown extensions are served as opaque bytes.
fn content_type(path: &str) -> &'static str {
    let ext = Utf8Path::new(path)
        .extension()
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Cache lifetime by basename pattern.
///
/// Immutable assets get the long lifetime; HTML revalidates on the short
/// lifetime so content updates propagate; everything else just gets the
/// short lifetime.
fn cache_control(path: &str, immutable: &GlobSet, long: u64, short: u64) -> String {
    let basename = Utf8Path::new(path).file_name().unwrap_or(path);
    let is_html = Utf8Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"));

    if is_html {
        format!("public, max-age={short}, must-revalidate")
    } else if immutable.is_match(basename) {
        format!("public, max-age={long}, immutable")
    } else {
        format!("public, max-age={short}")
    }
}

/// Load the manifest from a publish directory, if present.
#[instrument]
pub async fn load(publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<Option<ResourceManifest>> {
    let path = publish_dir.as_ref().join(RESOURCES_FILE);
    match fs::read_buffered_utf8(&path).await? {
        Some(json) => ResourceManifest::from_json(&json).map(Some),
        None => Ok(None),
    }
}

/// Write the manifest into a publish directory.
#[instrument(skip(manifest))]
pub async fn write(
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    manifest: &ResourceManifest,
) -> Result<()> {
    let path = publish_dir.as_ref().join(RESOURCES_FILE);
    fs::write(&path, manifest.to_json()?).await
}

/// Read-modify-write the on-disk manifest as a generic document.
///
/// The whole file is parsed as a JSON map, the mutator touches only the keys
/// it cares about, and the document is re-serialized with its key order
/// intact. Keys this tool doesn't know about survive.
#[instrument(skip(mutate))]
pub async fn merge_update(
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    mutate: impl FnOnce(&mut serde_json::Map<String, Value>),
) -> Result<()> {
    let path = publish_dir.as_ref().join(RESOURCES_FILE);
    let doc = fs::read_buffered_utf8(&path).await?.unwrap_or_else(|| "{}".to_string());
    let mut doc = serde_json::from_str::<Value>(&doc).context("parse resource manifest")?;
    let map = doc
        .as_object_mut()
        .ok_or_else(|| color_eyre::eyre::eyre!("resource manifest is not a JSON object"))?;

    // Normalize the legacy spelling before mutating so writers only ever
    // deal with the canonical key.
    if let Some(legacy) = map.remove("objectId")
        && !map.contains_key("object_id")
    {
        map.insert("object_id".to_string(), legacy);
    }

    mutate(map);
    let json = serde_json::to_string_pretty(&doc).context("serialize resource manifest")?;
    fs::write(&path, json).await
}

/// Record the deployed site object id in the on-disk manifest.
#[instrument]
pub async fn write_object_id(
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    object_id: &str,
) -> Result<()> {
    let object_id = object_id.to_string();
    merge_update(publish_dir, move |map| {
        map.insert("object_id".to_string(), Value::String(object_id));
    })
    .await
}

/// Merge caller-supplied display metadata into the on-disk manifest.
///
/// Runs before upload so the merged manifest ships inside the site.
#[instrument(skip(metadata))]
pub async fn merge_metadata(
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    site_name: Option<&str>,
    metadata: Option<&SiteMetadata>,
    object_id: Option<&str>,
) -> Result<()> {
    let site_name = site_name.map(|s| s.to_string());
    let metadata = metadata.cloned().map(SiteMetadata::with_defaults);
    let object_id = object_id.map(|s| s.to_string());

    merge_update(publish_dir, move |map| {
        if let Some(site_name) = site_name {
            map.insert("site_name".to_string(), Value::String(site_name));
        }
        if let Some(metadata) = metadata {
            let value = serde_json::to_value(&metadata).expect("metadata serializes");
            map.insert("metadata".to_string(), value);
        }
        if let Some(object_id) = object_id {
            map.insert("object_id".to_string(), Value::String(object_id));
        }
    })
    .await
}
