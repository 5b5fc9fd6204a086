//! Parsing of site-builder output.
//!
//! The packager emits mixed log lines, JSON fragments, and ANSI color. It is
//! treated as a well-behaved but noisy oracle: strip ANSI, scan for the
//! values of interest with tolerant extraction, and never parse by line
//! offset.

use std::collections::BTreeMap;

use lazy_regex::{regex_captures, regex_find};
use serde_json::Value;
use tracing::{instrument, trace};

use crate::deploy::object_id::validate_object_id;

/// Everything extractable from one packager run.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ParsedOutput {
    /// The site object id, when the output contained one.
    pub object_id: Option<String>,
    /// Per-file blob identifiers, keyed by relative path.
    pub blob_ids: BTreeMap<String, String>,
}

/// Parse the combined stdout and stderr of a site-builder invocation.
#[instrument(skip(raw))]
pub fn parse_output(raw: &str) -> ParsedOutput {
    let clean = console::strip_ansi_codes(raw);
    let mut parsed = ParsedOutput::default();

    for line in clean.lines() {
        let trimmed = line.trim();

        // JSON fragments carry the most structure when present.
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                collect_json(&value, &mut parsed);
                continue;
            }
        }

        // A labeled object id wins over any bare hex later in the stream.
        if parsed.object_id.is_none()
            && let Some((_, id)) =
                regex_captures!(r"(?i)(?:site )?object id\s*[:=]\s*((?:0x)?[0-9a-fA-F]{1,64})\b", trimmed)
            && validate_object_id(id).is_ok()
        {
            parsed.object_id = Some(id.to_string());
            continue;
        }

        // Per-resource lines: `- /assets/app.js : <blob id>`.
        if let Some((_, path, blob)) = regex_captures!(
            r"^[-*]?\s*(/?[A-Za-z0-9_][A-Za-z0-9_\-./]*\.[A-Za-z0-9]+)\s*[:=]\s*(0x[0-9a-fA-F]{16,64}|[A-Za-z0-9_-]{40,48})\s*$",
            trimmed
        ) {
            parsed
                .blob_ids
                .insert(path.trim_start_matches('/').to_string(), blob.to_string());
        }
    }

    // Fall back to the first canonical 64-hex id anywhere in the stream.
    if parsed.object_id.is_none()
        && let Some(id) = regex_find!(r"0x[0-9a-fA-F]{64}", clean.as_ref())
    {
        parsed.object_id = Some(id.to_string());
    }

    trace!(
        object_id = ?parsed.object_id,
        blobs = parsed.blob_ids.len(),
        "parsed site-builder output"
    );
    parsed
}

/// Pull object and blob ids out of a JSON fragment.
fn collect_json(value: &Value, parsed: &mut ParsedOutput) {
    match value {
        Value::Object(map) => {
            if parsed.object_id.is_none()
                && let Some(id) = map
                    .get("objectId")
                    .or_else(|| map.get("object_id"))
                    .or_else(|| map.get("siteObjectId"))
                    .and_then(Value::as_str)
                && validate_object_id(id).is_ok()
            {
                parsed.object_id = Some(id.to_string());
            }

            let path = map.get("path").and_then(Value::as_str);
            let blob = map
                .get("blobId")
                .or_else(|| map.get("blob_id"))
                .and_then(Value::as_str);
            if let (Some(path), Some(blob)) = (path, blob) {
                parsed
                    .blob_ids
                    .insert(path.trim_start_matches('/').to_string(), blob.to_string());
            }

            for nested in map.values() {
                collect_json(nested, parsed);
            }
        }
        Value::Array(values) => {
            for nested in values {
                collect_json(nested, parsed);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SITE_ID: &str = "0x5f8a2cbb4b94157db1e43b4e4a1b6ca6f9a8d21bd0274ad1ae0ccf4ba66a2c5d";

    #[test]
    fn labeled_object_id_is_extracted_through_ansi() {
        let raw = format!(
            "\u{1b}[32mINFO\u{1b}[0m publishing site...\nSite object ID: {SITE_ID}\nDone.\n"
        );
        let parsed = parse_output(&raw);
        assert_eq!(parsed.object_id.as_deref(), Some(SITE_ID));
    }

    #[test]
    fn bare_canonical_id_is_a_fallback() {
        let raw = format!("created shared object {SITE_ID} in tx 7gXy\n");
        let parsed = parse_output(&raw);
        assert_eq!(parsed.object_id.as_deref(), Some(SITE_ID));
    }

    #[test]
    fn resource_lines_build_the_blob_map() {
        let raw = concat!(
            "Updating site resources:\n",
            "- /index.html : BAqqeXaWj-7gXyBcPKb2vHkRQU8LpTM4zN5fDW0y1aA\n",
            "- /assets/app.js : 0x9e107d9d372bb6826bd81d3542a419d6\n",
            "unrelated: line without ids\n",
        );
        let parsed = parse_output(raw);
        assert_eq!(
            parsed.blob_ids.get("index.html").map(String::as_str),
            Some("BAqqeXaWj-7gXyBcPKb2vHkRQU8LpTM4zN5fDW0y1aA")
        );
        assert_eq!(
            parsed.blob_ids.get("assets/app.js").map(String::as_str),
            Some("0x9e107d9d372bb6826bd81d3542a419d6")
        );
        assert_eq!(parsed.blob_ids.len(), 2);
    }

    #[test]
    fn json_fragments_are_preferred_structure() {
        let raw = format!(
            "INFO starting\n{{\"objectId\": \"{SITE_ID}\", \"resources\": [{{\"path\": \"/index.html\", \"blobId\": \"abc123def456abc123def456abc123def456abc1\"}}]}}\n"
        );
        let parsed = parse_output(&raw);
        assert_eq!(parsed.object_id.as_deref(), Some(SITE_ID));
        assert_eq!(
            parsed.blob_ids.get("index.html").map(String::as_str),
            Some("abc123def456abc123def456abc123def456abc1")
        );
    }

    #[test]
    fn garbage_yields_empty_parse() {
        let parsed = parse_output("no ids anywhere\njust logs\n");
        assert_eq!(parsed, ParsedOutput::default());
    }
}
