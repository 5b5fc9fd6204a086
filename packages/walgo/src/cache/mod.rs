//! The build cache: durable fingerprints of the last deployed tree and the
//! change-set computation against them.
//!
//! The cache is advisory. Opening it can fail (corrupt file, readonly
//! filesystem) and deployment proceeds as if every file were new; it never
//! aborts a deployment.

mod plan;
mod store;

pub use plan::{DeployPolicy, DeploymentPlan, finalize_deployment, prepare_deployment};
pub use store::{BuildCache, CACHE_DIR, FileRecord, ManifestMeta};
