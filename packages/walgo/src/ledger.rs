//! The project ledger: persistent record of deployed sites.
//!
//! Projects survive across machines and invocations; deployment records are
//! an append-only audit log per project. The ledger lives under the user's
//! home directory, not the site, so one ledger spans every site the user
//! deploys.

use camino::Utf8Path;
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use derive_more::Debug;
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use strum::{Display, EnumString};
use tracing::instrument;

use crate::{cost, network::Network};

/// Lifecycle of a project.
///
/// Valid transitions: draft → active (first successful deployment) and
/// active → archived. A project never returns to draft, and an archived
/// project is never reactivated.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ProjectStatus {
    Draft,
    Active,
    Archived,
}

/// A persistent record of a deployed site.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub network: Network,
    pub object_id: Option<String>,
    pub wallet_address: Option<String>,
    /// Storage duration purchased per deployment, in epochs.
    pub epochs: u64,
    /// Path to the source tree. Unique among active projects.
    pub source_path: String,
    pub status: ProjectStatus,
    pub created_at: Timestamp,
    pub last_deployed_at: Option<Timestamp>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    /// The human fee string from the last deployment, for audit only.
    pub last_fee: Option<String>,
}

/// Inputs for creating a project.
#[derive(Clone, Debug, bon::Builder)]
pub struct NewProject {
    pub name: String,
    pub source_path: String,
    #[builder(default)]
    pub network: Network,
    #[builder(default = 1)]
    pub epochs: u64,
    pub category: Option<String>,
    pub object_id: Option<String>,
    pub wallet_address: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

/// One deployment attempt, appended per invocation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DeploymentRecord {
    pub id: i64,
    pub project_id: i64,
    pub object_id: String,
    pub network: Network,
    pub epochs: u64,
    pub fee: Option<String>,
    pub success: bool,
    pub created_at: Timestamp,
}

/// Filter for [`Ledger::list_projects`].
#[derive(Clone, Debug, Default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub network: Option<Network>,
}

/// SQLite-backed project ledger.
#[derive(Debug)]
pub struct Ledger {
    #[debug("<connection>")]
    conn: Connection,
}

impl Ledger {
    /// Open or create the ledger in the user's walgo directory.
    #[instrument(name = "Ledger::open")]
    pub fn open() -> Result<Self> {
        let dir = crate::fs::user_data_path().context("locate walgo data directory")?;
        #[allow(clippy::disallowed_methods)]
        std::fs::create_dir_all(&dir).with_context(|| format!("create data directory {dir:?}"))?;
        Self::open_at(dir.join("walgo.db"))
    }

    /// Open or create a ledger at an explicit path.
    #[instrument(name = "Ledger::open_at", skip(path))]
    pub fn open_at(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open ledger database at {path:?}"))?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory ledger for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    category TEXT,
                    network TEXT NOT NULL,
                    object_id TEXT,
                    wallet_address TEXT,
                    epochs INTEGER NOT NULL DEFAULT 1,
                    source_path TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    created_at TEXT NOT NULL,
                    last_deployed_at TEXT,
                    description TEXT,
                    image_url TEXT,
                    last_fee TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_active_source
                ON projects(source_path) WHERE status = 'active';

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id),
                    object_id TEXT NOT NULL,
                    network TEXT NOT NULL,
                    epochs INTEGER NOT NULL,
                    fee TEXT,
                    success INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_deployments_project
                ON deployments(project_id);
                "#,
            )
            .context("initialize ledger schema")?;
        Ok(())
    }

    /// Create a new draft project.
    #[instrument(name = "Ledger::create_project", skip(self, new), fields(name = %new.name))]
    pub fn create_project(&self, new: &NewProject) -> Result<Project> {
        let created_at = Timestamp::now();
        self.conn
            .execute(
                r#"
                INSERT INTO projects
                (name, category, network, object_id, wallet_address, epochs,
                 source_path, status, created_at, description, image_url)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'draft', ?8, ?9, ?10)
                "#,
                params![
                    new.name,
                    new.category,
                    new.network.to_string(),
                    new.object_id,
                    new.wallet_address,
                    new.epochs as i64,
                    new.source_path,
                    created_at.to_string(),
                    new.description,
                    new.image_url,
                ],
            )
            .context("insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?.ok_or_eyre("project vanished after insert")
    }

    /// Fetch one project by id.
    #[instrument(name = "Ledger::get_project", skip(self))]
    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE id = ?1"),
                params![id],
                row_to_project,
            )
            .optional()
            .context("query project")?
            .transpose()
    }

    /// Fetch the project for a source tree. An active project wins over
    /// drafts and archived ones; ties break to the most recent.
    #[instrument(name = "Ledger::get_project_by_source_path", skip(self))]
    pub fn get_project_by_source_path(&self, source_path: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!(
                    "{PROJECT_SELECT} WHERE source_path = ?1
                     ORDER BY (status = 'active') DESC, id DESC LIMIT 1"
                ),
                params![source_path],
                row_to_project,
            )
            .optional()
            .context("query project by source path")?
            .transpose()
    }

    /// List projects, optionally filtered by status and network.
    #[instrument(name = "Ledger::list_projects", skip(self))]
    pub fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>> {
        let mut sql = format!("{PROJECT_SELECT} WHERE 1 = 1");
        let mut args = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.to_string());
        }
        if let Some(network) = filter.network {
            sql.push_str(" AND network = ?");
            args.push(network.to_string());
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql).context("prepare list query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_project)
            .context("execute list query")?;

        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("read row")??);
        }
        Ok(projects)
    }

    /// Update a project's mutable fields. Status is deliberately excluded:
    /// it only moves through [`Ledger::archive_project`] and the deployment
    /// upsert.
    #[instrument(name = "Ledger::update_project", skip(self, project), fields(id = project.id))]
    pub fn update_project(&self, project: &Project) -> Result<()> {
        let updated = self
            .conn
            .execute(
                r#"
                UPDATE projects SET
                    name = ?2, category = ?3, network = ?4, object_id = ?5,
                    wallet_address = ?6, epochs = ?7, source_path = ?8,
                    last_deployed_at = ?9, description = ?10, image_url = ?11,
                    last_fee = ?12
                WHERE id = ?1
                "#,
                params![
                    project.id,
                    project.name,
                    project.category,
                    project.network.to_string(),
                    project.object_id,
                    project.wallet_address,
                    project.epochs as i64,
                    project.source_path,
                    project.last_deployed_at.map(|t| t.to_string()),
                    project.description,
                    project.image_url,
                    project.last_fee,
                ],
            )
            .context("update project")?;
        if updated == 0 {
            bail!("no project with id {}", project.id);
        }
        Ok(())
    }

    /// Archive a project. Archived projects never return to active.
    #[instrument(name = "Ledger::archive_project", skip(self))]
    pub fn archive_project(&self, id: i64) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE projects SET status = 'archived' WHERE id = ?1",
                params![id],
            )
            .context("archive project")?;
        if updated == 0 {
            bail!("no project with id {id}");
        }
        Ok(())
    }

    /// Append one deployment record.
    #[instrument(name = "Ledger::record_deployment", skip(self))]
    pub fn record_deployment(
        &self,
        project_id: i64,
        object_id: &str,
        network: Network,
        epochs: u64,
        fee: Option<&str>,
        success: bool,
    ) -> Result<DeploymentRecord> {
        let created_at = Timestamp::now();
        self.conn
            .execute(
                r#"
                INSERT INTO deployments
                (project_id, object_id, network, epochs, fee, success, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    project_id,
                    object_id,
                    network.to_string(),
                    epochs as i64,
                    fee,
                    success,
                    created_at.to_string(),
                ],
            )
            .context("insert deployment record")?;
        Ok(DeploymentRecord {
            id: self.conn.last_insert_rowid(),
            project_id,
            object_id: object_id.to_string(),
            network,
            epochs,
            fee: fee.map(|f| f.to_string()),
            success,
            created_at,
        })
    }

    /// List deployment records for a project, oldest first.
    #[instrument(name = "Ledger::list_deployments", skip(self))]
    pub fn list_deployments(&self, project_id: i64) -> Result<Vec<DeploymentRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, project_id, object_id, network, epochs, fee, success, created_at
                FROM deployments WHERE project_id = ?1 ORDER BY id
                "#,
            )
            .context("prepare deployments query")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("execute deployments query")?;

        let mut records = Vec::new();
        for row in rows {
            let (id, project_id, object_id, network, epochs, fee, success, created_at) =
                row.context("read row")?;
            records.push(DeploymentRecord {
                id,
                project_id,
                object_id,
                network: network.parse().context("parse network")?,
                epochs: epochs as u64,
                fee,
                success,
                created_at: created_at.parse().context("parse timestamp")?,
            });
        }
        Ok(records)
    }

    /// The phase-11 operation: look up (or create) the project for a source
    /// tree, promote drafts to active, refresh mutable fields, and append the
    /// deployment record, all in one transaction.
    #[instrument(name = "Ledger::upsert_deployment", skip(self, outcome))]
    pub fn upsert_deployment(&mut self, outcome: &DeploymentOutcome) -> Result<Project> {
        let tx = self.conn.transaction().context("begin transaction")?;
        let now = Timestamp::now();

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM projects WHERE source_path = ?1
                 ORDER BY (status = 'active') DESC, id DESC LIMIT 1",
                params![outcome.source_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("query project")?;

        let project_id = match existing {
            Some((id, status)) => {
                // First successful deployment promotes a draft; an archived
                // project keeps its status since archived → active does not
                // exist.
                if status == "draft" && outcome.success {
                    tx.execute(
                        "UPDATE projects SET status = 'active' WHERE id = ?1",
                        params![id],
                    )
                    .context("promote draft project")?;
                }
                tx.execute(
                    r#"
                    UPDATE projects SET
                        network = ?2, object_id = ?3, epochs = ?4,
                        last_deployed_at = ?5, last_fee = ?6,
                        wallet_address = COALESCE(?7, wallet_address),
                        name = COALESCE(?8, name),
                        description = COALESCE(?9, description),
                        image_url = COALESCE(?10, image_url),
                        category = COALESCE(?11, category)
                    WHERE id = ?1
                    "#,
                    params![
                        id,
                        outcome.network.to_string(),
                        outcome.object_id,
                        outcome.epochs as i64,
                        now.to_string(),
                        outcome.fee,
                        outcome.wallet_address,
                        outcome.name,
                        outcome.description,
                        outcome.image_url,
                        outcome.category,
                    ],
                )
                .context("update project")?;
                id
            }
            None => {
                let status = if outcome.success { "active" } else { "draft" };
                tx.execute(
                    r#"
                    INSERT INTO projects
                    (name, category, network, object_id, wallet_address, epochs,
                     source_path, status, created_at, last_deployed_at,
                     description, image_url, last_fee)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    "#,
                    params![
                        outcome
                            .name
                            .clone()
                            .unwrap_or_else(|| default_project_name(&outcome.source_path)),
                        outcome.category,
                        outcome.network.to_string(),
                        outcome.object_id,
                        outcome.wallet_address,
                        outcome.epochs as i64,
                        outcome.source_path,
                        status,
                        now.to_string(),
                        outcome.success.then(|| now.to_string()),
                        outcome.description,
                        outcome.image_url,
                        outcome.fee,
                    ],
                )
                .context("insert project")?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            r#"
            INSERT INTO deployments
            (project_id, object_id, network, epochs, fee, success, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                project_id,
                outcome.object_id,
                outcome.network.to_string(),
                outcome.epochs as i64,
                outcome.fee,
                outcome.success,
                now.to_string(),
            ],
        )
        .context("insert deployment record")?;

        tx.commit().context("commit deployment upsert")?;
        self.get_project(project_id)?.ok_or_eyre("project vanished after upsert")
    }

    /// Deterministic fee synthesis used when the blockchain-actual fee is
    /// unknown. Pure arithmetic over the network-tagged fallback constants;
    /// no query is made.
    pub fn estimate_gas_fee(network: Network, size_bytes: u64, epochs: u64) -> String {
        let pricing = cost::StoragePricing::defaults(network);
        let file_count = (size_bytes / (50 * 1024)).max(1);
        let gas_price = match network {
            Network::Testnet => 1_000,
            Network::Mainnet => 750,
        };
        cost::estimate(&pricing, gas_price, size_bytes, epochs, file_count).fee_string()
    }
}

/// Everything phase 11 knows about a finished deployment.
#[derive(Clone, Debug, bon::Builder)]
pub struct DeploymentOutcome {
    pub source_path: String,
    pub object_id: String,
    #[builder(default)]
    pub network: Network,
    #[builder(default = 1)]
    pub epochs: u64,
    #[builder(default = true)]
    pub success: bool,
    pub fee: Option<String>,
    pub wallet_address: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub category: Option<String>,
}

fn default_project_name(source_path: &str) -> String {
    Utf8Path::new(source_path)
        .file_name()
        .unwrap_or("site")
        .to_string()
}

const PROJECT_SELECT: &str = r#"
    SELECT id, name, category, network, object_id, wallet_address, epochs,
           source_path, status, created_at, last_deployed_at, description,
           image_url, last_fee
    FROM projects
"#;

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Project>> {
    let id = row.get::<_, i64>(0)?;
    let name = row.get::<_, String>(1)?;
    let category = row.get::<_, Option<String>>(2)?;
    let network = row.get::<_, String>(3)?;
    let object_id = row.get::<_, Option<String>>(4)?;
    let wallet_address = row.get::<_, Option<String>>(5)?;
    let epochs = row.get::<_, i64>(6)?;
    let source_path = row.get::<_, String>(7)?;
    let status = row.get::<_, String>(8)?;
    let created_at = row.get::<_, String>(9)?;
    let last_deployed_at = row.get::<_, Option<String>>(10)?;
    let description = row.get::<_, Option<String>>(11)?;
    let image_url = row.get::<_, Option<String>>(12)?;
    let last_fee = row.get::<_, Option<String>>(13)?;

    Ok((|| {
        Ok(Project {
            id,
            name,
            category,
            network: network.parse().context("parse network")?,
            object_id,
            wallet_address,
            epochs: epochs as u64,
            source_path,
            status: status.parse().context("parse status")?,
            created_at: created_at.parse().context("parse created_at")?,
            last_deployed_at: last_deployed_at
                .map(|t| t.parse())
                .transpose()
                .context("parse last_deployed_at")?,
            description,
            image_url,
            last_fee,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn new_project(path: &str) -> NewProject {
        NewProject::builder()
            .name("demo".to_string())
            .source_path(path.to_string())
            .build()
    }

    fn outcome(path: &str) -> DeploymentOutcome {
        DeploymentOutcome::builder()
            .source_path(path.to_string())
            .object_id("0xabc".to_string())
            .fee("0.001000 WAL + 0.002000 SUI".to_string())
            .build()
    }

    #[test]
    fn create_and_fetch() {
        let db = Ledger::in_memory().unwrap();
        let project = db.create_project(&new_project("/sites/demo")).unwrap();

        assert_eq!(project.status, ProjectStatus::Draft);
        assert_eq!(project.network, Network::Testnet);
        assert_eq!(
            db.get_project_by_source_path("/sites/demo").unwrap().unwrap().id,
            project.id
        );
        assert_eq!(db.get_project_by_source_path("/elsewhere").unwrap(), None);
    }

    #[test]
    fn first_deployment_promotes_draft_to_active() {
        let mut db = Ledger::in_memory().unwrap();
        let project = db.create_project(&new_project("/sites/demo")).unwrap();
        assert_eq!(project.status, ProjectStatus::Draft);

        let updated = db.upsert_deployment(&outcome("/sites/demo")).unwrap();
        assert_eq!(updated.id, project.id);
        assert_eq!(updated.status, ProjectStatus::Active);
        assert_eq!(updated.object_id.as_deref(), Some("0xabc"));
        assert!(updated.last_deployed_at.is_some());

        let records = db.list_deployments(project.id).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
    }

    #[test]
    fn redeploy_stays_active_and_appends_record() {
        let mut db = Ledger::in_memory().unwrap();
        db.upsert_deployment(&outcome("/sites/demo")).unwrap();
        let again = db.upsert_deployment(&outcome("/sites/demo")).unwrap();

        assert_eq!(again.status, ProjectStatus::Active);
        assert_eq!(db.list_deployments(again.id).unwrap().len(), 2);
        assert_eq!(db.list_projects(&ProjectFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn unknown_source_path_creates_an_active_project() {
        let mut db = Ledger::in_memory().unwrap();
        let project = db.upsert_deployment(&outcome("/sites/fresh")).unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.name, "fresh");
    }

    #[test]
    fn archived_projects_never_reactivate() {
        let mut db = Ledger::in_memory().unwrap();
        let project = db.upsert_deployment(&outcome("/sites/demo")).unwrap();
        db.archive_project(project.id).unwrap();

        let after = db.upsert_deployment(&outcome("/sites/demo")).unwrap();
        assert_eq!(after.status, ProjectStatus::Archived);
    }

    #[test]
    fn list_filters_by_status_and_network() {
        let mut db = Ledger::in_memory().unwrap();
        db.create_project(&new_project("/sites/a")).unwrap();
        db.upsert_deployment(&outcome("/sites/b")).unwrap();

        let drafts = db
            .list_projects(&ProjectFilter {
                status: Some(ProjectStatus::Draft),
                network: None,
            })
            .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].source_path, "/sites/a");

        let mainnet = db
            .list_projects(&ProjectFilter {
                status: None,
                network: Some(Network::Mainnet),
            })
            .unwrap();
        assert_eq!(mainnet.len(), 0);
    }

    #[test]
    fn gas_fee_synthesis_is_deterministic() {
        let a = Ledger::estimate_gas_fee(Network::Testnet, 10 * 1024 * 1024, 5);
        let b = Ledger::estimate_gas_fee(Network::Testnet, 10 * 1024 * 1024, 5);
        assert_eq!(a, b);
        assert!(a.contains("WAL"));
    }
}
