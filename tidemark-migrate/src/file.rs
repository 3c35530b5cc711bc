//! Migration file management.
//!
//! Scripts live flat in one directory as `{version}_{name}.sql`, where the
//! version is a 14-digit UTC timestamp. An optional `{version}_{name}.down.sql`
//! next to it holds the rollback. Two comment annotations are recognised at
//! the top of the UP file:
//!
//! ```sql
//! -- @description: add user nicknames
//! -- @depends: 20240101120000_create_users
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checksum::compute_checksum;
use crate::error::{MigrateResult, MigrationError};
use crate::sql::GeneratedMigration;

const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Lifecycle state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    /// Not run yet.
    #[default]
    Pending,
    /// Running now, or interrupted mid-run.
    InProgress,
    /// Applied successfully.
    Completed,
    /// The last attempt failed.
    Failed,
}

impl MigrationState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A migration script on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationScript {
    /// Identifier: the file stem, `{version}_{name}`.
    pub id: String,
    /// 14-digit timestamp prefix.
    pub version: String,
    /// Human-readable name part of the file name.
    pub name: String,
    /// `@description` annotation.
    pub description: Option<String>,
    /// Forward SQL (the whole UP file).
    pub up_sql: String,
    /// Rollback SQL from the companion file.
    pub down_sql: Option<String>,
    /// Checksum of the UP file.
    pub checksum: String,
    /// `@depends` annotations, verbatim.
    pub depends_on: Vec<String>,
    /// Lifecycle state.
    pub status: MigrationState,
    /// Path of the UP file.
    pub path: PathBuf,
    /// Creation time derived from the version.
    pub created_at: DateTime<Utc>,
    /// When the script was executed, if it was.
    pub executed_at: Option<DateTime<Utc>>,
    /// Environment the script was executed in.
    pub environment: Option<String>,
}

impl MigrationScript {
    /// Build a script from UP/DOWN content.
    pub fn from_sql(
        version: impl Into<String>,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        let version = version.into();
        let name = name.into();
        let up_sql = up_sql.into();
        let (description, depends_on) = parse_annotations(&up_sql);

        Self {
            id: format!("{}_{}", version, name),
            created_at: version_time(&version).unwrap_or_else(Utc::now),
            version,
            name,
            description,
            checksum: compute_checksum(&up_sql),
            up_sql,
            down_sql: down_sql.filter(|d| !d.trim().is_empty()),
            depends_on,
            status: MigrationState::Pending,
            path: PathBuf::new(),
            executed_at: None,
            environment: None,
        }
    }

    /// Set the path.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Whether a rollback script exists.
    pub fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }

    /// Path of the DOWN companion.
    pub fn down_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}.down.sql", self.id))
    }
}

/// A `.sql` file found in the migrations directory, parsed or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationEntry {
    /// File name.
    pub file_name: String,
    /// Full path.
    pub path: PathBuf,
    /// Version and name, when the file name follows the convention.
    pub parsed: Option<(String, String)>,
    /// Whether this is a `.down.sql` companion.
    pub is_down: bool,
}

impl MigrationEntry {
    /// Inspect a file name.
    pub fn from_file_name(file_name: &str, path: PathBuf) -> Self {
        let is_down = file_name.ends_with(".down.sql");
        Self {
            file_name: file_name.to_string(),
            path,
            parsed: parse_file_name(file_name),
            is_down,
        }
    }

    /// Version prefix, if valid.
    pub fn version(&self) -> Option<&str> {
        self.parsed.as_ref().map(|(v, _)| v.as_str())
    }

    /// Identifier (`{version}_{name}`), if valid.
    pub fn id(&self) -> Option<String> {
        self.parsed.as_ref().map(|(v, n)| format!("{}_{}", v, n))
    }
}

/// Migration file reader/writer.
pub struct MigrationFileManager {
    /// Directory where migrations are stored.
    migrations_dir: PathBuf,
}

impl MigrationFileManager {
    /// Create a new file manager.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Get the migrations directory.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Ensure the migrations directory exists.
    pub async fn ensure_dir(&self) -> MigrateResult<()> {
        tokio::fs::create_dir_all(&self.migrations_dir)
            .await
            .map_err(MigrationError::Io)?;
        Ok(())
    }

    /// Every `.sql` file in the directory, sorted by file name.
    pub async fn list_entries(&self) -> MigrateResult<Vec<MigrationEntry>> {
        let mut found = Vec::new();

        if !tokio::fs::try_exists(&self.migrations_dir).await? {
            return Ok(found);
        }

        let mut entries = tokio::fs::read_dir(&self.migrations_dir)
            .await
            .map_err(MigrationError::Io)?;

        while let Some(entry) = entries.next_entry().await.map_err(MigrationError::Io)? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".sql") {
                continue;
            }
            found.push(MigrationEntry::from_file_name(file_name, path.clone()));
        }

        found.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(found)
    }

    /// All well-formed UP scripts in version order.
    pub async fn list_scripts(&self) -> MigrateResult<Vec<MigrationScript>> {
        let mut scripts = Vec::new();
        for entry in self.list_entries().await? {
            if entry.parsed.is_some() && !entry.is_down {
                scripts.push(self.read_script(&entry.path).await?);
            }
        }
        scripts.sort_by(|a, b| a.version.cmp(&b.version).then(a.id.cmp(&b.id)));
        Ok(scripts)
    }

    /// Read one UP script and its DOWN companion.
    pub async fn read_script(&self, path: &Path) -> MigrateResult<MigrationScript> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrationError::migration_file("Invalid path"))?;

        let entry = MigrationEntry::from_file_name(file_name, path.to_path_buf());
        let (version, name) = match (&entry.parsed, entry.is_down) {
            (Some(parsed), false) => parsed.clone(),
            _ => {
                return Err(MigrationError::migration_file(format!(
                    "Invalid migration file name (expected {{14-digit timestamp}}_{{name}}.sql): {}",
                    file_name
                )));
            }
        };

        let up_sql = tokio::fs::read_to_string(path)
            .await
            .map_err(MigrationError::Io)?;

        let down_path = path.with_file_name(format!("{}_{}.down.sql", version, name));
        let down_sql = if tokio::fs::try_exists(&down_path).await? {
            Some(
                tokio::fs::read_to_string(&down_path)
                    .await
                    .map_err(MigrationError::Io)?,
            )
        } else {
            None
        };

        Ok(MigrationScript::from_sql(version, name, up_sql, down_sql).with_path(path))
    }

    /// Find a script by identifier or version.
    pub async fn find_script(&self, id: &str) -> MigrateResult<Option<MigrationScript>> {
        Ok(self
            .list_scripts()
            .await?
            .into_iter()
            .find(|s| s.id == id || s.version == id))
    }

    /// Write a generated migration as UP and DOWN files.
    pub async fn write_script(
        &self,
        name: &str,
        migration: &GeneratedMigration,
    ) -> MigrateResult<MigrationScript> {
        let mut header = vec![format!("-- @description: {}", name)];
        for warning in &migration.warnings {
            header.push(format!("-- WARNING: {}", warning));
        }
        let up = format!("{}\n\n{}\n", header.join("\n"), migration.up_sql());
        let down = migration.down_sql();
        let down = (!down.trim().is_empty()).then(|| format!("{}\n", down));

        self.write_sql(name, &up, down.as_deref()).await
    }

    /// Write hand-authored UP/DOWN SQL under a fresh version.
    pub async fn write_sql(
        &self,
        name: &str,
        up_sql: &str,
        down_sql: Option<&str>,
    ) -> MigrateResult<MigrationScript> {
        self.ensure_dir().await?;

        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrationError::migration_file(format!(
                "Migration name '{}' has no usable characters",
                name
            )));
        }

        let existing: Vec<String> = self
            .list_entries()
            .await?
            .iter()
            .filter_map(|e| e.version().map(str::to_string))
            .collect();
        let version = next_free_version(&self.generate_version(), &existing);

        let id = format!("{}_{}", version, slug);
        let up_path = self.migrations_dir.join(format!("{}.sql", id));
        tokio::fs::write(&up_path, up_sql)
            .await
            .map_err(MigrationError::Io)?;

        if let Some(down) = down_sql {
            let down_path = self.migrations_dir.join(format!("{}.down.sql", id));
            tokio::fs::write(&down_path, down)
                .await
                .map_err(MigrationError::Io)?;
        }

        info!(id = %id, path = %up_path.display(), "Migration written");
        Ok(MigrationScript::from_sql(
            version,
            slug,
            up_sql,
            down_sql.map(str::to_string),
        )
        .with_path(up_path))
    }

    /// Generate a new version from the current time.
    pub fn generate_version(&self) -> String {
        Utc::now().format(VERSION_FORMAT).to_string()
    }
}

/// Parse `@description` and `@depends` annotations from leading comments.
pub fn parse_annotations(sql: &str) -> (Option<String>, Vec<String>) {
    let mut description = None;
    let mut depends = Vec::new();

    for line in sql.lines() {
        let Some(comment) = line.trim().strip_prefix("--") else {
            continue;
        };
        let comment = comment.trim();
        if let Some(value) = comment.strip_prefix("@depends:") {
            depends.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            );
        } else if let Some(value) = comment.strip_prefix("@description:") {
            let value = value.trim();
            if description.is_none() && !value.is_empty() {
                description = Some(value.to_string());
            }
        }
    }

    (description, depends)
}

/// Split `{14 digits}_{name}[.down].sql` into version and name.
fn parse_file_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name
        .strip_suffix(".down.sql")
        .or_else(|| file_name.strip_suffix(".sql"))?;
    let (version, name) = stem.split_once('_')?;

    if version.len() != 14 || !version.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let valid_name = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid_name.then(|| (version.to_string(), name.to_string()))
}

fn version_time(version: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(version, VERSION_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Bump `candidate` by whole seconds until it collides with nothing in `taken`.
fn next_free_version(candidate: &str, taken: &[String]) -> String {
    let mut version = candidate.to_string();
    while taken.iter().any(|t| *t == version) {
        match version_time(&version) {
            Some(t) => version = (t + Duration::seconds(1)).format(VERSION_FORMAT).to_string(),
            None => break,
        }
    }
    version
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, Table};
    use crate::sql::SchemaOp;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_file_names() {
        let entry = MigrationEntry::from_file_name("20231215120000_create_users.sql", PathBuf::new());
        assert_eq!(
            entry.parsed,
            Some(("20231215120000".to_string(), "create_users".to_string()))
        );
        assert!(!entry.is_down);
        assert_eq!(entry.id().as_deref(), Some("20231215120000_create_users"));

        let down =
            MigrationEntry::from_file_name("20231215120000_create_users.down.sql", PathBuf::new());
        assert!(down.is_down);
        assert_eq!(down.version(), Some("20231215120000"));

        assert!(MigrationEntry::from_file_name("create_users.sql", PathBuf::new()).parsed.is_none());
        assert!(MigrationEntry::from_file_name("2023_x.sql", PathBuf::new()).parsed.is_none());
    }

    #[test]
    fn test_parse_annotations() {
        let sql = "-- @description: add nicknames\n-- @depends: 20240101000000_a, 20240102000000_b\n--@depends: 20240103000000_c\nALTER TABLE t ADD COLUMN x int;\n";
        let (description, depends) = parse_annotations(sql);
        assert_eq!(description.as_deref(), Some("add nicknames"));
        assert_eq!(
            depends,
            vec!["20240101000000_a", "20240102000000_b", "20240103000000_c"]
        );
    }

    #[test]
    fn test_slugify_and_version_bump() {
        assert_eq!(slugify("Add User Nicknames!"), "add_user_nicknames");
        assert_eq!(
            next_free_version("20240101000059", &["20240101000059".to_string()]),
            "20240101000100"
        );
    }

    #[tokio::test]
    async fn test_write_and_list_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path().join("migrations"));

        let migration = GeneratedMigration {
            up_ops: vec![SchemaOp::CreateTable(
                Table::new("public", "users").with_column(Column::new("id", "bigint").primary_key()),
            )],
            down_ops: vec![SchemaOp::DropTable {
                schema: "public".to_string(),
                table: "users".to_string(),
            }],
            warnings: vec!["something lossy".to_string()],
        };

        let first = manager.write_script("create users", &migration).await.unwrap();
        let second = manager.write_sql("seed", "SELECT 1;", None).await.unwrap();
        assert_ne!(first.version, second.version);
        assert!(first.up_sql.contains("-- WARNING: something lossy"));
        assert_eq!(first.description.as_deref(), Some("create users"));

        tokio::fs::write(manager.migrations_dir().join("notes.sql"), "-- scratch")
            .await
            .unwrap();

        let scripts = manager.list_scripts().await.unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].id, first.id);
        assert!(scripts[0].is_reversible());
        assert!(!scripts[1].is_reversible());
        assert_eq!(scripts[0].checksum, first.checksum);

        let entries = manager.list_entries().await.unwrap();
        assert_eq!(entries.iter().filter(|e| e.parsed.is_none()).count(), 1);

        let found = manager.find_script(&second.version).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path().join("absent"));
        assert!(manager.list_scripts().await.unwrap().is_empty());
    }
}
