use crate::errors::*;
use crate::nevra::{CmpFlag, Nevra};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Connection, Pool, Row, Sqlite, SqliteConnection};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// Rows copied from a snapshot per read round-trip.
const IMPORT_BATCH: i64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoType {
    Binary,
    Source,
}

impl RepoType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(RepoType::Binary),
            "source" => Ok(RepoType::Source),
            other => Err(Error::InvalidArgument(format!(
                "unknown repository type {other:?} (expected binary or source)"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepoType::Binary => "binary",
            RepoType::Source => "source",
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub repomd_url: String,
    pub repo_type: String,
    pub source_repo_id: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Repo {
    pub fn is_source(&self) -> bool {
        self.repo_type == "source"
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Package {
    #[sqlx(rename = "pkgKey")]
    pub pkg_key: i64,
    pub repo_id: i64,
    pub name: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub license: Option<String>,
    pub vendor: Option<String>,
    pub rpm_group: Option<String>,
    pub packager: Option<String>,
    pub buildhost: Option<String>,
    pub sourcerpm: Option<String>,
    pub size_package: Option<i64>,
    pub size_installed: Option<i64>,
    pub size_archive: Option<i64>,
    pub location_href: String,
    pub location_base: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub header_start: Option<i64>,
    pub header_end: Option<i64>,
}

impl Package {
    pub fn nevra(&self) -> Nevra {
        let epoch = match self.epoch.as_str() {
            "" | "0" => None,
            e => Some(e.to_string()),
        };
        Nevra {
            name: self.name.clone(),
            epoch,
            version: self.version.clone(),
            release: self.release.clone(),
            arch: self.arch.clone(),
        }
    }

    pub fn evr(&self) -> (&str, &str, &str) {
        (&self.epoch, &self.version, &self.release)
    }

    pub fn is_source(&self) -> bool {
        matches!(self.arch.as_str(), "src" | "nosrc")
    }
}

/// A package joined with the name of the repository holding it.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SearchHit {
    #[sqlx(flatten)]
    pub package: Package,
    pub repo_name: String,
}

/// One row of the `requires` table.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Requirement {
    #[sqlx(rename = "pkgKey")]
    pub pkg_key: i64,
    pub name: String,
    pub flags: Option<String>,
    pub epoch: Option<String>,
    pub version: Option<String>,
    pub release: Option<String>,
    pub pre: bool,
    pub is_weak: bool,
}

impl Requirement {
    pub fn cmp_flag(&self) -> Option<CmpFlag> {
        self.flags.as_deref().and_then(CmpFlag::parse)
    }

    pub fn evr(&self) -> (&str, &str, &str) {
        (
            self.epoch.as_deref().unwrap_or(""),
            self.version.as_deref().unwrap_or(""),
            self.release.as_deref().unwrap_or(""),
        )
    }
}

/// Capability entry for programmatic inserts (provides/requires/...).
#[derive(Debug, Clone, Default)]
pub struct Capability {
    pub name: String,
    pub flags: Option<String>,
    pub epoch: Option<String>,
    pub version: Option<String>,
    pub release: Option<String>,
}

impl Capability {
    pub fn named(name: &str) -> Self {
        Capability {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn versioned(name: &str, flags: &str, epoch: &str, version: &str, release: &str) -> Self {
        Capability {
            name: name.to_string(),
            flags: Some(flags.to_string()),
            epoch: some_if_nonempty(epoch),
            version: some_if_nonempty(version),
            release: some_if_nonempty(release),
        }
    }
}

fn some_if_nonempty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct FileEntry {
    pub name: String,
    pub ftype: String,
}

/// Package attributes for programmatic inserts; snapshot imports bypass this.
#[derive(Debug, Clone, Default)]
pub struct NewPackage {
    pub repo_id: i64,
    pub name: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub license: Option<String>,
    pub vendor: Option<String>,
    pub rpm_group: Option<String>,
    pub packager: Option<String>,
    pub buildhost: Option<String>,
    pub sourcerpm: Option<String>,
    pub size_package: Option<i64>,
    pub size_installed: Option<i64>,
    pub size_archive: Option<i64>,
    pub location_href: String,
    pub location_base: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub header_start: Option<i64>,
    pub header_end: Option<i64>,
}

#[derive(Debug)]
pub struct Client {
    pool: Pool<Sqlite>,
    /// Repos with an import in flight. Imports of the same target repo
    /// collide (`Busy`); different repos may import concurrently.
    importing: Mutex<HashSet<i64>>,
}

impl Client {
    pub async fn create(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        Self::connect(options, 5).await
    }

    #[cfg(test)]
    pub async fn create_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        debug!("Opening package index...");
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        // sqlx currently does not support just putting `migrations` here
        sqlx::migrate!("db/migrations").run(&pool).await?;
        debug!("Package index schema is up to date");

        Ok(Client {
            pool,
            importing: Mutex::new(HashSet::new()),
        })
    }

    // ---- repositories ----

    pub async fn add_repo(
        &self,
        name: &str,
        base_url: &str,
        repomd_url: &str,
        repo_type: RepoType,
        source_repo_id: Option<i64>,
    ) -> Result<i64> {
        if let Some(source_id) = source_repo_id {
            let source = self.get_repo_by_id(source_id).await?.ok_or_else(|| {
                Error::InvalidArgument(format!("source repository id {source_id} does not exist"))
            })?;
            if !source.is_source() {
                return Err(Error::InvalidArgument(format!(
                    "repository {:?} is not a source repository",
                    source.name
                )));
            }
        }

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO repos (name, base_url, repomd_url, repo_type, source_repo_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
            base_url = excluded.base_url,
            repomd_url = excluded.repomd_url,
            repo_type = excluded.repo_type,
            source_repo_id = COALESCE(excluded.source_repo_id, repos.source_repo_id)
            RETURNING id",
        )
        .bind(name)
        .bind(base_url)
        .bind(repomd_url)
        .bind(repo_type.as_str())
        .bind(source_repo_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>> {
        let repos = sqlx::query_as::<_, Repo>("SELECT * FROM repos ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(repos)
    }

    pub async fn get_repo(&self, name: &str) -> Result<Option<Repo>> {
        let repo = sqlx::query_as::<_, Repo>("SELECT * FROM repos WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(repo)
    }

    pub async fn get_repo_by_id(&self, id: i64) -> Result<Option<Repo>> {
        let repo = sqlx::query_as::<_, Repo>("SELECT * FROM repos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(repo)
    }

    /// Translate repository names into ids, failing on the first unknown name.
    pub async fn resolve_repo_ids(&self, names: &[String]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let repo = self
                .get_repo(name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("repository {name:?}")))?;
            ids.push(repo.id);
        }
        Ok(ids)
    }

    pub async fn link_source(&self, binary_name: &str, source_name: &str) -> Result<()> {
        let binary = self
            .get_repo(binary_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository {binary_name:?}")))?;
        let source = self
            .get_repo(source_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository {source_name:?}")))?;

        if binary.is_source() {
            return Err(Error::InvalidArgument(format!(
                "repository {binary_name:?} is a source repository and cannot be linked"
            )));
        }
        if !source.is_source() {
            return Err(Error::InvalidArgument(format!(
                "repository {source_name:?} is not a source repository"
            )));
        }

        sqlx::query("UPDATE repos SET source_repo_id = ? WHERE id = ?")
            .bind(source.id)
            .bind(binary.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_repo(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repos WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn wipe_repo_packages(&self, repo_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        wipe_packages(&mut *conn, repo_id).await
    }

    // ---- packages ----

    pub async fn add_package(&self, pkg: &NewPackage) -> Result<i64> {
        let epoch = if pkg.epoch.is_empty() {
            "0"
        } else {
            &pkg.epoch
        };
        let result = sqlx::query(
            "INSERT INTO packages (repo_id, name, epoch, version, release, arch,
                summary, description, url, license, vendor, rpm_group, packager,
                buildhost, sourcerpm, size_package, size_installed, size_archive,
                location_href, location_base, checksum, checksum_type,
                header_start, header_end)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(pkg.repo_id)
        .bind(&pkg.name)
        .bind(epoch)
        .bind(&pkg.version)
        .bind(&pkg.release)
        .bind(&pkg.arch)
        .bind(&pkg.summary)
        .bind(&pkg.description)
        .bind(&pkg.url)
        .bind(&pkg.license)
        .bind(&pkg.vendor)
        .bind(&pkg.rpm_group)
        .bind(&pkg.packager)
        .bind(&pkg.buildhost)
        .bind(&pkg.sourcerpm)
        .bind(pkg.size_package)
        .bind(pkg.size_installed)
        .bind(pkg.size_archive)
        .bind(&pkg.location_href)
        .bind(&pkg.location_base)
        .bind(&pkg.checksum)
        .bind(&pkg.checksum_type)
        .bind(pkg.header_start)
        .bind(pkg.header_end)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            unique_conflict(err, || {
                format!("package {} is already indexed for this repo", pkg.name)
            })
        })?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_provides(&self, pkg_key: i64, entries: &[Capability]) -> Result<()> {
        for entry in entries {
            sqlx::query(
                "INSERT INTO provides (pkgKey, name, flags, epoch, version, release)
                VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(pkg_key)
            .bind(&entry.name)
            .bind(&entry.flags)
            .bind(&entry.epoch)
            .bind(&entry.version)
            .bind(&entry.release)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn add_requires(
        &self,
        pkg_key: i64,
        entries: &[Capability],
        pre: bool,
        is_weak: bool,
    ) -> Result<()> {
        for entry in entries {
            sqlx::query(
                "INSERT INTO requires (pkgKey, name, flags, epoch, version, release, pre, is_weak)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(pkg_key)
            .bind(&entry.name)
            .bind(&entry.flags)
            .bind(&entry.epoch)
            .bind(&entry.version)
            .bind(&entry.release)
            .bind(pre)
            .bind(is_weak)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn add_files(&self, pkg_key: i64, entries: &[FileEntry]) -> Result<()> {
        for entry in entries {
            sqlx::query("INSERT INTO files (pkgKey, name, ftype) VALUES (?, ?, ?)")
                .bind(pkg_key)
                .bind(&entry.name)
                .bind(if entry.ftype.is_empty() {
                    "file"
                } else {
                    &entry.ftype
                })
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_by_key(&self, pkg_key: i64) -> Result<Option<Package>> {
        let package = sqlx::query_as::<_, Package>("SELECT * FROM packages WHERE pkgKey = ?")
            .bind(pkg_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(package)
    }

    /// Search the index. A pattern that parses as a full NEVRA matches its
    /// component fields exactly; `exact` restricts to literal name matches;
    /// `*` turns the pattern into a LIKE; anything else is a case-insensitive
    /// substring match over name and summary.
    pub async fn search_packages(
        &self,
        pattern: &str,
        repos: Option<&[i64]>,
        exact: bool,
    ) -> Result<Vec<SearchHit>> {
        let base = "SELECT p.*, r.name AS repo_name FROM packages p
            JOIN repos r ON r.id = p.repo_id";
        let filter = repo_filter("p.repo_id", repos);
        let order = "ORDER BY p.name, p.pkgKey";

        if let Ok(nevra) = Nevra::parse(pattern) {
            let sql = format!(
                "{base} WHERE p.name = ? AND p.epoch = COALESCE(?, p.epoch)
                AND p.version = ? AND p.release = ? AND p.arch = ? {filter} {order}"
            );
            let hits = sqlx::query_as::<_, SearchHit>(&sql)
                .bind(&nevra.name)
                .bind(&nevra.epoch)
                .bind(&nevra.version)
                .bind(&nevra.release)
                .bind(&nevra.arch)
                .fetch_all(&self.pool)
                .await?;
            return Ok(hits);
        }

        let (condition, bind_pattern) = if exact {
            ("p.name = ?".to_string(), pattern.to_string())
        } else if pattern.contains('*') {
            ("p.name LIKE ?".to_string(), pattern.replace('*', "%"))
        } else {
            (
                "(p.name LIKE '%' || ? || '%' OR p.summary LIKE '%' || ? || '%')".to_string(),
                pattern.to_string(),
            )
        };

        let sql = format!("{base} WHERE {condition} {filter} {order}");
        let mut query = sqlx::query_as::<_, SearchHit>(&sql).bind(bind_pattern.clone());
        if condition.contains("summary") {
            query = query.bind(bind_pattern);
        }
        let hits = query.fetch_all(&self.pool).await?;
        Ok(hits)
    }

    /// Capability name → providers, including each package's implicit
    /// self-provide of its own name.
    pub async fn provides_map(&self, repos: Option<&[i64]>) -> Result<HashMap<String, Vec<i64>>> {
        let filter = repo_where("p.repo_id", repos);
        let sql = format!(
            "SELECT pr.name, pr.pkgKey FROM provides pr
            JOIN packages p ON p.pkgKey = pr.pkgKey {filter}
            UNION
            SELECT p.name, p.pkgKey FROM packages p {filter}"
        );
        let rows = sqlx::query_as::<_, (String, i64)>(&sql)
            .fetch_all(&self.pool)
            .await?;

        let mut map: HashMap<String, Vec<i64>> = HashMap::new();
        for (name, pkg_key) in rows {
            let providers = map.entry(name).or_default();
            if !providers.contains(&pkg_key) {
                providers.push(pkg_key);
            }
        }
        Ok(map)
    }

    /// pkgKey → its requirement rows, in declaration order.
    pub async fn requires_map(&self) -> Result<HashMap<i64, Vec<Requirement>>> {
        let rows = sqlx::query_as::<_, Requirement>(
            "SELECT pkgKey, name, flags, epoch, version, release, pre, is_weak
            FROM requires ORDER BY pkgKey, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<i64, Vec<Requirement>> = HashMap::new();
        for row in rows {
            map.entry(row.pkg_key).or_default().push(row);
        }
        Ok(map)
    }

    /// Which packages ship the given absolute path.
    pub async fn find_file_providers(
        &self,
        path: &str,
        repos: Option<&[i64]>,
    ) -> Result<Vec<i64>> {
        let filter = repo_filter("p.repo_id", repos);
        let sql = format!(
            "SELECT f.pkgKey FROM files f
            JOIN packages p ON p.pkgKey = f.pkgKey
            WHERE f.name = ? {filter}"
        );
        let keys = sqlx::query_scalar::<_, i64>(&sql)
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    // ---- snapshot import ----

    /// Wipe the target repo and re-ingest it from an externally produced
    /// primary_db snapshot, all in one transaction; `last_updated` is stamped
    /// before commit so a failed import leaves no trace.
    pub async fn import_snapshot(&self, snapshot: &Path, repo_name: &str) -> Result<i64> {
        let repo = self
            .get_repo(repo_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository {repo_name:?}")))?;
        self.import_snapshot_into(snapshot, repo.id).await?;
        Ok(repo.id)
    }

    pub async fn import_snapshot_into(&self, snapshot: &Path, repo_id: i64) -> Result<()> {
        let _guard = self.begin_import(repo_id)?;

        let options = SqliteConnectOptions::new()
            .filename(snapshot)
            .read_only(true);
        let mut snap = SqliteConnection::connect_with(&options).await?;

        if !table_exists(&mut snap, "packages").await? {
            return Err(Error::InvalidSnapshot(
                "snapshot has no packages table".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;
        let result = run_import(&mut *conn, &mut snap, repo_id).await;
        let restore = sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await;
        result?;
        restore?;
        Ok(())
    }

    fn begin_import(&self, repo_id: i64) -> Result<ImportGuard<'_>> {
        let mut importing = lock(&self.importing);
        if !importing.insert(repo_id) {
            return Err(Error::Busy);
        }
        Ok(ImportGuard {
            importing: &self.importing,
            repo_id,
        })
    }
}

/// Marks one repo as importing for as long as it is alive.
struct ImportGuard<'a> {
    importing: &'a Mutex<HashSet<i64>>,
    repo_id: i64,
}

impl Drop for ImportGuard<'_> {
    fn drop(&mut self) {
        lock(self.importing).remove(&self.repo_id);
    }
}

fn lock(importing: &Mutex<HashSet<i64>>) -> std::sync::MutexGuard<'_, HashSet<i64>> {
    importing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unique_conflict(err: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(what()),
        _ => Error::Sql(err),
    }
}

fn repo_ids_csv(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// `AND <column> IN (...)` suffix, or nothing.
fn repo_filter(column: &str, repos: Option<&[i64]>) -> String {
    match repos {
        Some(ids) if !ids.is_empty() => format!("AND {column} IN ({})", repo_ids_csv(ids)),
        _ => String::new(),
    }
}

/// `WHERE <column> IN (...)` clause, or nothing.
fn repo_where(column: &str, repos: Option<&[i64]>) -> String {
    match repos {
        Some(ids) if !ids.is_empty() => format!("WHERE {column} IN ({})", repo_ids_csv(ids)),
        _ => String::new(),
    }
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(table)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

/// Delete a repo's packages and their relations explicitly, so the wipe also
/// works on connections that have foreign keys (and thus cascades) disabled.
async fn wipe_packages(conn: &mut SqliteConnection, repo_id: i64) -> Result<()> {
    for table in ["provides", "requires", "conflicts", "obsoletes", "files"] {
        let sql = format!(
            "DELETE FROM {table}
            WHERE pkgKey IN (SELECT pkgKey FROM packages WHERE repo_id = ?)"
        );
        sqlx::query(&sql).bind(repo_id).execute(&mut *conn).await?;
    }
    sqlx::query("DELETE FROM packages WHERE repo_id = ?")
        .bind(repo_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn run_import(
    conn: &mut SqliteConnection,
    snap: &mut SqliteConnection,
    repo_id: i64,
) -> Result<()> {
    let mut tx = conn.begin().await?;

    wipe_packages(&mut tx, repo_id).await?;

    let key_map = copy_packages(&mut tx, snap, repo_id).await?;
    info!("Imported {} packages", key_map.len());

    for table in ["provides", "conflicts", "obsoletes"] {
        if table_exists(snap, table).await? {
            copy_relations(&mut tx, snap, table, &key_map).await?;
        }
    }
    if table_exists(snap, "requires").await? {
        copy_requires(&mut tx, snap, "requires", false, &key_map).await?;
    }
    // weak dependency tables fold into `requires` with is_weak set
    for table in ["recommends", "suggests", "supplements", "enhances"] {
        if table_exists(snap, table).await? {
            copy_requires(&mut tx, snap, table, true, &key_map).await?;
        }
    }
    if table_exists(snap, "files").await? {
        copy_files(&mut tx, snap, &key_map).await?;
    }

    sqlx::query("UPDATE repos SET last_updated = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

async fn copy_packages(
    tx: &mut SqliteConnection,
    snap: &mut SqliteConnection,
    repo_id: i64,
) -> Result<HashMap<i64, i64>> {
    let mut key_map = HashMap::new();
    let mut offset = 0i64;

    loop {
        let rows = sqlx::query(
            "SELECT pkgKey, pkgId, name, arch, version, epoch, release,
                summary, description, url, rpm_license, rpm_vendor, rpm_group,
                rpm_buildhost, rpm_sourcerpm, rpm_header_start, rpm_header_end,
                rpm_packager, size_package, size_installed, size_archive,
                location_href, location_base, checksum_type
            FROM packages ORDER BY pkgKey LIMIT ? OFFSET ?",
        )
        .bind(IMPORT_BATCH)
        .bind(offset)
        .fetch_all(&mut *snap)
        .await
        .map_err(invalid_snapshot)?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as i64;

        for row in &rows {
            let old_key: i64 = row.try_get("pkgKey").map_err(invalid_snapshot)?;
            let epoch: Option<String> = row.try_get("epoch").unwrap_or(None);
            let result = sqlx::query(
                "INSERT INTO packages (repo_id, name, epoch, version, release,
                    arch, summary, description, url, license, vendor, rpm_group,
                    packager, buildhost, sourcerpm, size_package, size_installed,
                    size_archive, location_href, location_base, checksum,
                    checksum_type, header_start, header_end)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(repo_id)
            .bind(row.try_get::<String, _>("name").map_err(invalid_snapshot)?)
            .bind(epoch.unwrap_or_else(|| "0".to_string()))
            .bind(text_column(row, "version"))
            .bind(text_column(row, "release"))
            .bind(text_column(row, "arch"))
            .bind(row.try_get::<Option<String>, _>("summary").unwrap_or(None))
            .bind(
                row.try_get::<Option<String>, _>("description")
                    .unwrap_or(None),
            )
            .bind(row.try_get::<Option<String>, _>("url").unwrap_or(None))
            .bind(
                row.try_get::<Option<String>, _>("rpm_license")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<String>, _>("rpm_vendor")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<String>, _>("rpm_group")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<String>, _>("rpm_packager")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<String>, _>("rpm_buildhost")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<String>, _>("rpm_sourcerpm")
                    .unwrap_or(None),
            )
            .bind(row.try_get::<Option<i64>, _>("size_package").unwrap_or(None))
            .bind(
                row.try_get::<Option<i64>, _>("size_installed")
                    .unwrap_or(None),
            )
            .bind(row.try_get::<Option<i64>, _>("size_archive").unwrap_or(None))
            .bind(text_column(row, "location_href"))
            .bind(
                row.try_get::<Option<String>, _>("location_base")
                    .unwrap_or(None),
            )
            .bind(row.try_get::<Option<String>, _>("pkgId").unwrap_or(None))
            .bind(
                row.try_get::<Option<String>, _>("checksum_type")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<i64>, _>("rpm_header_start")
                    .unwrap_or(None),
            )
            .bind(
                row.try_get::<Option<i64>, _>("rpm_header_end")
                    .unwrap_or(None),
            )
            .execute(&mut *tx)
            .await?;
            key_map.insert(old_key, result.last_insert_rowid());
        }
    }

    Ok(key_map)
}

async fn copy_relations(
    tx: &mut SqliteConnection,
    snap: &mut SqliteConnection,
    table: &str,
    key_map: &HashMap<i64, i64>,
) -> Result<()> {
    let select = format!(
        "SELECT pkgKey, name, flags, epoch, version, release
        FROM {table} ORDER BY rowid LIMIT ? OFFSET ?"
    );
    let insert = format!(
        "INSERT INTO {table} (pkgKey, name, flags, epoch, version, release)
        VALUES (?, ?, ?, ?, ?, ?)"
    );
    let mut offset = 0i64;

    loop {
        let rows = sqlx::query(&select)
            .bind(IMPORT_BATCH)
            .bind(offset)
            .fetch_all(&mut *snap)
            .await
            .map_err(invalid_snapshot)?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as i64;

        for row in &rows {
            let old_key: i64 = row.try_get("pkgKey").map_err(invalid_snapshot)?;
            let Some(new_key) = key_map.get(&old_key) else {
                continue;
            };
            sqlx::query(&insert)
                .bind(new_key)
                .bind(text_column(row, "name"))
                .bind(row.try_get::<Option<String>, _>("flags").unwrap_or(None))
                .bind(relaxed_text(row, "epoch"))
                .bind(relaxed_text(row, "version"))
                .bind(relaxed_text(row, "release"))
                .execute(&mut *tx)
                .await?;
        }
    }

    Ok(())
}

async fn copy_requires(
    tx: &mut SqliteConnection,
    snap: &mut SqliteConnection,
    table: &str,
    is_weak: bool,
    key_map: &HashMap<i64, i64>,
) -> Result<()> {
    let has_pre = table == "requires";
    let pre_column = if has_pre { ", pre" } else { "" };
    let select = format!(
        "SELECT pkgKey, name, flags, epoch, version, release{pre_column}
        FROM {table} ORDER BY rowid LIMIT ? OFFSET ?"
    );
    let mut offset = 0i64;

    loop {
        let rows = sqlx::query(&select)
            .bind(IMPORT_BATCH)
            .bind(offset)
            .fetch_all(&mut *snap)
            .await
            .map_err(invalid_snapshot)?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as i64;

        for row in &rows {
            let old_key: i64 = row.try_get("pkgKey").map_err(invalid_snapshot)?;
            let Some(new_key) = key_map.get(&old_key) else {
                continue;
            };
            let pre = has_pre && bool_column(row, "pre");
            sqlx::query(
                "INSERT INTO requires (pkgKey, name, flags, epoch, version, release, pre, is_weak)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(new_key)
            .bind(text_column(row, "name"))
            .bind(row.try_get::<Option<String>, _>("flags").unwrap_or(None))
            .bind(relaxed_text(row, "epoch"))
            .bind(relaxed_text(row, "version"))
            .bind(relaxed_text(row, "release"))
            .bind(pre)
            .bind(is_weak)
            .execute(&mut *tx)
            .await?;
        }
    }

    Ok(())
}

async fn copy_files(
    tx: &mut SqliteConnection,
    snap: &mut SqliteConnection,
    key_map: &HashMap<i64, i64>,
) -> Result<()> {
    let mut offset = 0i64;

    loop {
        let rows = sqlx::query(
            "SELECT pkgKey, name, type FROM files ORDER BY rowid LIMIT ? OFFSET ?",
        )
        .bind(IMPORT_BATCH)
        .bind(offset)
        .fetch_all(&mut *snap)
        .await
        .map_err(invalid_snapshot)?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as i64;

        for row in &rows {
            let old_key: i64 = row.try_get("pkgKey").map_err(invalid_snapshot)?;
            let Some(new_key) = key_map.get(&old_key) else {
                continue;
            };
            let ftype: Option<String> = row.try_get("type").unwrap_or(None);
            sqlx::query("INSERT INTO files (pkgKey, name, ftype) VALUES (?, ?, ?)")
                .bind(new_key)
                .bind(text_column(row, "name"))
                .bind(ftype.unwrap_or_else(|| "file".to_string()))
                .execute(&mut *tx)
                .await?;
        }
    }

    Ok(())
}

fn invalid_snapshot(err: sqlx::Error) -> Error {
    Error::InvalidSnapshot(err.to_string())
}

fn text_column(row: &SqliteRow, column: &str) -> String {
    row.try_get::<Option<String>, _>(column)
        .unwrap_or(None)
        .unwrap_or_default()
}

/// Like [`text_column`] but keeps absence as NULL.
fn relaxed_text(row: &SqliteRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column).unwrap_or(None)
}

/// Boolean snapshot columns appear both as integers and as TRUE/FALSE text,
/// depending on the createrepo implementation that wrote the file.
fn bool_column(row: &SqliteRow, column: &str) -> bool {
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(column) {
        return s.eq_ignore_ascii_case("true") || s == "1";
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(column) {
        return n != 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn test_repo(db: &Client, name: &str) -> i64 {
        db.add_repo(
            name,
            "https://mirror.example.com/fedora/",
            "repodata/repomd.xml",
            RepoType::Binary,
            None,
        )
        .await
        .unwrap()
    }

    pub(crate) fn simple_package(repo_id: i64, name: &str, version: &str, arch: &str) -> NewPackage {
        NewPackage {
            repo_id,
            name: name.to_string(),
            epoch: "0".to_string(),
            version: version.to_string(),
            release: "1".to_string(),
            arch: arch.to_string(),
            location_href: format!("Packages/{name}-{version}-1.{arch}.rpm"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_repo_is_idempotent() {
        let db = Client::create_in_memory().await.unwrap();
        let first = test_repo(&db, "fedora").await;
        let second = db
            .add_repo(
                "fedora",
                "https://other.example.com/fedora/",
                "repodata/repomd.xml",
                RepoType::Binary,
                None,
            )
            .await
            .unwrap();
        assert_eq!(first, second);

        let repos = db.list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].base_url, "https://other.example.com/fedora/");
        assert_eq!(repos[0].last_updated, None);
    }

    #[tokio::test]
    async fn test_add_repo_validates_source_ref() {
        let db = Client::create_in_memory().await.unwrap();
        let err = db
            .add_repo("f", "http://x/", "repodata/repomd.xml", RepoType::Binary, Some(99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let binary = test_repo(&db, "binary").await;
        let err = db
            .add_repo(
                "f",
                "http://x/",
                "repodata/repomd.xml",
                RepoType::Binary,
                Some(binary),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_link_source() {
        let db = Client::create_in_memory().await.unwrap();
        test_repo(&db, "bin").await;
        db.add_repo(
            "src",
            "https://mirror.example.com/fedora-source/",
            "repodata/repomd.xml",
            RepoType::Source,
            None,
        )
        .await
        .unwrap();

        db.link_source("bin", "src").await.unwrap();
        let bin = db.get_repo("bin").await.unwrap().unwrap();
        let src = db.get_repo("src").await.unwrap().unwrap();
        assert_eq!(bin.source_repo_id, Some(src.id));

        let err = db.link_source("bin", "bin").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = db.link_source("missing", "src").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unique_nevra_per_repo() {
        let db = Client::create_in_memory().await.unwrap();
        let repo = test_repo(&db, "fedora").await;
        let pkg = simple_package(repo, "bash", "5.2.26", "x86_64");
        db.add_package(&pkg).await.unwrap();
        let err = db.add_package(&pkg).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_repo_cascades() {
        let db = Client::create_in_memory().await.unwrap();
        let repo = test_repo(&db, "fedora").await;
        let key = db
            .add_package(&simple_package(repo, "bash", "5.2.26", "x86_64"))
            .await
            .unwrap();
        db.add_provides(key, &[Capability::named("/bin/sh")])
            .await
            .unwrap();
        db.add_requires(key, &[Capability::named("glibc")], false, false)
            .await
            .unwrap();
        db.add_files(
            key,
            &[FileEntry {
                name: "/usr/bin/bash".to_string(),
                ftype: "file".to_string(),
            }],
        )
        .await
        .unwrap();

        assert!(db.delete_repo("fedora").await.unwrap());
        assert!(!db.delete_repo("fedora").await.unwrap());

        assert!(db.get_by_key(key).await.unwrap().is_none());
        assert!(db.provides_map(None).await.unwrap().is_empty());
        assert!(db.requires_map().await.unwrap().is_empty());
        assert!(
            db.find_file_providers("/usr/bin/bash", None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_search_ladder() {
        let db = Client::create_in_memory().await.unwrap();
        let repo = test_repo(&db, "fedora").await;
        let mut pkg = simple_package(repo, "bash", "5.2.26", "x86_64");
        pkg.summary = Some("The GNU Bourne Again shell".to_string());
        db.add_package(&pkg).await.unwrap();
        db.add_package(&simple_package(repo, "bash-completion", "2.11", "noarch"))
            .await
            .unwrap();
        db.add_package(&simple_package(repo, "zsh", "5.9", "x86_64"))
            .await
            .unwrap();

        // full NEVRA
        let hits = db
            .search_packages("bash-5.2.26-1.x86_64", None, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].package.name, "bash");
        assert_eq!(hits[0].repo_name, "fedora");

        // glob
        let hits = db.search_packages("bash*", None, false).await.unwrap();
        assert_eq!(hits.len(), 2);

        // substring over name or summary
        let hits = db.search_packages("bourne", None, false).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].package.name, "bash");

        // exact restricts to literal names
        let hits = db.search_packages("bash", None, true).await.unwrap();
        assert_eq!(hits.len(), 1);

        // repo filter that excludes everything
        let hits = db
            .search_packages("bash", Some(&[repo + 1]), true)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_provides_map_includes_self() {
        let db = Client::create_in_memory().await.unwrap();
        let repo = test_repo(&db, "fedora").await;
        let key = db
            .add_package(&simple_package(repo, "B", "2", "x86_64"))
            .await
            .unwrap();
        // no explicit provides rows at all

        let map = db.provides_map(None).await.unwrap();
        assert_eq!(map.get("B"), Some(&vec![key]));
    }

    #[tokio::test]
    async fn test_import_snapshot_remaps_keys() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("primary.sqlite");
        write_test_snapshot(&snapshot_path).await;

        let db_path = dir.path().join("windnf.db");
        let db = Client::create(&db_path).await.unwrap();
        test_repo(&db, "fedora").await;

        let repo_id = db.import_snapshot(&snapshot_path, "fedora").await.unwrap();

        let repo = db.get_repo("fedora").await.unwrap().unwrap();
        assert!(repo.last_updated.is_some());

        let hits = db.search_packages("bash", None, true).await.unwrap();
        assert_eq!(hits.len(), 1);
        let bash = &hits[0].package;
        assert_eq!(bash.repo_id, repo_id);
        assert_eq!(bash.version, "5.2.26");
        assert_eq!(bash.sourcerpm.as_deref(), Some("bash-5.2.26-1.fc40.src.rpm"));

        // provides were remapped onto the fresh pkgKey
        let map = db.provides_map(None).await.unwrap();
        assert!(map.get("/bin/bash").unwrap().contains(&bash.pkg_key));

        // weak tables landed in requires with is_weak set
        let requires = db.requires_map().await.unwrap();
        let rows = requires.get(&bash.pkg_key).unwrap();
        assert!(rows.iter().any(|r| r.name == "glibc" && !r.is_weak));
        assert!(rows.iter().any(|r| r.name == "bash-completion" && r.is_weak));

        // re-import replaces rather than duplicates
        db.import_snapshot(&snapshot_path, "fedora").await.unwrap();
        let hits = db.search_packages("bash", None, true).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_import_rejects_non_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("empty.sqlite");
        let options = SqliteConnectOptions::new()
            .filename(&snapshot_path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query("CREATE TABLE wrong (id INTEGER)")
            .execute(&mut conn)
            .await
            .unwrap();
        drop(conn);

        let db_path = dir.path().join("windnf.db");
        let db = Client::create(&db_path).await.unwrap();
        test_repo(&db, "fedora").await;

        let err = db
            .import_snapshot(&snapshot_path, "fedora")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(_)));
        let repo = db.get_repo("fedora").await.unwrap().unwrap();
        assert_eq!(repo.last_updated, None);
    }

    #[tokio::test]
    async fn test_import_busy_is_per_repo() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("windnf.db");
        let db = Client::create(&db_path).await.unwrap();
        let fedora = test_repo(&db, "fedora").await;
        let updates = test_repo(&db, "updates").await;

        let _guard = db.begin_import(fedora).unwrap();

        // same target repo collides
        let err = db
            .import_snapshot(Path::new("/nonexistent"), "fedora")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy));

        // a different target repo is not blocked (this one fails later,
        // on the unreadable snapshot)
        let err = db
            .import_snapshot_into(Path::new("/nonexistent"), updates)
            .await
            .unwrap_err();
        assert!(!matches!(err, Error::Busy));

        // the marker clears once the guard is gone
        drop(_guard);
        db.begin_import(fedora).unwrap();
    }

    /// Build a miniature createrepo-style primary_db on disk.
    pub(crate) async fn write_test_snapshot(path: &Path) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();

        let schema = "
            CREATE TABLE packages (
                pkgKey INTEGER PRIMARY KEY, pkgId TEXT, name TEXT, arch TEXT,
                version TEXT, epoch TEXT, release TEXT, summary TEXT,
                description TEXT, url TEXT, time_file INTEGER, time_build INTEGER,
                rpm_license TEXT, rpm_vendor TEXT, rpm_group TEXT,
                rpm_buildhost TEXT, rpm_sourcerpm TEXT, rpm_header_start INTEGER,
                rpm_header_end INTEGER, rpm_packager TEXT, size_package INTEGER,
                size_installed INTEGER, size_archive INTEGER, location_href TEXT,
                location_base TEXT, checksum_type TEXT);
            CREATE TABLE provides (name TEXT, flags TEXT, epoch TEXT,
                version TEXT, release TEXT, pkgKey INTEGER);
            CREATE TABLE requires (name TEXT, flags TEXT, epoch TEXT,
                version TEXT, release TEXT, pkgKey INTEGER, pre BOOLEAN);
            CREATE TABLE recommends (name TEXT, flags TEXT, epoch TEXT,
                version TEXT, release TEXT, pkgKey INTEGER);
            CREATE TABLE files (name TEXT, type TEXT, pkgKey INTEGER);
        ";
        for statement in schema.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&mut conn).await.unwrap();
            }
        }

        sqlx::query(
            "INSERT INTO packages (pkgKey, pkgId, name, arch, version, epoch,
                release, summary, rpm_sourcerpm, location_href, checksum_type)
            VALUES (41, 'abc123', 'bash', 'x86_64', '5.2.26', '0', '1.fc40',
                'The GNU Bourne Again shell', 'bash-5.2.26-1.fc40.src.rpm',
                'Packages/b/bash-5.2.26-1.fc40.x86_64.rpm', 'sha256')",
        )
        .execute(&mut conn)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO provides (name, flags, epoch, version, release, pkgKey)
            VALUES ('/bin/bash', NULL, NULL, NULL, NULL, 41)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO requires (name, flags, epoch, version, release, pkgKey, pre)
            VALUES ('glibc', 'GE', '0', '2.34', NULL, 41, 'FALSE')",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO recommends (name, flags, epoch, version, release, pkgKey)
            VALUES ('bash-completion', NULL, NULL, NULL, NULL, 41)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO files (name, type, pkgKey)
            VALUES ('/usr/bin/bash', 'file', 41)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
    }
}
