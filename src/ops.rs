use crate::args;
use crate::config::Config;
use crate::db::{self, Package, Repo, RepoType, SearchHit};
use crate::errors::*;
use crate::fetcher::{FetchPolicy, HttpClient};
use crate::metadata;
use crate::nevra::Nevra;
use crate::resolver::{self, ResolveRequest, Resolution};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::{self, Write};
use std::path::Path;
use tokio::fs;
use url::Url;

/// Command layer. Owns its collaborators for the lifetime of one invocation;
/// nothing here is global.
pub struct Operations {
    config: Config,
    db: db::Client,
    http: HttpClient,
}

impl Operations {
    pub async fn new(config: Config) -> Result<Self> {
        let db = db::Client::create(&config.db_path()?).await?;
        let http = HttpClient::new(FetchPolicy::from_config(&config))?;
        Ok(Operations { config, db, http })
    }

    // ---- repository management ----

    pub async fn repo_add(&self, args: &args::RepoAdd) -> Result<()> {
        let repo_type = RepoType::parse(&args.repo_type)?;
        let source_repo_id = match &args.source_repo {
            Some(name) => {
                let source = self
                    .db
                    .get_repo(name)
                    .await?
                    .ok_or_else(|| Error::InvalidArgument(format!("source repository {name:?} does not exist")))?;
                Some(source.id)
            }
            None => None,
        };

        let id = self
            .db
            .add_repo(
                &args.name,
                &args.base_url,
                &args.repomd,
                repo_type,
                source_repo_id,
            )
            .await?;
        info!("Repository {:?} added or updated", args.name);

        if args.sync {
            let repo = self
                .db
                .get_repo_by_id(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("repository {:?}", args.name)))?;
            metadata::sync_repo(&self.db, &self.http, &repo).await?;
        }
        Ok(())
    }

    pub async fn repo_link(&self, args: &args::RepoLink) -> Result<()> {
        self.db.link_source(&args.binary, &args.source).await?;
        info!(
            "Repository {:?} now takes its SRPMs from {:?}",
            args.binary, args.source
        );
        Ok(())
    }

    pub async fn repo_list(&self) -> Result<()> {
        let repos = self.db.list_repos().await?;
        if repos.is_empty() {
            println!("No repositories configured.");
            return Ok(());
        }
        for repo in repos {
            let last_updated = repo
                .last_updated
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{:<20} {:<7} {} (last sync: {last_updated})",
                repo.name, repo.repo_type, repo.base_url
            );
        }
        Ok(())
    }

    pub async fn repo_sync(&self, args: &args::RepoSync) -> Result<()> {
        let repos = if args.all {
            self.db.list_repos().await?
        } else {
            if args.names.is_empty() {
                return Err(Error::InvalidArgument(
                    "specify repository names or --all".to_string(),
                ));
            }
            let mut repos = Vec::with_capacity(args.names.len());
            for name in &args.names {
                let repo = self
                    .db
                    .get_repo(name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("repository {name:?}")))?;
                repos.push(repo);
            }
            repos
        };

        // strictly serial: the proxy auth session is stateful and does not
        // tolerate concurrent connection churn
        let mut first_error = None;
        for repo in &repos {
            if let Err(err) = metadata::sync_repo(&self.db, &self.http, repo).await {
                error!("Failed to sync repository {:?}: {err}", repo.name);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn repo_del(&self, args: &args::RepoDel) -> Result<()> {
        let names: Vec<String> = if args.all {
            self.db
                .list_repos()
                .await?
                .into_iter()
                .map(|r| r.name)
                .collect()
        } else {
            if args.names.is_empty() {
                return Err(Error::InvalidArgument(
                    "specify repository names or --all".to_string(),
                ));
            }
            args.names.clone()
        };

        if names.is_empty() {
            println!("No repositories configured.");
            return Ok(());
        }

        if !args.force {
            let prompt = format!(
                "Delete {} repositor{} and all indexed packages?",
                names.len(),
                if names.len() == 1 { "y" } else { "ies" }
            );
            if !confirm(&prompt)? {
                println!("Aborted.");
                return Ok(());
            }
        }

        for name in &names {
            if self.db.delete_repo(name).await? {
                info!("Deleted repository {name:?}");
            } else {
                warn!("Repository {name:?} not found, skipping");
            }
        }
        Ok(())
    }

    // ---- queries ----

    pub async fn search(&self, args: &args::Search) -> Result<()> {
        let repos = self.repo_filter(&args.repo).await?;

        // one package can match several patterns; merge per pkgKey
        let mut merged: HashMap<i64, (SearchHit, MatchKind)> = HashMap::new();
        for pattern in &args.patterns {
            let hits = self
                .db
                .search_packages(pattern, repos.as_deref(), false)
                .await?;
            for hit in hits {
                let kind = classify_match(pattern, &hit);
                match merged.entry(hit.package.pkg_key) {
                    Entry::Occupied(mut entry) => entry.get_mut().1.merge(kind),
                    Entry::Vacant(entry) => {
                        entry.insert((hit, kind));
                    }
                }
            }
        }

        if merged.is_empty() {
            println!("No packages found matching search criteria.");
            return Ok(());
        }

        let mut hits: Vec<(SearchHit, MatchKind)> = merged.into_values().collect();
        if !args.show_duplicates {
            hits = collapse_to_latest(hits);
        }
        hits.sort_by(|a, b| a.0.package.nevra().cmp(&b.0.package.nevra()));

        for (header, wanted) in [
            ("Name & Summary Matched", MatchKind::NameAndSummary),
            ("Name Matched", MatchKind::Name),
            ("Summary Matched", MatchKind::Summary),
        ] {
            let bucket: Vec<&SearchHit> = hits
                .iter()
                .filter(|(_, kind)| *kind == wanted)
                .map(|(hit, _)| hit)
                .collect();
            if bucket.is_empty() {
                continue;
            }
            println!("=== {header} ===");
            for hit in bucket {
                let package = &hit.package;
                println!(
                    "{} {}-{} ({}) repo: {}",
                    package.name, package.version, package.release, package.arch, hit.repo_name
                );
            }
        }
        Ok(())
    }

    pub async fn info(&self, args: &args::Info) -> Result<()> {
        let repos = self.repo_filter(&args.repo).await?;
        let hits = self
            .db
            .search_packages(&args.pattern, repos.as_deref(), true)
            .await?;

        let mut repo_names: HashMap<i64, String> = HashMap::new();
        for hit in &hits {
            repo_names.insert(hit.package.repo_id, hit.repo_name.clone());
        }

        let candidates: Vec<Package> = hits.into_iter().map(|hit| hit.package).collect();
        let Some(package) = resolver::pick_best(candidates, None) else {
            return Err(Error::NotFound(format!("package {:?}", args.pattern)));
        };

        let nevra = package.nevra();
        println!("Name         : {}", package.name);
        println!("Epoch        : {}", package.epoch);
        println!("Version      : {}", package.version);
        println!("Release      : {}", package.release);
        println!("Architecture : {}", package.arch);
        println!("NEVRA        : {nevra}");
        if let Some(size) = package.size_package {
            println!("Size         : {size}");
        }
        if let Some(size) = package.size_installed {
            println!("Installed    : {size}");
        }
        if let Some(sourcerpm) = package.sourcerpm.as_deref().filter(|s| !s.is_empty()) {
            println!("Source       : {sourcerpm}");
        }
        if let Some(repo_name) = repo_names.get(&package.repo_id) {
            println!("Repository   : {repo_name}");
        }
        if let Some(license) = &package.license {
            println!("License      : {license}");
        }
        if let Some(url) = package.url.as_deref().filter(|s| !s.is_empty()) {
            println!("URL          : {url}");
        }
        if let Some(summary) = &package.summary {
            println!("Summary      : {summary}");
        }
        if let Some(description) = &package.description {
            println!("Description  :");
            for line in description.lines() {
                println!("  {line}");
            }
        }
        Ok(())
    }

    pub async fn resolve(&self, args: &args::Resolve) -> Result<()> {
        let repos = self.repo_filter(&args.repo).await?;
        let request = ResolveRequest {
            patterns: args.patterns.clone(),
            repos,
            arch: args.arch.clone(),
            recursive: args.recursive.is_some(),
            max_depth: args.recursive.flatten(),
            include_weak: args.weak,
            include_source: false,
        };

        let resolution = resolver::resolve(&self.db, &request).await?;
        self.print_resolution(&resolution).await?;

        if let Some(pattern) = resolution.not_found.first() {
            return Err(Error::NotFound(format!("package {pattern:?}")));
        }
        Ok(())
    }

    async fn print_resolution(&self, resolution: &Resolution) -> Result<()> {
        let repo_names: HashMap<i64, String> = self
            .db
            .list_repos()
            .await?
            .into_iter()
            .map(|r| (r.id, r.name))
            .collect();

        for pkg_key in &resolution.resolved {
            let Some(package) = self.db.get_by_key(*pkg_key).await? else {
                continue;
            };
            let repo = repo_names
                .get(&package.repo_id)
                .map(String::as_str)
                .unwrap_or("?");
            println!("{} repo: {repo}", package.nevra());
        }
        for capability in &resolution.unsatisfied {
            println!("No provider found for: {capability}");
        }
        for pattern in &resolution.not_found {
            warn!("Package {pattern:?} not found in configured repositories");
        }
        Ok(())
    }

    // ---- download ----

    pub async fn download(&self, args: &args::Download) -> Result<()> {
        let repos = self.repo_filter(&args.repo).await?;
        let (recursive, max_depth) = match (&args.recurse, args.resolve) {
            (Some(depth), _) => (true, *depth),
            (None, true) => (true, Some(1)),
            (None, false) => (false, None),
        };
        let request = ResolveRequest {
            patterns: args.patterns.clone(),
            repos,
            arch: args.arch.clone(),
            recursive,
            max_depth,
            include_weak: false,
            include_source: args.source,
        };

        let resolution = resolver::resolve(&self.db, &request).await?;
        for pattern in &resolution.not_found {
            warn!("Package {pattern:?} not found in configured repositories");
        }
        for capability in &resolution.unsatisfied {
            println!("No provider found for: {capability}");
        }

        let mut targets = Vec::new();
        for pkg_key in &resolution.resolved {
            let Some(package) = self.db.get_by_key(*pkg_key).await? else {
                continue;
            };
            if args.source {
                match self.find_srpm(&package).await? {
                    Some(srpm) => targets.push(srpm),
                    None => {
                        if let Some(sourcerpm) = &package.sourcerpm {
                            warn!("No source repository carries {sourcerpm:?}");
                        }
                    }
                }
            }
            targets.push(package);
        }

        if targets.is_empty() {
            if resolution.not_found.is_empty() {
                println!("Nothing to download.");
                return Ok(());
            }
            return Err(Error::NotFound(format!(
                "package {:?}",
                resolution.not_found[0]
            )));
        }

        if args.urls {
            for package in &targets {
                println!("{}", self.artifact_url(package).await?);
            }
            return Ok(());
        }

        let download_dir = args
            .downloaddir
            .clone()
            .unwrap_or_else(|| self.config.general.download_path.clone());
        fs::create_dir_all(&download_dir).await?;
        if let Some(destdir) = &args.destdir {
            fs::create_dir_all(destdir).await?;
        }

        let mut first_error = None;
        for package in &targets {
            if let Err(err) = self.fetch_artifact(package, &download_dir, args.destdir.as_deref()).await {
                error!("Failed to download {}: {err}", package.nevra());
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_artifact(
        &self,
        package: &Package,
        download_dir: &Path,
        destdir: Option<&Path>,
    ) -> Result<()> {
        let url = self.artifact_url(package).await?;
        let filename = artifact_filename(&package.location_href)?;
        let dest = download_dir.join(&filename);

        if fs::try_exists(&dest).await? {
            info!("Already downloaded: {filename}");
        } else {
            info!("Downloading {url}");
            self.http.download_to_file(url.as_str(), &dest, None).await?;
            info!("Downloaded: {filename}");
        }

        if let Some(destdir) = destdir {
            fs::copy(&dest, destdir.join(&filename)).await?;
        }
        Ok(())
    }

    /// `location_base` overrides the repository base URL when present.
    async fn artifact_url(&self, package: &Package) -> Result<Url> {
        let repo = self
            .db
            .get_repo_by_id(package.repo_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository id {}", package.repo_id)))?;
        artifact_url_for(&repo, package)
    }

    /// Locate the SRPM a binary package was built from, preferring the
    /// linked source repository of the package's own repo.
    async fn find_srpm(&self, package: &Package) -> Result<Option<Package>> {
        let Some(sourcerpm) = package.sourcerpm.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let nevra = match Nevra::from_rpm_filename(sourcerpm) {
            Ok(nevra) => nevra,
            Err(_) => {
                warn!("Cannot parse sourcerpm filename {sourcerpm:?}");
                return Ok(None);
            }
        };

        let source_repo = match self.db.get_repo_by_id(package.repo_id).await? {
            Some(repo) => repo.source_repo_id,
            None => None,
        };
        let filter = source_repo.map(|id| vec![id]);

        let hits = self
            .db
            .search_packages(&nevra.to_string(), filter.as_deref(), true)
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| hit.package)
            .find(Package::is_source))
    }

    async fn repo_filter(&self, names: &[String]) -> Result<Option<Vec<i64>>> {
        if names.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.db.resolve_repo_ids(names).await?))
        }
    }
}

pub fn artifact_url_for(repo: &Repo, package: &Package) -> Result<Url> {
    let base = package
        .location_base
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(&repo.base_url);
    metadata::resolve_url(base, &package.location_href)
}

fn artifact_filename(location_href: &str) -> Result<String> {
    let filename = location_href
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::InvalidArgument(format!("artifact path {location_href:?} has no filename"))
        })?;
    Ok(filename.to_string())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N]: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().eq_ignore_ascii_case("y"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Name,
    Summary,
    NameAndSummary,
}

impl MatchKind {
    fn merge(&mut self, other: MatchKind) {
        if *self != other {
            *self = MatchKind::NameAndSummary;
        }
    }
}

fn classify_match(pattern: &str, hit: &SearchHit) -> MatchKind {
    let package = &hit.package;
    let name_matched = if let Ok(nevra) = Nevra::parse(pattern) {
        nevra.name == package.name
    } else if pattern.contains('*') {
        wildcard_match(pattern, &package.name)
    } else {
        package
            .name
            .to_ascii_lowercase()
            .contains(&pattern.to_ascii_lowercase())
    };
    let summary_matched = package
        .summary
        .as_deref()
        .map(|summary| {
            summary
                .to_ascii_lowercase()
                .contains(&pattern.to_ascii_lowercase())
        })
        .unwrap_or(false);

    match (name_matched, summary_matched) {
        (true, true) => MatchKind::NameAndSummary,
        (false, true) => MatchKind::Summary,
        _ => MatchKind::Name,
    }
}

/// `*`-wildcard match, case-insensitive, anchored at both ends.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let text = text.to_ascii_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let Some(rest) = text.strip_prefix(parts[0]) else {
        return false;
    };
    let mut rest = rest;
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(parts[parts.len() - 1])
}

/// Keep only the newest NEVRA per package name.
fn collapse_to_latest(hits: Vec<(SearchHit, MatchKind)>) -> Vec<(SearchHit, MatchKind)> {
    let mut latest: HashMap<String, (SearchHit, MatchKind)> = HashMap::new();
    for (hit, kind) in hits {
        match latest.entry(hit.package.name.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if hit.package.nevra() > existing.0.package.nevra() {
                    *existing = (hit, kind);
                } else {
                    existing.1.merge(kind);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert((hit, kind));
            }
        }
    }
    latest.into_values().collect()
}
