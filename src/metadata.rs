use crate::chksums::Checksum;
use crate::compression::{Compression, Decompressor, SQLITE_MAGIC};
use crate::db;
use crate::errors::*;
use crate::fetcher::HttpClient;
use async_tempfile::TempFile;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use url::Url;

/// repomd.xml is a small index; anything bigger than this is not one.
const REPOMD_MEMORY_LIMIT: u64 = 32 * 1024 * 1024;

#[derive(Debug, PartialEq, Deserialize)]
pub struct RepoMd {
    data: Vec<Data>,
}

impl RepoMd {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let xml = serde_xml_rs::from_str(xml)?;
        Ok(xml)
    }

    pub fn find_primary_db(&self) -> Result<&Data> {
        self.data
            .iter()
            .find(|e| e.data_type == "primary_db")
            .ok_or(Error::MetadataMissing)
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Data {
    #[serde(rename = "@type")]
    data_type: String,
    location: Location,
    checksum: Option<DeclaredChecksum>,
    #[serde(rename = "open-checksum")]
    open_checksum: Option<DeclaredChecksum>,
}

impl Data {
    pub fn href(&self) -> &str {
        &self.location.href
    }

    pub fn checksum(&self) -> Result<&DeclaredChecksum> {
        self.checksum.as_ref().ok_or(Error::MetadataMissing)
    }

    pub fn open_checksum(&self) -> Option<&DeclaredChecksum> {
        self.open_checksum.as_ref()
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Location {
    #[serde(rename = "@href")]
    href: String,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct DeclaredChecksum {
    #[serde(rename = "@type")]
    pub checksum_type: String,
    #[serde(rename = "#text")]
    pub value: String,
}

/// Bring the store's view of one repository up to date in a single atomic
/// step: fetch repomd.xml, stream-download the primary_db while hashing it,
/// verify, decompress, validate, and hand the snapshot to the store. Both
/// temp files are cleaned up on every exit path.
pub async fn sync_repo(db: &db::Client, http: &HttpClient, repo: &db::Repo) -> Result<()> {
    let repomd_url = resolve_url(&repo.base_url, &repo.repomd_url)?;
    info!("Syncing repository {:?} from {repomd_url}", repo.name);

    let bytes = http
        .download_to_memory(repomd_url.as_str(), REPOMD_MEMORY_LIMIT)
        .await?;
    let text = std::str::from_utf8(&bytes)?;
    if looks_like_interstitial(text) {
        return Err(Error::Blocked);
    }

    let repomd = RepoMd::from_xml(text)?;
    let primary = repomd.find_primary_db()?;
    let declared = primary.checksum()?;
    let hasher = Checksum::for_type(&declared.checksum_type)?;

    let location = resolve_url(&repo.base_url, primary.href())?;
    info!("Downloading primary database from {location}");

    let compressed = TempFile::new_with_name(temp_name("primary-db")).await?;
    let compressed_path = compressed.file_path().clone();
    let (_, digest) = http
        .download_to_file(location.as_str(), &compressed_path, Some(hasher))
        .await?;

    let digest = digest.unwrap_or_default();
    if !digest.eq_ignore_ascii_case(declared.value.trim()) {
        return Err(Error::ChecksumMismatch {
            url: location.to_string(),
            expected: declared.value.trim().to_string(),
            actual: digest,
        });
    }

    let snapshot = TempFile::new_with_name(temp_name("snapshot")).await?;
    let snapshot_path = snapshot.file_path().clone();
    decompress_to(&compressed_path, &snapshot_path).await?;

    if let Some(declared) = primary.open_checksum() {
        verify_file_digest(&snapshot_path, declared).await?;
    }

    let mut magic = [0u8; SQLITE_MAGIC.len()];
    let mut file = File::open(&snapshot_path).await?;
    if file.read_exact(&mut magic).await.is_err() || magic != *SQLITE_MAGIC {
        return Err(Error::InvalidSnapshot(
            "decompressed payload is not a SQLite database".to_string(),
        ));
    }
    drop(file);

    db.import_snapshot_into(&snapshot_path, repo.id).await?;
    info!("Repository {:?} is up to date", repo.name);
    Ok(())
}

async fn decompress_to(src: &std::path::Path, dest: &std::path::Path) -> Result<()> {
    let mut file = File::open(src).await?;
    let mut header = [0u8; 8];
    let n = file.read(&mut header).await?;
    let compression = Compression::detect(&header[..n]);
    drop(file);
    debug!("Detected primary database compression: {compression:?}");

    let file = File::open(src).await?;
    let reader = io::BufReader::new(file);
    let mut decoder = Decompressor::new(compression, reader);

    let mut out = File::create(dest).await?;
    io::copy(&mut decoder, &mut out)
        .await
        .map_err(|err| Error::InvalidSnapshot(format!("decompression failed: {err}")))?;
    out.flush().await?;
    Ok(())
}

/// Re-hash a finished file against a declared digest (the `open-checksum`
/// covers the decompressed snapshot).
async fn verify_file_digest(path: &std::path::Path, declared: &DeclaredChecksum) -> Result<()> {
    let mut hasher = Checksum::for_type(&declared.checksum_type)?;
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize_hex();
    if !digest.eq_ignore_ascii_case(declared.value.trim()) {
        return Err(Error::ChecksumMismatch {
            url: path.display().to_string(),
            expected: declared.value.trim().to_string(),
            actual: digest,
        });
    }
    Ok(())
}

/// Resolve a possibly-relative href against the repository base URL. The
/// base is treated as a directory even when it lacks a trailing slash.
pub fn resolve_url(base: &str, href: &str) -> Result<Url> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Ok(Url::parse(href)?);
    }
    let mut base_url = Url::parse(base)?;
    if !base_url.path().ends_with('/') {
        base_url.set_path(&format!("{}/", base_url.path()));
    }
    Ok(base_url.join(href)?)
}

/// Corporate proxies and CDNs answer metadata URLs with challenge pages
/// instead of XML. Treat anything HTML-shaped that is not a repomd document
/// as a block.
fn looks_like_interstitial(text: &str) -> bool {
    let lower = text.trim_start().to_ascii_lowercase();
    if lower.contains("<repomd") {
        return false;
    }
    lower.starts_with("<!doctype html") || lower.contains("<html")
}

fn temp_name(kind: &str) -> String {
    format!("windnf-{}-{kind}.tmp", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo" xmlns:rpm="http://linux.duke.edu/metadata/rpm">
  <revision>1712990641</revision>
  <data type="primary">
    <checksum type="sha256">fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158</checksum>
    <open-checksum type="sha256">259d84fce5ecb46226a21765561539eb992fff76356df088f9ed3d1d3d44cd28</open-checksum>
    <location href="repodata/fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158-primary.xml.gz"/>
    <timestamp>1712990625</timestamp>
    <size>7587566</size>
  </data>
  <data type="primary_db">
    <checksum type="sha256">caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a</checksum>
    <open-checksum type="sha256">a35a9e10b149715434f405d3b5f3a895699d9a2939adb3435358337194bad323</open-checksum>
    <location href="repodata/caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a-primary.sqlite.bz2"/>
    <timestamp>1712990625</timestamp>
    <size>2013585</size>
  </data>
</repomd>
"#;

    #[test]
    fn test_parse_repomd_and_find_primary_db() {
        let md = RepoMd::from_xml(REPOMD).unwrap();
        let primary = md.find_primary_db().unwrap();
        assert_eq!(
            primary.href(),
            "repodata/caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a-primary.sqlite.bz2"
        );
        let checksum = primary.checksum().unwrap();
        assert_eq!(checksum.checksum_type, "sha256");
        assert_eq!(
            checksum.value,
            "caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a"
        );
        assert_eq!(
            primary.open_checksum.as_ref().unwrap().value,
            "a35a9e10b149715434f405d3b5f3a895699d9a2939adb3435358337194bad323"
        );
    }

    #[test]
    fn test_missing_primary_db_entry() {
        let xml = r#"<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="filelists">
    <checksum type="sha256">00</checksum>
    <location href="repodata/filelists.xml.gz"/>
  </data>
</repomd>"#;
        let md = RepoMd::from_xml(xml).unwrap();
        assert!(matches!(
            md.find_primary_db().unwrap_err(),
            Error::MetadataMissing
        ));
    }

    #[test]
    fn test_interstitial_detection() {
        assert!(looks_like_interstitial(
            "<!DOCTYPE html><html><body>Checking your browser...</body></html>"
        ));
        assert!(looks_like_interstitial(
            "<html><head><title>Sign in to continue</title></head></html>"
        ));
        assert!(!looks_like_interstitial(REPOMD));
        assert!(!looks_like_interstitial("<?xml version=\"1.0\"?><notrepomd/>"));
    }

    #[test]
    fn test_resolve_url() {
        let url = resolve_url("https://mirror.example.com/fedora", "repodata/repomd.xml").unwrap();
        assert_eq!(
            url.as_str(),
            "https://mirror.example.com/fedora/repodata/repomd.xml"
        );

        let url = resolve_url(
            "https://mirror.example.com/fedora/",
            "https://cdn.example.com/abs/primary.sqlite.gz",
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/abs/primary.sqlite.gz");
    }

    #[tokio::test]
    async fn test_verify_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.sqlite");
        let payload = b"SQLite format 3\0payload";
        tokio::fs::write(&path, payload).await.unwrap();

        let good = DeclaredChecksum {
            checksum_type: "sha256".to_string(),
            value: crate::chksums::sha256_hex(payload),
        };
        verify_file_digest(&path, &good).await.unwrap();

        let bad = DeclaredChecksum {
            checksum_type: "sha256".to_string(),
            value: "00".repeat(32),
        };
        assert!(matches!(
            verify_file_digest(&path, &bad).await.unwrap_err(),
            Error::ChecksumMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_decompress_plain_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        tokio::fs::write(&src, b"SQLite format 3\0rest of the database")
            .await
            .unwrap();

        decompress_to(&src, &dest).await.unwrap();
        let out = tokio::fs::read(&dest).await.unwrap();
        assert!(out.starts_with(SQLITE_MAGIC));
    }
}
