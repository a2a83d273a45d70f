use crate::chksums::{Checksum, Hasher};
use crate::config::Config;
use crate::errors::*;
use backon::{ExponentialBuilder, Retryable};
use futures::TryStreamExt;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;

pub const USER_AGENT: &str = concat!("windnf/", env!("CARGO_PKG_VERSION"));

/// First delay of the transport-level backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(300);
const POOL_MAX_IDLE: usize = 10;

/// Transport policy, resolved once from the config file. Environment proxy
/// variables are deliberately ignored: either `proxy_url` is set and used
/// exclusively, or no proxy at all.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub verify_tls: bool,
    pub ca_bundle: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub use_negotiate_auth: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            max_retries: 3,
            verify_tls: true,
            ca_bundle: None,
            proxy_url: None,
            use_negotiate_auth: true,
        }
    }
}

impl FetchPolicy {
    pub fn from_config(config: &Config) -> Self {
        FetchPolicy {
            connect_timeout: Duration::from_secs(config.network.timeout_connect),
            read_timeout: Duration::from_secs(config.network.timeout_read),
            max_retries: config.network.retries,
            verify_tls: config.network.verify_ssl,
            ca_bundle: config.ca_bundle().map(PathBuf::from),
            proxy_url: config.proxy_url().map(String::from),
            use_negotiate_auth: config.network.use_sspi,
        }
    }
}

/// HTTP transport with one pooled session. Proxies that negotiate
/// per-connection authentication (NTLM/Kerberos) invalidate tickets when the
/// pool churns, so the session is torn down and rebuilt as a unit.
pub struct HttpClient {
    policy: FetchPolicy,
    session: Mutex<reqwest::Client>,
}

impl HttpClient {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let session = build_session(&policy)?;
        Ok(HttpClient {
            policy,
            session: Mutex::new(session),
        })
    }

    /// Fetch a small document fully into memory, bounded by `limit` bytes.
    pub async fn download_to_memory(&self, url: &str, limit: u64) -> Result<Vec<u8>> {
        let resp = self.get_checked(url).await?;
        if let Some(len) = resp.content_length() {
            if len > limit {
                return Err(Error::TooLarge(len));
            }
        }

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.try_next().await? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(Error::TooLarge((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Stream an artifact to disk without buffering it. Data lands in a
    /// `.part` file next to the destination and is renamed on success; an
    /// optional checksum is fed every chunk as it is written and returned as
    /// a hex digest.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        checksum: Option<Checksum>,
    ) -> Result<(u64, Option<String>)> {
        let resp = self.get_checked(url).await?;

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let part = part_path(dest);
        let mut file = fs::File::create(&part).await?;
        let stream = resp.bytes_stream();
        let reader = StreamReader::new(stream.map_err(io::Error::other));

        let streamed: Result<(u64, Option<String>)> = async {
            let result = match checksum {
                Some(checksum) => {
                    let mut reader = Hasher::new(reader, checksum);
                    let written = io::copy(&mut reader, &mut file).await?;
                    let (_, digest, _) = reader.digest();
                    (written, Some(digest))
                }
                None => {
                    let mut reader = reader;
                    let written = io::copy(&mut reader, &mut file).await?;
                    (written, None)
                }
            };
            file.flush().await?;
            Ok(result)
        }
        .await;

        drop(file);
        match streamed {
            Ok((written, digest)) => {
                fs::rename(&part, dest).await?;
                debug!("Downloaded {url} -> {dest:?} ({written} bytes)");
                Ok((written, digest))
            }
            Err(err) => {
                let _ = fs::remove_file(&part).await;
                Err(err)
            }
        }
    }

    /// One GET with both recovery layers: exponential backoff for transport
    /// faults, then a single session-renewal retry for authentication faults.
    async fn get_checked(&self, url: &str) -> Result<reqwest::Response> {
        let result = self.get_with_backoff(url).await;
        match result {
            Err(err) if self.policy.use_negotiate_auth && err.wants_session_renewal() => {
                warn!("Connection rejected ({err}), renewing session and retrying");
                self.renew_session().await?;
                self.get_once(url).await
            }
            other => other,
        }
    }

    async fn get_with_backoff(&self, url: &str) -> Result<reqwest::Response> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(BACKOFF_BASE)
            .with_max_times(self.policy.max_retries as usize);

        (|| self.get_once(url))
            .retry(backoff)
            .when(Error::is_retryable)
            .notify(|err: &Error, dur: Duration| {
                warn!("Request failed ({err}), retrying in {dur:?}");
            })
            .await
    }

    async fn get_once(&self, url: &str) -> Result<reqwest::Response> {
        let session = self.session.lock().await.clone();
        let resp = session.get(url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(url.to_string())),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED | StatusCode::UNAUTHORIZED => {
                Err(Error::AuthRequired(url.to_string()))
            }
            _ => Ok(resp.error_for_status()?),
        }
    }

    async fn renew_session(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        *session = build_session(&self.policy)?;
        Ok(())
    }
}

fn build_session(policy: &FetchPolicy) -> Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(policy.connect_timeout)
        .read_timeout(policy.read_timeout)
        .pool_max_idle_per_host(POOL_MAX_IDLE);

    builder = match &policy.proxy_url {
        Some(proxy_url) => builder.proxy(reqwest::Proxy::all(proxy_url)?),
        None => builder.no_proxy(),
    };

    if !policy.verify_tls {
        warn!("TLS verification disabled (insecure)");
        builder = builder.danger_accept_invalid_certs(true);
    } else if let Some(path) = &policy.ca_bundle {
        let pem = std::fs::read(path)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}
