//! Read-through disk cache for upstream artifacts.
//!
//! Entries live at `{cache_dir}/{filename}` and are written exactly once:
//! the body is streamed into a scratch file in the same directory and
//! renamed into place, so a reader sees either no file or the whole file.
//! Scratch files are named `{filename}.{random}.tmp`.

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use zmirror_core::MirrorConfig;

use crate::artifact::ArtifactId;
use crate::error::{FetchError, FetchResult};
use crate::slots::SlotMap;

const SCRATCH_SUFFIX: &str = ".tmp";

/// How a successful [`ArtifactCache::ensure_cached`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Already on disk; no slot was taken
    Hit,
    /// Another request published it while this one waited for the slot
    Coalesced,
    /// This request downloaded and published it
    Fetched { bytes: u64, elapsed: Duration },
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Coalesced => "coalesced",
            CacheOutcome::Fetched { .. } => "fetched",
        }
    }
}

pub struct ArtifactCache {
    dir: PathBuf,
    upstream: String,
    client: Client,
    slots: SlotMap,
}

impl ArtifactCache {
    /// Create a cache rooted at `dir` that fills from `upstream`.
    ///
    /// `client` should be the long-lived client from
    /// [`build_client`](crate::client::build_client); its timeout bounds
    /// every download.
    pub fn new(dir: impl Into<PathBuf>, upstream: &str, client: Client) -> Self {
        ArtifactCache {
            dir: dir.into(),
            upstream: upstream.trim_end_matches('/').to_string(),
            client,
            slots: SlotMap::new(),
        }
    }

    pub fn from_config(config: &MirrorConfig, client: Client) -> Self {
        Self::new(config.cache.dir.clone(), &config.upstream.url, client)
    }

    /// Final on-disk location of an artifact.
    pub fn path_for(&self, id: &ArtifactId) -> PathBuf {
        self.dir.join(id.filename())
    }

    /// Where the artifact is fetched from.
    pub fn upstream_url(&self, id: &ArtifactId) -> String {
        format!("{}/{}", self.upstream, id.upstream_path())
    }

    /// Returns true if the artifact is published in the cache.
    pub async fn contains(&self, id: &ArtifactId) -> bool {
        is_published(&self.path_for(id)).await
    }

    /// Number of filenames with a download in progress or queued.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Make sure the artifact is on disk, downloading it if necessary.
    ///
    /// Concurrent callers for the same filename share a single download:
    /// one of them fetches while the rest wait on the slot and then find
    /// the published file. Dropping the returned future abandons the
    /// download, deletes its scratch file, and frees the slot.
    pub async fn ensure_cached(&self, id: &ArtifactId) -> FetchResult<CacheOutcome> {
        let path = self.path_for(id);

        if is_published(&path).await {
            debug!(filename = %id, "cache hit");
            return Ok(CacheOutcome::Hit);
        }

        let _slot = self.slots.acquire(id.filename()).await;

        // Someone else may have finished while we waited
        if is_published(&path).await {
            info!(filename = %id, "artifact was cached by another request while waiting");
            return Ok(CacheOutcome::Coalesced);
        }

        info!(filename = %id, "artifact not in cache, starting download");
        let started = Instant::now();
        let bytes = self.fetch_and_publish(id, &path).await?;

        Ok(CacheOutcome::Fetched {
            bytes,
            elapsed: started.elapsed(),
        })
    }

    /// Download `id` into a scratch file and rename it to `dest`.
    ///
    /// The caller must hold the slot for `id`.
    async fn fetch_and_publish(&self, id: &ArtifactId, dest: &Path) -> FetchResult<u64> {
        let url = self.upstream_url(id);
        info!(filename = %id, url = %url, "fetching artifact from upstream");

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(filename = %id, url = %url, error = %e, "upstream request failed");
                return Err(FetchError::UpstreamTransport { url, source: e });
            }
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                warn!(filename = %id, url = %url, "artifact not found on upstream");
                return Err(FetchError::UpstreamNotFound { url });
            }
            status => {
                error!(
                    filename = %id,
                    url = %url,
                    status = status.as_u16(),
                    "upstream returned non-OK status"
                );
                return Err(FetchError::UpstreamStatus { url, status });
            }
        }

        // Dropping `scratch` on any early return deletes the file
        let scratch = self.create_scratch(id)?;
        let mut file = scratch
            .as_file()
            .try_clone()
            .map(fs::File::from_std)
            .map_err(|e| FetchError::local_io(scratch.path(), e))?;

        let mut body = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    error!(filename = %id, url = %url, error = %e, "upstream body read failed");
                    return Err(FetchError::UpstreamTransport { url, source: e });
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                error!(
                    filename = %id,
                    scratch = %scratch.path().display(),
                    error = %e,
                    "failed to write scratch file"
                );
                return Err(FetchError::local_io(scratch.path(), e));
            }
            written += chunk.len() as u64;
        }

        if let Err(e) = finish_file(file).await {
            error!(
                filename = %id,
                scratch = %scratch.path().display(),
                error = %e,
                "failed to flush scratch file"
            );
            return Err(FetchError::local_io(scratch.path(), e));
        }

        let from = scratch.path().to_path_buf();
        if let Err(e) = scratch.persist(dest) {
            error!(
                filename = %id,
                from = %from.display(),
                to = %dest.display(),
                error = %e.error,
                "failed to publish scratch file"
            );
            return Err(FetchError::local_io(dest, e.error));
        }

        info!(filename = %id, bytes = written, "artifact downloaded and cached");
        Ok(written)
    }

    fn create_scratch(&self, id: &ArtifactId) -> FetchResult<tempfile::NamedTempFile> {
        let prefix = format!("{}.", id.filename());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(SCRATCH_SUFFIX);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o644));
        }

        builder.tempfile_in(&self.dir).map_err(|e| {
            error!(
                filename = %id,
                dir = %self.dir.display(),
                error = %e,
                "failed to create scratch file"
            );
            FetchError::local_io(&self.dir, e)
        })
    }

    /// Delete scratch files left behind by a previous process.
    ///
    /// Only call this before serving requests: it cannot tell an orphan
    /// from the scratch file of a download in progress.
    pub async fn sweep_scratch(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(SCRATCH_SUFFIX) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "removed stale scratch file");
                    removed += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), "scratch cleanup failed: {e}"),
            }
        }
        Ok(removed)
    }
}

/// A published entry is any non-directory at the final path.
async fn is_published(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| !meta.is_dir())
        .unwrap_or(false)
}

async fn finish_file(mut file: fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_at(dir: &Path, upstream: &str) -> ArtifactCache {
        ArtifactCache::new(dir, upstream, Client::new())
    }

    #[test]
    fn upstream_url_for_release_and_nightly() {
        let cache = cache_at(Path::new("/tmp/unused"), "https://ziglang.org/");

        let release = ArtifactId::parse("zig-linux-x86_64-0.13.0.tar.xz").unwrap();
        assert_eq!(
            cache.upstream_url(&release),
            "https://ziglang.org/download/0.13.0/zig-linux-x86_64-0.13.0.tar.xz"
        );

        let nightly = ArtifactId::parse("zig-linux-x86_64-0.14.0-dev.123+abcdef12.tar.xz").unwrap();
        assert_eq!(
            cache.upstream_url(&nightly),
            "https://ziglang.org/builds/zig-linux-x86_64-0.14.0-dev.123+abcdef12.tar.xz"
        );
    }

    #[tokio::test]
    async fn existing_file_is_a_hit_without_slots() {
        let dir = tempfile::tempdir().unwrap();
        // Port 1 refuses connections: a fetch attempt would fail loudly.
        let cache = cache_at(dir.path(), "http://127.0.0.1:1");
        let id = ArtifactId::parse("zig-0.13.0.tar.xz").unwrap();
        std::fs::write(cache.path_for(&id), b"cached").unwrap();

        assert!(cache.contains(&id).await);
        assert_eq!(cache.ensure_cached(&id).await.unwrap(), CacheOutcome::Hit);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn directory_at_final_path_is_not_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), "http://127.0.0.1:1");
        let id = ArtifactId::parse("zig-0.13.0.zip").unwrap();
        std::fs::create_dir(cache.path_for(&id)).unwrap();

        assert!(!cache.contains(&id).await);
    }

    #[tokio::test]
    async fn sweep_removes_only_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), "http://127.0.0.1:1");
        std::fs::write(dir.path().join("zig-0.13.0.tar.xz"), b"keep").unwrap();
        std::fs::write(dir.path().join("zig-0.13.0.tar.xz.abc123.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("zig-0.12.0.zip.xyz.tmp"), b"partial").unwrap();
        std::fs::create_dir(dir.path().join("nested.tmp")).unwrap();

        assert_eq!(cache.sweep_scratch().await.unwrap(), 2);
        assert!(dir.path().join("zig-0.13.0.tar.xz").exists());
        assert!(dir.path().join("nested.tmp").is_dir());
        assert!(!dir.path().join("zig-0.13.0.tar.xz.abc123.tmp").exists());
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Coalesced.as_str(), "coalesced");
        let fetched = CacheOutcome::Fetched {
            bytes: 1,
            elapsed: Duration::from_millis(1),
        };
        assert_eq!(fetched.as_str(), "fetched");
    }
}
