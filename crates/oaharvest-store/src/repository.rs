//! Artifact repository: local filesystem or S3 object store.
//!
//! Both backends share one narrow interface with `/`-separated paths; the
//! backend is selected once at config load and never mixed within a run.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use oaharvest_core::SHARED_RUNTIME;

/// Uploads at or above this size go through the multipart API.
const MULTIPART_THRESHOLD: usize = 16 * 1024 * 1024;

/// Part size for multipart uploads (S3 minimum is 5 MiB).
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// Object-store connection settings.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Key prefix prepended to every repository path (may be empty).
    pub prefix: String,
}

/// Two-variant artifact repository.
pub enum Repository {
    Local(LocalRepository),
    S3(S3Repository),
}

impl Repository {
    pub fn local(root: &Path) -> Result<Self> {
        Ok(Self::Local(LocalRepository::new(root)?))
    }

    pub fn s3(config: S3Config) -> Result<Self> {
        Ok(Self::S3(S3Repository::new(config)?))
    }

    /// Store an artifact, replacing any previous content.
    pub fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Local(r) => r.put(path, bytes),
            Self::S3(r) => r.put(path, bytes),
        }
    }

    /// Whether a non-empty artifact exists at `path`.
    pub fn has(&self, path: &str) -> Result<bool> {
        match self {
            Self::Local(r) => r.has(path),
            Self::S3(r) => r.has(path),
        }
    }

    /// Read an artifact; `Ok(None)` when missing.
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Local(r) => r.get(path),
            Self::S3(r) => r.get(path),
        }
    }

    /// Lazily enumerate repository-relative paths under a prefix.
    pub fn list_prefix<'a>(
        &'a self,
        prefix: &str,
    ) -> Box<dyn Iterator<Item = Result<String>> + Send + 'a> {
        match self {
            Self::Local(r) => Box::new(r.list_prefix(prefix)),
            Self::S3(r) => Box::new(r.list_prefix(prefix)),
        }
    }

    /// Remove everything under a prefix. An empty prefix clears the
    /// repository (used by `--reset`).
    pub fn delete_prefix(&self, prefix: &str) -> Result<()> {
        match self {
            Self::Local(r) => r.delete_prefix(prefix),
            Self::S3(r) => r.delete_prefix(prefix),
        }
    }
}

// === Local filesystem backend ===

pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create repository root {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            full.push(part);
        }
        full
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // write-then-rename so readers never observe a partial artifact
        let tmp = full.with_extension("tmp");
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &full)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    fn has(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) => Ok(meta.is_file() && meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_prefix(&self, prefix: &str) -> LocalPrefixIter {
        let start = self.resolve(prefix);
        LocalPrefixIter {
            root: self.root.clone(),
            pending_dirs: if start.is_dir() {
                VecDeque::from([start])
            } else {
                VecDeque::new()
            },
            current: None,
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let target = self.resolve(prefix);
        if target == self.root {
            // clear contents but keep the root itself
            for entry in fs::read_dir(&self.root)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
            return Ok(());
        }
        if target.exists() {
            fs::remove_dir_all(&target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        }
        Ok(())
    }
}

/// Depth-first walk yielding repository-relative file paths.
pub struct LocalPrefixIter {
    root: PathBuf,
    pending_dirs: VecDeque<PathBuf>,
    current: Option<fs::ReadDir>,
}

impl Iterator for LocalPrefixIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(read_dir) = self.current.as_mut() {
                match read_dir.next() {
                    Some(Ok(entry)) => {
                        let path = entry.path();
                        if path.is_dir() {
                            self.pending_dirs.push_back(path);
                            continue;
                        }
                        let rel = path
                            .strip_prefix(&self.root)
                            .unwrap_or(&path)
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        return Some(Ok(rel));
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => {
                        self.current = None;
                    }
                }
            }
            let dir = self.pending_dirs.pop_front()?;
            match fs::read_dir(&dir) {
                Ok(rd) => self.current = Some(rd),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

// === S3 object store backend ===

pub struct S3Repository {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Repository {
    pub fn new(config: S3Config) -> Result<Self> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "oaharvest-config",
        );
        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region))
            .credentials_provider(credentials)
            .build();
        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket,
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{path}", self.prefix)
        }
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let key = self.key(path);
        if bytes.len() >= MULTIPART_THRESHOLD {
            return self.put_multipart(&key, bytes);
        }
        SHARED_RUNTIME.handle().block_on(async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(bytes.to_vec()))
                .send()
                .await
                .with_context(|| format!("s3 put failed for {key}"))?;
            Ok(())
        })
    }

    fn put_multipart(&self, key: &str, bytes: &[u8]) -> Result<()> {
        SHARED_RUNTIME.handle().block_on(async {
            let upload = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .with_context(|| format!("s3 multipart init failed for {key}"))?;
            let upload_id = upload
                .upload_id()
                .context("s3 returned no upload id")?
                .to_string();

            let mut parts = Vec::new();
            for (index, chunk) in bytes.chunks(MULTIPART_PART_SIZE).enumerate() {
                let part_number = (index + 1) as i32;
                let response = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk.to_vec()))
                    .send()
                    .await
                    .with_context(|| format!("s3 part {part_number} failed for {key}"))?;
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(response.e_tag().map(String::from))
                        .build(),
                );
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .with_context(|| format!("s3 multipart completion failed for {key}"))?;
            Ok(())
        })
    }

    fn has(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        SHARED_RUNTIME.handle().block_on(async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(head) => Ok(head.content_length().unwrap_or(0) > 0),
                Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
                Err(e) => Err(e).with_context(|| format!("s3 head failed for {key}")),
            }
        })
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let key = self.key(path);
        SHARED_RUNTIME.handle().block_on(async {
            match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(output) => {
                    let bytes = output
                        .body
                        .collect()
                        .await
                        .with_context(|| format!("s3 body read failed for {key}"))?;
                    Ok(Some(bytes.into_bytes().to_vec()))
                }
                Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => Ok(None),
                Err(e) => Err(e).with_context(|| format!("s3 get failed for {key}")),
            }
        })
    }

    fn list_prefix(&self, prefix: &str) -> S3PrefixIter<'_> {
        S3PrefixIter {
            repo: self,
            key_prefix: self.key(prefix),
            buffer: VecDeque::new(),
            continuation: None,
            done: false,
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys: Vec<String> = self
            .list_prefix(prefix)
            .map(|r| r.map(|path| self.key(&path)))
            .collect::<Result<_>>()?;
        SHARED_RUNTIME.handle().block_on(async {
            for key in keys {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .with_context(|| format!("s3 delete failed for {key}"))?;
            }
            Ok(())
        })
    }
}

/// Paginated object listing, fetching one page per exhausted buffer.
pub struct S3PrefixIter<'a> {
    repo: &'a S3Repository,
    key_prefix: String,
    buffer: VecDeque<String>,
    continuation: Option<String>,
    done: bool,
}

impl S3PrefixIter<'_> {
    fn fetch_page(&mut self) -> Result<()> {
        let repo = self.repo;
        let page = SHARED_RUNTIME.handle().block_on(async {
            repo.client
                .list_objects_v2()
                .bucket(&repo.bucket)
                .prefix(&self.key_prefix)
                .set_continuation_token(self.continuation.take())
                .send()
                .await
                .with_context(|| format!("s3 list failed for {}", self.key_prefix))
        })?;

        for object in page.contents() {
            if let Some(key) = object.key() {
                // strip the configured repository prefix back off
                let rel = if repo.prefix.is_empty() {
                    key
                } else {
                    key.strip_prefix(repo.prefix.as_str())
                        .map(|k| k.trim_start_matches('/'))
                        .unwrap_or(key)
                };
                self.buffer.push_back(rel.to_string());
            }
        }

        match page.next_continuation_token() {
            Some(token) => self.continuation = Some(token.to_string()),
            None => self.done = true,
        }
        Ok(())
    }
}

impl Iterator for S3PrefixIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
