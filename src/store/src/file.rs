// Copyright 2024 The Journal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io::Write as _,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use journal_proto::{parse_content_name, Fragment};

use crate::{async_trait, Error, FragmentStore, Result};

/// A fragment store over the local filesystem. `file://` store URLs are
/// resolved beneath a configured root directory, so a broker cannot be
/// directed outside of it.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FileStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory of a journal's objects under the |store| URL.
    fn journal_dir(&self, store: &str, journal: &str) -> Result<PathBuf> {
        let rest = store
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::UnknownScheme(store.to_string()))?;

        let mut dir = self.root.clone();
        for part in rest.split('/').chain(journal.split('/')) {
            if part.is_empty() || part == "." || part == ".." {
                continue;
            }
            dir.push(part);
        }
        Ok(dir)
    }

    fn object_path(&self, fragment: &Fragment) -> Result<PathBuf> {
        Ok(self
            .journal_dir(&fragment.backing_store, &fragment.journal)?
            .join(fragment.content_name()))
    }
}

fn mod_time_of(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default()
        .as_secs() as i64
}

#[async_trait]
impl FragmentStore for FileStore {
    async fn persist(&self, fragment: &Fragment, content: Bytes) -> Result<i64> {
        let path = self.object_path(fragment)?;
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            // Content-addressed: an existing object is already this content.
            return Ok(mod_time_of(&metadata));
        }
        let dir = path.parent().expect("object path has a parent").to_owned();

        let mod_time = tokio::task::spawn_blocking(move || -> Result<i64> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&content)?;
            let file = tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
            file.sync_all()?;
            Ok(mod_time_of(&file.metadata()?))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        Ok(mod_time)
    }

    async fn open(&self, fragment: &Fragment) -> Result<Bytes> {
        let path = self.object_path(fragment)?;
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, store: &str, journal: &str) -> Result<Vec<Fragment>> {
        let dir = self.journal_dir(store, journal)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // A journal with nothing persisted has no directory yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut fragments = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            match parse_content_name(journal, name) {
                Some(mut fragment) => {
                    fragment.backing_store = store.to_string();
                    fragment.mod_time = mod_time_of(&metadata);
                    fragments.push(fragment);
                }
                None => tracing::warn!(?name, journal, "skipping unparseable fragment object"),
            }
        }
        fragments.sort_by(|a, b| (a.begin, a.end).cmp(&(b.begin, b.end)));
        Ok(fragments)
    }

    async fn sign_get(&self, fragment: &Fragment, ttl: Duration) -> Result<String> {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + ttl.as_secs();
        Ok(format!(
            "file://{}?expires={}",
            self.object_path(fragment)?.display(),
            expires,
        ))
    }

    async fn remove(&self, fragment: &Fragment) -> Result<()> {
        let path = self.object_path(fragment)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
