// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Base-image cache with per-key build serialization.
//!
//! Builds of the same key are serialized behind a lock that is created the
//! first time the key is seen and kept for the life of the cache. Builds of
//! different keys never contend with one another. Nothing is evicted.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use slog::{debug, info, Logger};

pub struct ImageCache {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    log: Logger,
}

impl ImageCache {
    pub fn new(log: &Logger) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            log: log.new(slog::o!("component" => "image-cache")),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("image cache lock poisoned");
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Number of keys that have ever been requested.
    pub fn key_count(&self) -> usize {
        self.locks.lock().expect("image cache lock poisoned").len()
    }

    /// Ensures `target` exists, calling `build` to create it if needed.
    ///
    /// At most one `build` runs for a given `key` at any time. A caller
    /// that queued behind another builder re-checks `target` once it holds
    /// the key's lock and returns without building if it now exists.
    /// `build` must not leave a partial file at `target` when it fails.
    pub async fn fetch<F, Fut, E>(
        &self,
        key: &str,
        target: &Path,
        build: F,
    ) -> Result<(), E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<std::io::Error>,
    {
        if tokio::fs::try_exists(target).await? {
            return Ok(());
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(target).await? {
            debug!(self.log, "image built while waiting";
                "key" => key, "target" => %target.display());
            return Ok(());
        }

        info!(self.log, "building cached image";
            "key" => key, "target" => %target.display());
        build(target.to_path_buf()).await
    }
}
