//! Link intake: packages, link checks, queueing, read access

use crate::error::{DownloadError, Error, Result};
use crate::model::{FILE, FileSnapshot, FileState, PACKAGE, PackageSnapshot, PackageState, file, package};
use crate::retry::{IsRetryable, with_retry};
use crate::types::EntityId;
use serde_json::json;

use super::Downloader;

impl Downloader {
    /// Add a package holding one file per URL
    ///
    /// The package starts in `collect`, its files in `check`. Nothing is
    /// downloaded until [`Self::start_package`] (or [`Self::start_file`]).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use rangedl::*;
    /// # async fn example(downloader: Downloader) -> Result<()> {
    /// let package = downloader.add_package(
    ///     "ubuntu",
    ///     &["https://example.com/ubuntu.iso".to_string()],
    /// )?;
    /// downloader.check_files(package).await?;
    /// downloader.start_package(package)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_package(&self, name: &str, urls: &[String]) -> Result<EntityId> {
        if urls.is_empty() {
            return Err(Error::Other(format!("package {name:?} has no links")));
        }
        let now = chrono::Utc::now().timestamp();
        let mut ctx = self.store.context();
        let id = ctx.transaction(|ctx| {
            let package = package::create(ctx, name, None)?;
            for url in urls {
                ctx.create(
                    FILE,
                    &[
                        ("package", package.to_value()),
                        ("url", json!(url)),
                        ("added", json!(now)),
                    ],
                )?;
            }
            Ok(package)
        })?;
        tracing::info!(package_id = id.0, name, files = urls.len(), "package added");
        Ok(id)
    }

    /// Ask the hoster for name and size of every unchecked file of a package
    ///
    /// Checked files move to `collect`. Transient failures are retried with
    /// backoff and, if they persist, leave the file in `check` with the error
    /// recorded; a permanent failure (offline link) disables the file.
    pub async fn check_files(&self, package_id: EntityId) -> Result<()> {
        let pending: Vec<(EntityId, String)> = {
            let ctx = self.store.context();
            require(&ctx, PACKAGE, package_id)?;
            let mut pending = Vec::new();
            for id in package::files(&ctx, package_id)? {
                if file::state(&ctx, id)? == FileState::Check {
                    pending.push((id, ctx.get_as(id, "url")?));
                }
            }
            pending
        };

        for (id, url) in pending {
            let checked = with_retry(&self.config.retry, || self.hoster.check(&url)).await;
            if !self.store.exists(id) {
                continue;
            }
            match checked {
                Ok(info) => {
                    let mut ctx = self.store.context();
                    ctx.transaction(|ctx| {
                        if let Some(name) = &info.name
                            && ctx.get_as::<Option<String>>(id, "name")?.is_none()
                        {
                            ctx.set(id, "name", name.as_str())?;
                        }
                        if let Some(size) = info.size {
                            ctx.set(id, "size", size)?;
                            ctx.set(id, "size_is_approximate", info.size_is_approximate)?;
                        }
                        ctx.set(id, "last_error", serde_json::Value::Null)?;
                        if file::state(ctx, id)? == FileState::Check {
                            ctx.set(id, "state", FileState::Collect)?;
                        }
                        Ok(())
                    })?;
                    tracing::debug!(file_id = id.0, name = ?info.name, size = ?info.size, "link checked");
                }
                Err(e) if e.is_retryable() => {
                    let mut ctx = self.store.context();
                    ctx.transaction(|ctx| {
                        ctx.set(id, "last_error", e.to_string())?;
                        Ok(())
                    })?;
                    tracing::warn!(file_id = id.0, error = %e, "link check failed");
                }
                Err(e) => self.record_failure(id, &e.to_string()),
            }
        }
        Ok(())
    }

    /// Queue every enabled, unfinished file of a package and start them
    pub fn start_package(&self, package_id: EntityId) -> Result<()> {
        if !self
            .tasks
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::ShuttingDown);
        }
        let mut ctx = self.store.context();
        require(&ctx, PACKAGE, package_id)?;
        let queued = ctx.transaction(|ctx| {
            if ctx.get_as::<PackageState>(package_id, "state")? == PackageState::Collect {
                ctx.set(package_id, "state", PackageState::Download)?;
            }
            let mut queued = Vec::new();
            for id in package::files(ctx, package_id)? {
                if !ctx.get_as::<bool>(id, "enabled")?
                    || file::state(ctx, id)? == FileState::DownloadComplete
                {
                    continue;
                }
                ctx.set(id, "state", FileState::Download)?;
                queued.push(id);
            }
            Ok(queued)
        })?;
        tracing::info!(package_id = package_id.0, files = queued.len(), "package started");
        for id in queued {
            self.spawn_file_task(id);
        }
        Ok(())
    }

    /// Committed view of one file
    pub fn file(&self, id: EntityId) -> Result<FileSnapshot> {
        let ctx = self.store.context();
        require(&ctx, FILE, id)?;
        file::snapshot(&ctx, id)
    }

    /// Committed view of one package
    pub fn package(&self, id: EntityId) -> Result<PackageSnapshot> {
        let ctx = self.store.context();
        require(&ctx, PACKAGE, id)?;
        package::snapshot(&ctx, id)
    }

    /// All packages in queue order
    pub fn packages(&self) -> Result<Vec<PackageSnapshot>> {
        let ctx = self.store.context();
        package::ordered(&ctx)
            .into_iter()
            .map(|id| package::snapshot(&ctx, id))
            .collect()
    }
}

pub(super) fn require(ctx: &crate::store::TransactionContext, kind: &'static str, id: EntityId) -> Result<()> {
    if ctx.entity_type_of(id) == Some(kind) {
        Ok(())
    } else {
        Err(DownloadError::NotFound { kind, id }.into())
    }
}
