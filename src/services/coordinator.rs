//! Drives a content entry through `stored → waiting → transforming →
//! {transformed|failed}`, gating concurrent transforms to a fixed
//! parallelism and persisting every transition.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::process::{probe, transformer};
use crate::store::meta::{Metadata, SourceType, Status};
use crate::store::Store;

pub const MAX_SOURCE_SIZE: u64 = 8 * 1024 * 1024;

/// Number of simultaneous `transforming` jobs allowed across the process
/// (invariant I7).
const TRANSFORM_SLOTS: usize = 2;

/// Recorded as `source.quality` when the submit-time probe fails. Outside
/// the 1..=100 range a real probe reports, so it can never be mistaken for a
/// measurement; `run_job` checks for it and fails the entry without ever
/// invoking the transformer. The JSON `meta` response omits `qualitylevel`
/// entirely when the field is `0`, so a client never sees it.
const UNPROBED_QUALITY: u32 = 0;

pub struct JobCoordinator {
    store: Store,
    config: Config,
    transform_slots: Arc<Semaphore>,
}

impl JobCoordinator {
    pub fn new(store: Store, config: Config) -> Arc<Self> {
        Arc::new(JobCoordinator {
            store,
            config,
            transform_slots: Arc::new(Semaphore::new(TRANSFORM_SLOTS)),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Admits a new upload, writes its initial metadata, and fires the job
    /// asynchronously. Returns the content id immediately — the caller does
    /// not wait for the job to progress past `stored`.
    pub async fn submit(
        self: &Arc<Self>,
        data: Vec<u8>,
        declared_size: u64,
        mime_type: &str,
        source_name: Option<String>,
    ) -> AppResult<String> {
        if declared_size > MAX_SOURCE_SIZE {
            return Err(AppError::BadRequest(
                "upload is larger than 8MB".to_string(),
            ));
        }
        let source_type = SourceType::from_mime(mime_type)
            .ok_or_else(|| AppError::BadRequest(format!("unsupported content type '{mime_type}'")))?;

        let content_id = self.store.admit(&data, source_type).await?;

        let source_quality = match source_type {
            SourceType::Png => 100,
            SourceType::Jpg => {
                let path = self.store.source_path_for(&content_id, source_type);
                match probe::probe(&self.config.probe_cmd, &path).await {
                    Ok(q) => q,
                    Err(e) => {
                        tracing::warn!(content_id = %content_id, error = %e, "initial probe failed; entry will fail without transforming");
                        UNPROBED_QUALITY
                    }
                }
            }
        };

        let record = Metadata::new_stored(
            content_id.clone(),
            chrono::Utc::now().naive_utc(),
            source_name,
            source_type,
            source_quality,
            data.len() as u64,
        );
        self.store.write_meta(&record).await?;

        let coordinator = Arc::clone(self);
        let job_id = content_id.clone();
        tokio::spawn(async move {
            coordinator.run_job(&job_id).await;
        });

        Ok(content_id)
    }

    /// Drives one entry's job to completion. Idempotent: if the entry is not
    /// in `stored` when called (e.g. a duplicate trigger), it does nothing.
    pub async fn run_job(&self, content_id: &str) {
        let span = tracing::info_span!("job", content_id = %content_id);
        let _enter = span.enter();

        let mut record = match self.store.read_meta(content_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "could not read metadata to start job");
                return;
            }
        };

        if record.status != Status::Stored {
            return;
        }

        record.status = Status::Waiting;
        if let Err(e) = self.store.write_meta(&record).await {
            tracing::error!(error = %e, "failed to persist 'waiting' status");
            return;
        }

        let permit = match self.transform_slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                tracing::error!("transform slot semaphore was closed");
                return;
            }
        };

        record.status = Status::Transforming;
        if let Err(e) = self.store.write_meta(&record).await {
            tracing::error!(error = %e, "failed to persist 'transforming' status");
            drop(permit);
            return;
        }

        if record.source_type == SourceType::Jpg && record.source_quality == UNPROBED_QUALITY {
            drop(permit);
            tracing::warn!("skipping transform: initial source probe never succeeded");
            self.finish_failed(record, content_id).await;
            return;
        }

        let source_path = self.store.source_path_for(content_id, record.source_type);
        let target_path = self.store.target_path_for(content_id);

        let outcome = transformer::transform(&self.config.recompress_cmd, &source_path, &target_path).await;
        drop(permit);

        match outcome {
            Ok(()) => self.finish_success(record, content_id, &target_path).await,
            Err(e) => {
                tracing::warn!(error = %e, "transform failed");
                self.finish_failed(record, content_id).await;
            }
        }
    }

    async fn finish_success(&self, mut record: Metadata, content_id: &str, target_path: &std::path::Path) {
        let target_bytes = match tokio::fs::metadata(target_path).await {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::error!(error = %e, "transform reported success but target is unreadable");
                self.finish_failed(record, content_id).await;
                return;
            }
        };

        let target_quality = match probe::probe(&self.config.probe_cmd, target_path).await {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(error = %e, "target probe failed after successful transform");
                self.finish_failed(record, content_id).await;
                return;
            }
        };

        record.target_quality = Some(target_quality);
        record.target_size = Some(target_bytes);
        record.status = Status::Transformed;

        if let Err(e) = self.store.write_meta(&record).await {
            tracing::error!(error = %e, "failed to persist terminal 'transformed' status");
        }
    }

    async fn finish_failed(&self, mut record: Metadata, content_id: &str) {
        record.status = Status::Failed;
        if let Err(e) = self.store.write_meta(&record).await {
            tracing::error!(content_id = %content_id, error = %e, "failed to persist terminal 'failed' status");
        }
    }

    pub async fn get_meta(&self, content_id: &str) -> AppResult<Metadata> {
        self.store.read_meta(content_id).await
    }

    pub async fn get_source(&self, content_id: &str) -> AppResult<Vec<u8>> {
        self.store.read_source(content_id).await
    }

    /// Fetches the recompressed target. Returns `NOT_FOUND` both when the
    /// content id is unknown and when the entry has not reached
    /// `transformed` yet (I4 guarantees `target.jpg` only exists then).
    pub async fn get_target(&self, content_id: &str) -> AppResult<Vec<u8>> {
        self.store.read_target(content_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_config(bin_dir: &std::path::Path) -> Config {
        Config {
            port: 0,
            storage_base: None,
            probe_cmd: bin_dir.join("identify").to_str().unwrap().to_string(),
            recompress_cmd: bin_dir.join("guetzli").to_str().unwrap().to_string(),
        }
    }

    async fn wait_for_terminal(coordinator: &Arc<JobCoordinator>, id: &str) -> Metadata {
        for _ in 0..200 {
            let m = coordinator.get_meta(id).await.unwrap();
            if matches!(m.status, Status::Transformed | Status::Failed) {
                return m;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn happy_path_jpeg_reaches_transformed() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        write_script(bin_dir.path(), "identify", "#!/bin/sh\necho 80\n");
        write_script(
            bin_dir.path(),
            "guetzli",
            "#!/bin/sh\nhead -c 5 \"$3\" > \"$4\"\n",
        );

        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let id = coordinator
            .submit(vec![1, 2, 3, 4, 5, 6, 7, 8], 8, "image/jpeg", Some("photo.jpg".into()))
            .await
            .unwrap();

        let meta = wait_for_terminal(&coordinator, &id).await;
        assert_eq!(meta.status, Status::Transformed);
        assert_eq!(meta.source_quality, 80);
        assert_eq!(meta.target_quality, Some(80));
        assert_eq!(meta.target_size, Some(5));
    }

    #[tokio::test]
    async fn png_admission_records_quality_100_and_transforms() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        write_script(bin_dir.path(), "identify", "#!/bin/sh\necho 80\n");
        write_script(bin_dir.path(), "guetzli", "#!/bin/sh\ncp \"$3\" \"$4\"\n");

        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let id = coordinator
            .submit(vec![1, 2, 3], 3, "image/png", None)
            .await
            .unwrap();

        let meta_before_job = coordinator.get_meta(&id).await.unwrap();
        assert_eq!(meta_before_job.source_quality, 100);

        let meta = wait_for_terminal(&coordinator, &id).await;
        assert_eq!(meta.status, Status::Transformed);
    }

    #[tokio::test]
    async fn oversize_submission_is_rejected_without_touching_disk() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let err = coordinator
            .submit(vec![0u8; 10], MAX_SOURCE_SIZE + 1, "image/jpeg", None)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(coordinator.store().list_content_ids().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unsupported_mime_is_rejected() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let err = coordinator
            .submit(vec![0u8; 10], 10, "image/gif", None)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn transform_failure_lands_entry_in_failed() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        write_script(bin_dir.path(), "identify", "#!/bin/sh\necho 80\n");
        write_script(bin_dir.path(), "guetzli", "#!/bin/sh\nexit 1\n");

        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let id = coordinator
            .submit(vec![1, 2, 3], 3, "image/jpeg", None)
            .await
            .unwrap();

        let meta = wait_for_terminal(&coordinator, &id).await;
        assert_eq!(meta.status, Status::Failed);
        assert!(matches!(coordinator.get_target(&id).await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn initial_probe_failure_lands_entry_in_failed_without_fabricating_quality() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        write_script(bin_dir.path(), "identify", "#!/bin/sh\nexit 1\n");
        write_script(bin_dir.path(), "guetzli", "#!/bin/sh\ncp \"$3\" \"$4\"\n");

        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let id = coordinator
            .submit(vec![1, 2, 3], 3, "image/jpeg", None)
            .await
            .unwrap();

        let meta = wait_for_terminal(&coordinator, &id).await;
        assert_eq!(meta.status, Status::Failed);
        assert_eq!(meta.source_quality, 0);
        assert!(matches!(coordinator.get_target(&id).await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn get_target_before_transformed_is_not_found() {
        let storage_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        let store = Store::new(storage_dir.path().to_path_buf());
        let coordinator = JobCoordinator::new(store, test_config(bin_dir.path()));

        let id = coordinator
            .store()
            .admit(b"data", SourceType::Jpg)
            .await
            .unwrap();
        let record = Metadata::new_stored(
            id.clone(),
            chrono::Utc::now().naive_utc(),
            None,
            SourceType::Jpg,
            50,
            4,
        );
        coordinator.store().write_meta(&record).await.unwrap();

        assert!(matches!(coordinator.get_target(&id).await, Err(AppError::NotFound)));
    }
}
