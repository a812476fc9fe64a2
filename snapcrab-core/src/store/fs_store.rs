use super::*;
use std::path::Path;

/// File-system recovery store.
///
/// Layout: one `chk-{id}.bin` file per checkpoint holding the
/// bincode-encoded metadata. Files are written to a hidden temp file, synced
/// and renamed into place, so a crash mid-write leaves no visible record.
pub struct FsRecoveryStore {
    base_path: PathBuf,
}

impl FsRecoveryStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "failed to create checkpoint store directory {}",
                base_path.display()
            )
        })?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn metadata_path(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path.join(format!("chk-{checkpoint_id}.bin"))
    }

    fn temp_path(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path.join(format!(".chk-{checkpoint_id}.bin.tmp"))
    }

    fn read_metadata(&self, checkpoint_id: CheckpointId) -> Result<CompletedCheckpointMetadata> {
        let path = self.metadata_path(checkpoint_id);
        let bytes = fs::read(&path)
            .with_context(|| format!("read checkpoint metadata {} failed", path.display()))?;
        CompletedCheckpointMetadata::from_bytes(&bytes)
            .with_context(|| format!("decode checkpoint metadata {} failed", path.display()))
    }
}

impl CheckpointRecoveryStore for FsRecoveryStore {
    fn persist(&self, metadata: &CompletedCheckpointMetadata) -> Result<()> {
        let bytes = metadata
            .to_bytes()
            .context("serialize checkpoint metadata failed")?;
        let temp = self.temp_path(metadata.checkpoint_id);
        let write = || -> Result<()> {
            fs::write(&temp, &bytes).context("write checkpoint metadata failed")?;
            fs::OpenOptions::new()
                .write(true)
                .open(&temp)
                .and_then(|f| f.sync_all())
                .context("sync checkpoint metadata failed")?;
            let published = self.metadata_path(metadata.checkpoint_id);
            fs::rename(&temp, &published).context("publish checkpoint metadata failed")?;
            if let Err(err) = sync_dir(&self.base_path) {
                let _ = fs::remove_file(&published);
                return Err(err).context("sync checkpoint directory failed");
            }
            Ok(())
        };
        let result = write();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }

    fn recover_latest(&self) -> Result<Option<CompletedCheckpointMetadata>> {
        for checkpoint_id in self.list_checkpoints()?.into_iter().rev() {
            match self.read_metadata(checkpoint_id) {
                Ok(metadata) => return Ok(Some(metadata)),
                Err(err) => {
                    tracing::warn!(
                        "skipping unreadable checkpoint {} during recovery: {:#}",
                        checkpoint_id,
                        err
                    );
                }
            }
        }
        Ok(None)
    }

    fn load(&self, checkpoint_id: CheckpointId) -> Result<Option<CompletedCheckpointMetadata>> {
        if !self.metadata_path(checkpoint_id).exists() {
            return Ok(None);
        }
        self.read_metadata(checkpoint_id).map(Some)
    }

    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let path = self.metadata_path(checkpoint_id);
        match fs::remove_file(&path) {
            Ok(()) => sync_dir(&self.base_path)
                .with_context(|| format!("sync {} failed", self.base_path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)
            .with_context(|| format!("read_dir failed for {}", self.base_path.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_part) = name
                .strip_prefix("chk-")
                .and_then(|rest| rest.strip_suffix(".bin"))
                && let Ok(id) = id_part.parse::<CheckpointId>()
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Flushes directory entries so a rename or removal survives a crash.
pub(super) fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
