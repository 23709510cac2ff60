use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

const CLEANUP_ATTEMPTS: u32 = 3;

/// Ephemeral staging directory for one job's conversion.
///
/// Laid out as `<root>/<job_id>/input/<name>` and `<root>/<job_id>/output/`.
/// Call [`Workspace::cleanup`] on every exit path; if the value is dropped
/// without it (panic, aborted task) the directory is removed synchronously.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    input_path: PathBuf,
    output_dir: PathBuf,
    released: bool,
}

impl Workspace {
    pub async fn create(root: &Path, job_id: Uuid, input_name: &str) -> std::io::Result<Self> {
        let dir = root.join(job_id.to_string());

        // A leftover from a crashed run must not leak into this one.
        remove_dir_if_present(&dir).await?;

        let input_dir = dir.join("input");
        let output_dir = dir.join("output");
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        Ok(Self {
            input_path: input_dir.join(local_file_name(input_name)),
            output_dir,
            dir,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Remove the workspace directory. Absence counts as success.
    pub async fn cleanup(mut self) -> std::io::Result<()> {
        self.released = true;
        let mut attempt = 1;
        loop {
            match remove_dir_if_present(&self.dir).await {
                Ok(()) => return Ok(()),
                // A killed converter can still be releasing files for a moment.
                Err(e) if attempt < CLEANUP_ATTEMPTS => {
                    tracing::debug!(path = %self.dir.display(), error = %e, attempt, "Retrying workspace cleanup");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.dir.display(), error = %e, "Failed to remove abandoned workspace");
            }
        }
    }
}

async fn remove_dir_if_present(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reduce an uploaded name to a safe single path component.
fn local_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim_start_matches('.')
        .to_string();
    if cleaned.is_empty() {
        "input".to_string()
    } else {
        cleaned
    }
}

/// Remove every workspace directory left under `root` by a previous run.
///
/// Returns how many directories were removed. Entries that fail to delete are
/// logged and skipped.
pub async fn sweep_stale(root: &Path) -> std::io::Result<usize> {
    tokio::fs::create_dir_all(root).await?;
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Removed stale workspace");
                removed += 1;
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale workspace"),
        }
    }
    Ok(removed)
}
