//! Building a batch from a directory of videos.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::coordinator::BatchJob;
use crate::error::ValidationError;

/// Regular files in `dir` matching `pattern`, sorted by path.
pub fn discover_inputs(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, ValidationError> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full).map_err(|e| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                None
            }
        })
        .collect();
    files.sort();
    debug!(dir = %dir.display(), pattern, count = files.len(), "Discovered inputs");
    Ok(files)
}

/// One job per matching input, writing `cleaned_<name>` into `output_dir`.
pub fn jobs_for_directory(
    input_dir: &Path,
    output_dir: &Path,
    pattern: &str,
) -> Result<Vec<BatchJob>, ValidationError> {
    Ok(discover_inputs(input_dir, pattern)?
        .into_iter()
        .map(|input| {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let output = output_dir.join(format!("cleaned_{}", name));
            BatchJob::new(input, output)
        })
        .collect())
}
