//! ZIP bundling of finished job outputs.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::BundleError;
use crate::job::{JobId, JobStatus};
use crate::store::JobStore;

/// Default upper bound on jobs per bundle.
pub const DEFAULT_MAX_BUNDLE_SIZE: usize = 20;

/// Archives the outputs of `ids` into `dest_dir`.
///
/// Every job must exist, be `FINISHED` and still have its output file. The
/// archive is named `watermarks_removed_<n>_videos.zip` and its entries
/// `cleaned_video_<NN>_<file name>`, numbered from 1 in request order.
pub fn create_bundle(
    store: &dyn JobStore,
    ids: &[JobId],
    dest_dir: &Path,
    max: usize,
) -> Result<PathBuf, BundleError> {
    if ids.is_empty() {
        return Err(BundleError::Empty);
    }
    if ids.len() > max {
        return Err(BundleError::TooMany {
            max,
            requested: ids.len(),
        });
    }

    let mut outputs = Vec::with_capacity(ids.len());
    for id in ids {
        let job = store
            .get(id)?
            .ok_or_else(|| BundleError::UnknownJob(id.clone()))?;
        if job.status != JobStatus::Finished {
            return Err(BundleError::NotFinished {
                id: id.clone(),
                status: job.status.to_string(),
            });
        }
        match job.output_path {
            Some(path) if path.is_file() => outputs.push(path),
            _ => return Err(BundleError::MissingOutput(id.clone())),
        }
    }

    std::fs::create_dir_all(dest_dir).map_err(|e| BundleError::Io {
        path: dest_dir.to_path_buf(),
        source: e,
    })?;
    let archive = dest_dir.join(format!("watermarks_removed_{}_videos.zip", outputs.len()));

    if let Err(e) = write_archive(&archive, &outputs) {
        if let Err(cleanup) = std::fs::remove_file(&archive) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(path = %archive.display(), "Failed to remove partial bundle: {}", cleanup);
            }
        }
        return Err(e);
    }

    info!(path = %archive.display(), count = outputs.len(), "Bundle created");
    Ok(archive)
}

fn write_archive(archive: &Path, outputs: &[PathBuf]) -> Result<(), BundleError> {
    let file = File::create(archive).map_err(io_error(archive))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (index, output) in outputs.iter().enumerate() {
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        zip.start_file(format!("cleaned_video_{:02}_{}", index + 1, file_name), options)?;

        let mut reader = BufReader::new(File::open(output).map_err(io_error(output))?);
        io::copy(&mut reader, &mut zip).map_err(io_error(output))?;
    }

    zip.finish()?.flush().map_err(io_error(archive))?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BundleError {
    let path = path.to_path_buf();
    move |source| BundleError::Io { path, source }
}
