use log::{debug, info};
use std::fs;
use std::path::Path;

/// Write `contents` to `path`, creating missing parent directories first.
///
/// The file is written in place, so a concurrent reader can observe a partial file.
pub fn write_output(path: &Path, contents: &str) -> Result<(), String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            debug!("Creating output directory: {}", dir.display());
            fs::create_dir_all(dir).map_err(|e| format!("creating directory {} failed: {}", dir.display(), e))?;
        }
    }
    fs::write(path, contents).map_err(|e| format!("writing {} failed: {}", path.display(), e))?;
    info!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}
