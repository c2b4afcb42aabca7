//! Atomic-replace JSON file persistence shared by the registry, status
//! manager, result store, and workflow cache (spec §6.3).

use std::path::Path;

use serde::Serialize;

/// Serializes `value` and writes it to `path` by first writing a sibling
/// temp file and renaming it over the target, so a crash mid-write never
/// leaves a truncated record.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let contents = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
