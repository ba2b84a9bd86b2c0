use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};

use uuid::Uuid;

use crate::error::MonitorResult;

/// Writes `bytes` to `path` through a sibling temp file and a rename, so readers
/// see either the previous content or the complete new content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> MonitorResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map_or_else(|| "artifact".to_string(), |name| name.to_string_lossy().into_owned());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}
