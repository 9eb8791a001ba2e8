pub mod paths;
pub mod settings;

pub use settings::{HostKeyPolicy, SessionSettings};

use std::io::Write;
use std::path::Path;

/// Replace `path` with `content` without ever exposing a half-written file.
///
/// The content is written to a sibling temp file, flushed, then renamed over
/// the target, so readers see either the old or the new file.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "orcterm".to_string());
    let tmp_name = format!(".{}.tmp-{}", file_name, std::process::id());
    let tmp_path = match parent {
        Some(parent) => parent.join(tmp_name),
        None => std::path::PathBuf::from(tmp_name),
    };

    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}
