//! Where Scrag stores its own data (config and indices).

use std::path::PathBuf;

/// Returns the directory where Scrag stores config and indices.
/// On Linux: `~/.local/share/scrag/`; on macOS: `~/Library/Application Support/Scrag/`.
/// `SCRAG_DATA_DIR` overrides it. Creates the directory if it doesn't exist; returns
/// `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = match std::env::var_os("SCRAG_DATA_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => directories::ProjectDirs::from("app", "Scrag", "Scrag")?
            .data_local_dir()
            .to_path_buf(),
    };
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
