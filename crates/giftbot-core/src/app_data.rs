//! Where Giftbot stores its own data (config, index).
//!
//! The product catalog CSV stays wherever the operator keeps it. We only store
//! app state here.

use std::path::PathBuf;

const INDEX_DIRNAME: &str = "index";

/// Returns the directory where Giftbot stores config, index, and other app data.
/// On Linux: `~/.local/share/giftbot/`.
/// Creates the directory if it doesn't exist; returns `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = directories::ProjectDirs::from("app", "Giftbot", "Giftbot")?
        .data_local_dir()
        .to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Default location of the persisted vector index, inside the app data directory.
pub fn default_index_dir() -> Option<PathBuf> {
    app_data_dir().map(|d| d.join(INDEX_DIRNAME))
}
