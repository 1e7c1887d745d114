use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Best-effort debug copies of the payloads exchanged with the broker.
/// Nothing here is allowed to affect the pipeline.
#[derive(Debug, Clone)]
pub struct Dumper {
    dir: Option<PathBuf>,
}

impl Dumper {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub async fn prepare(&self) {
        if let Some(dir) = &self.dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                debug!("dump dir {} unavailable: {e}", dir.display());
            }
        }
    }

    pub async fn write(&self, name: &str, data: &[u8]) {
        let Some(dir) = &self.dir else {
            return;
        };
        if name.is_empty() || data.is_empty() {
            return;
        }
        // Names come from task ids; anything but a bare file name stays out.
        if Path::new(name).file_name() != Some(OsStr::new(name)) {
            debug!("dump {name:?} skipped: not a plain file name");
            return;
        }
        let path = dir.join(name);
        if let Err(e) = tokio::fs::write(&path, data).await {
            debug!("dump {} skipped: {e}", path.display());
        }
    }
}
