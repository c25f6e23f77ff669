use std::fs;
use std::path::PathBuf;

use uuid::Uuid;

/// Abstracts where on disk NCP keeps its state, so tests can point it at a
/// tempdir instead of the real XDG config dir. Mirrors the teacher's
/// `ConfigProvider` in `config.rs`.
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join("ncp")
    }
}

/// Write `content` to `path` via a sibling temp file + rename, so a reader
/// never observes a partially written file. Used by the health-state and
/// capability/embedding caches (spec §5/§6: "single-writer with atomic
/// rename").
pub fn write_atomic(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.{}.tmp", file_stem(path), Uuid::new_v4()));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn file_stem(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ncp".to_string())
}

#[cfg(test)]
pub struct TempConfigProvider {
    pub dir: tempfile::TempDir,
}

#[cfg(test)]
impl TempConfigProvider {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }
}

#[cfg(test)]
impl ConfigProvider for TempConfigProvider {
    fn base_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_leaves_no_tmp_file_behind() {
        let cp = TempConfigProvider::new();
        let path = cp.base_dir().join("sub").join("state.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn write_atomic_overwrites_existing_file() {
        let cp = TempConfigProvider::new();
        let path = cp.base_dir().join("state.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
    }
}
