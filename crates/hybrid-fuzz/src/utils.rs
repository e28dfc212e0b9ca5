use std::{fs, path::Path};

use anyhow::Context;

/// Recreate `path` as an empty directory, removing any previous content.
pub fn init_dir(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Clearing directory {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("Creating directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::init_dir;

    #[test]
    fn recreates_directory_empty() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("stale"), b"x").unwrap();

        init_dir(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
    }
}
