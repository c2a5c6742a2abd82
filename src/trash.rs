//! Soft-delete destination. Items are moved, never copied, so a trash
//! round-trip leaves image bytes untouched.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::errors::{Result, ShotError};
use crate::storage::move_no_clobber_blocking;

pub trait TrashBin: Send + Sync {
    /// Moves `path` into the trash and returns where it ended up.
    fn trash(&self, path: &Path) -> Result<PathBuf>;

    /// Moves a trashed file back to `original`. Fails on collision.
    fn restore(&self, trashed: &Path, original: &Path) -> Result<()>;

    /// Permanently removes a trashed file.
    fn purge(&self, trashed: &Path) -> Result<()>;
}

/// Trash kept as a plain directory inside the library's state folder.
pub struct DirectoryTrash {
    dir: PathBuf,
}

impl DirectoryTrash {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

}

impl TrashBin for DirectoryTrash {
    /// Lands as `20240105T101500123-name.png`, with a counter added while
    /// that name is taken.
    fn trash(&self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| ShotError::InvalidInput(format!("no file name: {}", path.display())))?
            .to_string_lossy();
        std::fs::create_dir_all(&self.dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let mut candidate = self.dir.join(format!("{stamp}-{name}"));
        let mut n = 1;
        loop {
            match move_no_clobber_blocking(path, &candidate) {
                Ok(()) => return Ok(candidate),
                Err(ShotError::Collision(_)) => {
                    candidate = self.dir.join(format!("{stamp}-{n}-{name}"));
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn restore(&self, trashed: &Path, original: &Path) -> Result<()> {
        if let Some(parent) = original.parent() {
            std::fs::create_dir_all(parent)?;
        }
        move_no_clobber_blocking(trashed, original)
    }

    fn purge(&self, trashed: &Path) -> Result<()> {
        match std::fs::remove_file(trashed) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShotError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trash_and_restore() {
        let dir = TempDir::new().unwrap();
        let trash = DirectoryTrash::new(dir.path().join(".trash"));
        let file = dir.path().join("shot.png");
        std::fs::write(&file, b"pixels").unwrap();

        let trashed = trash.trash(&file).unwrap();
        assert!(!file.exists());
        assert!(trashed.starts_with(trash.dir()));
        assert!(trashed.to_string_lossy().ends_with("-shot.png"));

        trash.restore(&trashed, &file).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"pixels");
    }

    #[test]
    fn test_same_name_twice_does_not_clobber() {
        let dir = TempDir::new().unwrap();
        let trash = DirectoryTrash::new(dir.path().join(".trash"));
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"1").unwrap();
        let first = trash.trash(&file).unwrap();
        std::fs::write(&file, b"2").unwrap();
        let second = trash.trash(&file).unwrap();
        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"1");
        assert_eq!(std::fs::read(&second).unwrap(), b"2");
    }

    #[test]
    fn test_restore_refuses_collision() {
        let dir = TempDir::new().unwrap();
        let trash = DirectoryTrash::new(dir.path().join(".trash"));
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"old").unwrap();
        let trashed = trash.trash(&file).unwrap();
        std::fs::write(&file, b"new").unwrap();
        assert!(matches!(trash.restore(&trashed, &file), Err(ShotError::Collision(_))));
        assert!(trashed.exists());
        assert_eq!(std::fs::read(&file).unwrap(), b"new");
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let trash = DirectoryTrash::new(dir.path().join(".trash"));
        assert!(matches!(
            trash.trash(&dir.path().join("gone.png")),
            Err(ShotError::NotFound(_))
        ));
        trash.purge(&dir.path().join("gone.png")).unwrap();
    }

    #[test]
    fn test_purge_removes_trashed_file() {
        let dir = TempDir::new().unwrap();
        let trash = DirectoryTrash::new(dir.path().join(".trash"));
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"1").unwrap();
        let trashed = trash.trash(&file).unwrap();
        trash.purge(&trashed).unwrap();
        assert!(!trashed.exists());
        assert_eq!(std::fs::read_dir(trash.dir()).unwrap().count(), 0);
    }
}
