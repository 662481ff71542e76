//! Path confinement for the file server
//!
//! Protocol paths are resolved against a jail root. A leading `/` means the
//! jail root, not the host filesystem root. Resolution fails closed: any
//! `..` component, prefix, NUL byte, or symlink that leads outside the root
//! is rejected instead of being clamped back inside.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Path resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path escapes jail root: {0}")]
    Escape(String),

    #[error("invalid path: {0}")]
    Invalid(String),

    #[error("jail root unavailable: {0}")]
    RootUnavailable(String),
}

/// A directory outside which no protocol path may resolve
#[derive(Clone, Debug)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    /// Create a jail rooted at an existing directory
    ///
    /// The root is canonicalized so containment checks compare real paths.
    pub fn new(root: &Path) -> Result<Self, PathError> {
        let root = root
            .canonicalize()
            .map_err(|e| PathError::RootUnavailable(format!("{}: {}", root.display(), e)))?;
        if !root.is_dir() {
            return Err(PathError::RootUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a protocol path to a host path without touching the filesystem
    pub fn resolve(&self, protocol_path: &str) -> Result<PathBuf, PathError> {
        if protocol_path.contains('\0') {
            return Err(PathError::Invalid("path contains null byte".into()));
        }

        if protocol_path.len() > MAX_PATH_LEN {
            return Err(PathError::Invalid(format!(
                "path too long: {} bytes (max {})",
                protocol_path.len(),
                MAX_PATH_LEN
            )));
        }

        let mut result = self.root.clone();

        for component in Path::new(protocol_path).components() {
            match component {
                Component::Normal(name) => {
                    let name_str = name.to_string_lossy();
                    if name_str.len() > MAX_FILENAME_LEN {
                        return Err(PathError::Invalid(format!(
                            "filename too long: {} bytes (max {})",
                            name_str.len(),
                            MAX_FILENAME_LEN
                        )));
                    }
                    result.push(name);
                }
                Component::ParentDir => {
                    return Err(PathError::Escape(format!(
                        "parent directory (..) in {}",
                        protocol_path
                    )));
                }
                // The protocol root is the jail root.
                Component::RootDir | Component::CurDir => {}
                Component::Prefix(_) => {
                    return Err(PathError::Escape(format!(
                        "path prefix in {}",
                        protocol_path
                    )));
                }
            }
        }

        if !result.starts_with(&self.root) {
            return Err(PathError::Escape(protocol_path.to_string()));
        }

        Ok(result)
    }

    /// Resolve a path that must already exist, following symlinks
    ///
    /// The canonical target has to stay inside the root.
    pub fn resolve_existing(&self, protocol_path: &str) -> Result<PathBuf, PathError> {
        let path = self.resolve(protocol_path)?;
        let real = path
            .canonicalize()
            .map_err(|e| PathError::Invalid(format!("{}: {}", protocol_path, e)))?;
        if !real.starts_with(&self.root) {
            return Err(PathError::Escape(format!(
                "symlink escapes jail root: {}",
                protocol_path
            )));
        }
        Ok(real)
    }

    /// Resolve a path that may not exist yet (create, rename target)
    ///
    /// The nearest existing ancestor is canonicalized and must stay inside
    /// the root, so a symlinked parent cannot redirect a new file outside.
    pub fn resolve_new(&self, protocol_path: &str) -> Result<PathBuf, PathError> {
        let path = self.resolve(protocol_path)?;
        if path == self.root {
            return Err(PathError::Invalid("path names the jail root".into()));
        }

        let mut ancestor = path.as_path();
        loop {
            if ancestor.exists() {
                break;
            }
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }

        let real = ancestor
            .canonicalize()
            .map_err(|e| PathError::Invalid(format!("{}: {}", protocol_path, e)))?;
        if !real.starts_with(&self.root) {
            return Err(PathError::Escape(format!(
                "ancestor escapes jail root: {}",
                protocol_path
            )));
        }
        Ok(path)
    }
}

/// Last component of a protocol path
pub fn file_name(protocol_path: &str) -> Option<&str> {
    protocol_path
        .rsplit('/')
        .find(|part| !part.is_empty() && *part != "." && *part != "..")
}

/// Join a protocol directory and a file name
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_normal() {
        let temp = tempdir().unwrap();
        let jail = Jail::new(temp.path()).unwrap();
        let root = jail.root().to_path_buf();

        assert_eq!(jail.resolve("file.txt").unwrap(), root.join("file.txt"));
        assert_eq!(jail.resolve("/dir/file.txt").unwrap(), root.join("dir/file.txt"));
        assert_eq!(jail.resolve("./a/./b").unwrap(), root.join("a/b"));
        assert_eq!(jail.resolve("/").unwrap(), root);
        assert_eq!(jail.resolve(".").unwrap(), root);
        assert_eq!(jail.resolve("").unwrap(), root);
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let temp = tempdir().unwrap();
        let jail = Jail::new(temp.path()).unwrap();

        assert!(matches!(jail.resolve(".."), Err(PathError::Escape(_))));
        assert!(matches!(
            jail.resolve("/../etc/passwd"),
            Err(PathError::Escape(_))
        ));
        // Stays inside after normalisation, still rejected.
        assert!(matches!(jail.resolve("a/../b"), Err(PathError::Escape(_))));
    }

    #[test]
    fn test_resolve_rejects_null_and_length() {
        let temp = tempdir().unwrap();
        let jail = Jail::new(temp.path()).unwrap();

        assert!(matches!(jail.resolve("a\0b"), Err(PathError::Invalid(_))));
        let long = "a/".repeat(MAX_PATH_LEN);
        assert!(matches!(jail.resolve(&long), Err(PathError::Invalid(_))));
    }

    #[test]
    fn test_new_requires_directory() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(Jail::new(&file), Err(PathError::RootUnavailable(_))));
        assert!(matches!(
            Jail::new(&temp.path().join("missing")),
            Err(PathError::RootUnavailable(_))
        ));
    }

    #[test]
    fn test_resolve_existing() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("in.txt"), b"x").unwrap();
        let jail = Jail::new(temp.path()).unwrap();

        assert!(jail.resolve_existing("/in.txt").is_ok());
        assert!(matches!(
            jail.resolve_existing("/missing.txt"),
            Err(PathError::Invalid(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_escape_rejected() {
        use std::os::unix::fs::symlink;

        let outer = tempdir().unwrap();
        let root = outer.path().join("root");
        let secret = outer.path().join("secret");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&secret).unwrap();
        fs::write(secret.join("key"), b"k").unwrap();
        symlink(&secret, root.join("link")).unwrap();

        let jail = Jail::new(&root).unwrap();
        assert!(matches!(
            jail.resolve_existing("link/key"),
            Err(PathError::Escape(_))
        ));
        assert!(matches!(
            jail.resolve_new("link/new.bin"),
            Err(PathError::Escape(_))
        ));
    }

    #[test]
    fn test_resolve_new() {
        let temp = tempdir().unwrap();
        let jail = Jail::new(temp.path()).unwrap();

        let path = jail.resolve_new("deep/nested/file.bin").unwrap();
        assert!(path.starts_with(jail.root()));
        assert!(matches!(jail.resolve_new("/"), Err(PathError::Invalid(_))));
    }

    #[test]
    fn test_file_name_and_join() {
        assert_eq!(file_name("/a/b/c.txt"), Some("c.txt"));
        assert_eq!(file_name("c.txt"), Some("c.txt"));
        assert_eq!(file_name("/a/b/"), Some("b"));
        assert_eq!(file_name("/"), None);

        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join(".", "x"), "./x");
        assert_eq!(join("logs", "x"), "logs/x");
        assert_eq!(join("", "x"), "x");
    }
}
