//! Filesystem helpers shared by the image store and sandbox backends.
//!
//! Everything here is blocking; async callers go through `spawn_blocking`.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

/// Recursively copy `src` (file, directory or symlink) to `dst`.
///
/// Symlinks are copied as links, never followed. Directory permissions are
/// preserved except that the owner always keeps rwx, so the copy can be
/// removed again.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        copy_symlink(src, dst)
    } else if file_type.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        set_dir_permissions(dst, &meta)
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst).map(|_| ())
    }
}

/// Replace whatever is at `dst` with a copy of `src`.
///
/// The copy is staged next to `dst` and renamed into place, so a failed copy
/// never leaves `dst` half-written.
pub fn replace_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let parent = dst
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4().simple()));

    if let Err(e) = copy_tree(src, &staging) {
        if let Err(cleanup) = remove_tree(&staging) {
            warn!(path = %staging.display(), error = %cleanup, "Failed to remove partial copy");
        }
        return Err(e);
    }
    remove_tree(dst)?;
    fs::rename(&staging, dst)
}

/// Replace whatever is at `dst` with an empty directory.
pub fn reset_dir(dst: &Path) -> io::Result<()> {
    remove_tree(dst)?;
    fs::create_dir_all(dst)
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Content digest of a tree: `sha256:<hex>` over sorted relative paths,
/// entry kinds, permission bits, file contents and link targets.
pub fn digest_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hash_entry(root, Path::new(""), &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn hash_entry(path: &Path, relative: &Path, hasher: &mut Sha256) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(mode_bits(&meta).to_le_bytes());

    if file_type.is_symlink() {
        hasher.update(b"l");
        hasher.update(fs::read_link(path)?.to_string_lossy().as_bytes());
    } else if file_type.is_dir() {
        hasher.update(b"d");
        let mut names: Vec<_> = fs::read_dir(path)?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<io::Result<_>>()?;
        names.sort();
        for name in names {
            hash_entry(&path.join(&name), &relative.join(&name), hasher)?;
        }
    } else {
        hasher.update(b"f");
        hasher.update(meta.len().to_le_bytes());
        io::copy(&mut File::open(path)?, hasher)?;
    }
    hasher.update([0u8]);
    Ok(())
}

/// Turn an absolute in-sandbox path into one relative to the sandbox root.
pub fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    // No portable way to recreate the link; copy what it points at.
    copy_tree(&fs::canonicalize(src)?, dst)
}

#[cfg(unix)]
fn set_dir_permissions(dst: &Path, meta: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode() | 0o700;
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_dir_permissions(_dst: &Path, _meta: &fs::Metadata) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_copy_tree_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("a/b/c.txt"), "hello");
        write(&src.join("top.txt"), "top");

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("a/b/c.txt")).unwrap(), "hello");
        assert_eq!(fs::read_to_string(dst.join("top.txt")).unwrap(), "top");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_keeps_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("real.txt"), "x");
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(
            fs::read_link(dst.join("link.txt")).unwrap(),
            PathBuf::from("real.txt")
        );
    }

    #[test]
    fn test_replace_tree_drops_stale_content() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("new.txt"), "new");
        let dst = tmp.path().join("dst");
        write(&dst.join("stale.txt"), "old");

        replace_tree(&src, &dst).unwrap();

        assert!(dst.join("new.txt").exists());
        assert!(!dst.join("stale.txt").exists());
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_tree_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        remove_tree(&tmp.path().join("nope")).unwrap();
    }

    #[test]
    fn test_digest_tracks_content() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        write(&a.join("etc/os-release"), "ID=test");
        write(&b.join("etc/os-release"), "ID=test");

        let da = digest_tree(&a).unwrap();
        assert!(da.starts_with("sha256:"));
        assert_eq!(da, digest_tree(&b).unwrap());

        write(&b.join("etc/os-release"), "ID=other");
        assert_ne!(da, digest_tree(&b).unwrap());
    }

    #[test]
    fn test_strip_root() {
        assert_eq!(
            strip_root(Path::new("/tmp/build/ab12/repo")),
            PathBuf::from("tmp/build/ab12/repo")
        );
    }
}
