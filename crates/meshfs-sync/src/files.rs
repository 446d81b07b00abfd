//! Local content access under the node's root directory.
//!
//! Replicated paths are absolute (`/a/b`); on disk they live below the
//! content root. Staged downloads are written at explicit offsets and only
//! renamed into place once complete.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// On-disk location of a replicated path.
pub fn local_path(root: &Path, path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Read up to `max` bytes at `offset`, returning the bytes and the file size.
///
/// An offset at or past the end yields no bytes.
pub async fn read_chunk(file: &Path, offset: u64, max: usize) -> std::io::Result<(Vec<u8>, u64)> {
    let mut handle = tokio::fs::File::open(file).await?;
    let total = handle.metadata().await?.len();
    if offset >= total {
        return Ok((Vec::new(), total));
    }

    let want = (total - offset).min(max as u64) as usize;
    let mut buf = vec![0u8; want];
    handle.seek(SeekFrom::Start(offset)).await?;
    let mut filled = 0;
    while filled < want {
        let n = handle.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok((buf, total))
}

/// Write `data` at `offset` into a staging file, creating it if needed.
pub async fn write_at(file: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = file.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut handle = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(offset == 0)
        .open(file)
        .await?;
    handle.seek(SeekFrom::Start(offset)).await?;
    handle.write_all(data).await?;
    handle.flush().await
}

/// Move a completed staging file to its final location.
pub async fn promote(staged: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::rename(staged, dest).await
}

/// Remove a file or empty directory; a missing path is not an error.
pub async fn remove(file: &Path) -> std::io::Result<()> {
    let result = match tokio::fs::symlink_metadata(file).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(file).await,
        Ok(_) => tokio::fs::remove_file(file).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Size of a local file, or 0 if it cannot be read.
pub async fn size_of(file: &Path) -> u64 {
    tokio::fs::metadata(file)
        .await
        .map(|m| if m.is_file() { m.len() } else { 0 })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_path() {
        let root = Path::new("/srv/data");
        assert_eq!(local_path(root, "/"), PathBuf::from("/srv/data"));
        assert_eq!(local_path(root, "/a/b.txt"), PathBuf::from("/srv/data/a/b.txt"));
    }

    #[tokio::test]
    async fn test_staged_write_and_read() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("stage/x.part");
        write_at(&staged, 0, b"hello ").await.unwrap();
        write_at(&staged, 6, b"world").await.unwrap();

        let (data, total) = read_chunk(&staged, 0, 1024).await.unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(total, 11);

        let (tail, _) = read_chunk(&staged, 6, 3).await.unwrap();
        assert_eq!(tail, b"wor");
        let (past, _) = read_chunk(&staged, 11, 3).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn test_restart_truncates() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("f.part");
        write_at(&staged, 0, b"long old content").await.unwrap();
        write_at(&staged, 0, b"new").await.unwrap();
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_promote_and_remove() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("f.part");
        write_at(&staged, 0, b"data").await.unwrap();

        let dest = local_path(dir.path(), "/deep/nested/f");
        promote(&staged, &dest).await.unwrap();
        assert!(!staged.exists());
        assert_eq!(size_of(&dest).await, 4);

        remove(&dest).await.unwrap();
        remove(&dest).await.unwrap();
        assert!(!dest.exists());
    }
}
