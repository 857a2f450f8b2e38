//! The one uniform helper every persisted JSON file in the core goes
//! through: serialize, write to `<path>.tmp`, fsync, rename over the
//! destination. A crash mid-write leaves either the old file or the new
//! one, never a half-written one.

use crate::{Error, Result};
use serde::Serialize;
use std::path::Path;

/// Write `value` as pretty JSON to `path` atomically. `mode_0600` requests
/// owner-only permissions on the final file (used for the ticket store).
pub async fn atomic_write_json<T>(path: &Path, value: &T, mode_0600: bool) -> Result<()>
where
    T: Serialize + Sync,
{
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = tmp_path_for(path);

    {
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(Error::Io)?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&json).await.map_err(Error::Io)?;
        file.sync_all().await.map_err(Error::Io)?;
    }

    if mode_0600 {
        set_owner_only_permissions(&tmp_path).await?;
    }

    tokio::fs::rename(&tmp_path, path).await.map_err(Error::Io)?;
    Ok(())
}

/// Load and parse a persisted JSON file. Refuses to follow symlinks — the
/// core's persisted state is never expected to be one, and following it
/// would let an attacker redirect a write-rename onto an arbitrary path.
pub async fn load_json<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let metadata = tokio::fs::symlink_metadata(path).await.map_err(Error::Io)?;
    if metadata.file_type().is_symlink() {
        return Err(Error::Integrity(format!(
            "refusing to load {}: path is a symlink",
            path.display()
        )));
    }

    let bytes = tokio::fs::read(path).await.map_err(Error::Io)?;
    serde_json::from_slice(&bytes).map_err(Error::Serialization)
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await.map_err(Error::Io)
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        a: u32,
        b: String,
    }

    #[tokio::test]
    async fn round_trips_through_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let doc = Doc {
            a: 7,
            b: "hello".into(),
        };
        atomic_write_json(&path, &doc, false).await.unwrap();

        let loaded: Doc = load_json(&path).await.unwrap();
        assert_eq!(loaded, doc);
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[tokio::test]
    async fn rejects_symlinked_targets() {
        let dir = tempdir().unwrap();
        let real = dir.path().join("real.json");
        tokio::fs::write(&real, b"{}").await.unwrap();

        let link = dir.path().join("link.json");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, &link).unwrap();

        #[cfg(unix)]
        {
            let result: Result<serde_json::Value> = load_json(&link).await;
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn second_write_leaves_no_tmp_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        atomic_write_json(&path, &Doc { a: 1, b: "x".into() }, false).await.unwrap();
        atomic_write_json(&path, &Doc { a: 2, b: "y".into() }, false).await.unwrap();

        let loaded: Doc = load_json(&path).await.unwrap();
        assert_eq!(loaded.a, 2);
        assert!(!dir.path().join("doc.json.tmp").exists());
    }
}
