use anyhow::bail;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Longest-match-first so `.tar.gz` wins over `.gz`.
const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.bz2", ".tar.gz", ".tar.xz", ".tar.zst", ".tar", ".zip", ".rar", ".7z", ".gz", ".bz2",
    ".xz", ".zst", ".iso",
];

/// Name the archive would unpack to, by stripping a known suffix.
/// Errors when the name carries no recognized archive suffix; callers
/// treat that as "cannot derive a comparison name" and skip.
pub fn get_base_name(name: &str) -> anyhow::Result<String> {
    let lower = name.to_ascii_lowercase();
    for suffix in ARCHIVE_SUFFIXES {
        if lower.ends_with(suffix) {
            return Ok(name[..name.len() - suffix.len()].to_string());
        }
    }
    bail!("no archive suffix on {:?}", name)
}

/// Post-job space predicate. The engine pre-allocates payload files, so a
/// plain job only needs the threshold itself to remain free; an archival
/// job (zip/extract) still needs room for a second copy.
pub fn storage_ok(free: u64, size: u64, threshold: u64, archival: bool) -> bool {
    if archival {
        free.saturating_sub(size) >= threshold
    } else {
        free >= threshold
    }
}

/// Best-effort sweep below a finished job's directory: engine control
/// droppings (`*.aria2`), `.unwanted` directories, and directories left
/// empty by deselection all go. The root itself stays.
pub async fn clean_unwanted(root: &Path) {
    if let Err(err) = prune_dir(root.to_path_buf()).await {
        warn!("cleanup under {} failed: {err}", root.display());
    }
}

/// Returns whether `dir` ended up empty.
fn prune_dir(dir: PathBuf) -> BoxFuture<'static, std::io::Result<bool>> {
    async move {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut occupied = false;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if entry.file_name() == ".unwanted" {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                    continue;
                }
                match prune_dir(path.clone()).await {
                    Ok(true) => {
                        let _ = tokio::fs::remove_dir(&path).await;
                    }
                    Ok(false) => occupied = true,
                    Err(_) => occupied = true,
                }
            } else if path.extension().is_some_and(|ext| ext == "aria2") {
                let _ = tokio::fs::remove_file(&path).await;
            } else {
                occupied = true;
            }
        }
        Ok(!occupied)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_known_suffixes() {
        assert_eq!(get_base_name("show.tar.gz").unwrap(), "show");
        assert_eq!(get_base_name("Movie.2024.ZIP").unwrap(), "Movie.2024");
        assert_eq!(get_base_name("disc.iso").unwrap(), "disc");
    }

    #[test]
    fn base_name_rejects_plain_files() {
        assert!(get_base_name("notes.txt").is_err());
        assert!(get_base_name("folder").is_err());
    }

    #[test]
    fn storage_predicate_distinguishes_archival() {
        const GIB: u64 = 1024 * 1024 * 1024;
        // Plain job: the engine already allocated it, free space just has
        // to sit above the threshold.
        assert!(storage_ok(6 * GIB, GIB, 5 * GIB, false));
        assert!(!storage_ok(4 * GIB, GIB, 5 * GIB, false));
        // Archival job needs headroom for the unpacked/zipped copy too.
        assert!(!storage_ok(6 * GIB, 2 * GIB, 5 * GIB, true));
        assert!(storage_ok(8 * GIB, 2 * GIB, 5 * GIB, true));
    }

    #[tokio::test]
    async fn cleanup_removes_droppings_and_empty_dirs() {
        let root = tempfile::tempdir().unwrap();
        let keep = root.path().join("keep.mkv");
        let control = root.path().join("keep.mkv.aria2");
        let empty = root.path().join("season2");
        let unwanted = root.path().join(".unwanted");
        tokio::fs::write(&keep, b"x").await.unwrap();
        tokio::fs::write(&control, b"x").await.unwrap();
        tokio::fs::create_dir(&empty).await.unwrap();
        tokio::fs::create_dir(&unwanted).await.unwrap();
        tokio::fs::write(unwanted.join("sample.bin"), b"x").await.unwrap();

        clean_unwanted(root.path()).await;

        assert!(keep.exists());
        assert!(!control.exists());
        assert!(!empty.exists());
        assert!(!unwanted.exists());
        assert!(root.path().exists());
    }

    #[tokio::test]
    async fn cleanup_keeps_dirs_with_content() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("disc/extras");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("bonus.mkv"), b"x").await.unwrap();

        clean_unwanted(root.path()).await;

        assert!(nested.join("bonus.mkv").exists());
    }
}
