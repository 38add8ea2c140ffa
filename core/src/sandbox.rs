//! Path sandbox: every filesystem path reachable through REST or the
//! file-stream subprotocol is resolved against a base directory (the
//! session's cwd) and rejected unless containment holds after symlink
//! canonicalization. All failure causes collapse to one `Rejected` signal;
//! distinguishing them would leak filesystem shape.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Canonical-base cache TTL.
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Canonical-base cache capacity; evicted FIFO beyond this.
const CACHE_CAP: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("path rejected")]
    Rejected,
}

type CacheEntry = (PathBuf, PathBuf, Instant);

static BASE_CACHE: Mutex<VecDeque<CacheEntry>> = Mutex::new(VecDeque::new());

/// Canonicalize `base`, consulting the process-wide cache. Only bases are
/// cached; user-supplied paths never enter the cache.
async fn canonical_base(base: &Path) -> Result<PathBuf, SandboxError> {
    let now = Instant::now();
    {
        let cache = BASE_CACHE.lock().expect("base cache mutex");
        if let Some((_, canon, _)) = cache
            .iter()
            .find(|(cached, _, expires)| cached == base && now < *expires)
        {
            return Ok(canon.clone());
        }
    }

    let canon = tokio::fs::canonicalize(base)
        .await
        .map_err(|_| SandboxError::Rejected)?;

    let mut cache = BASE_CACHE.lock().expect("base cache mutex");
    cache.retain(|(cached, _, expires)| cached != base && now < *expires);
    cache.push_back((base.to_path_buf(), canon.clone(), now + CACHE_TTL));
    while cache.len() > CACHE_CAP {
        cache.pop_front();
    }
    Ok(canon)
}

/// Separator-aware containment: `path` equals `base` or has `base` as a
/// whole-component prefix. `Path::starts_with` compares components, so
/// `/home/user` is not inside `/home/u`.
fn contained(path: &Path, base: &Path) -> bool {
    path == base || path.starts_with(base)
}

/// Resolve `requested` against `base`, canonicalize, and verify the result
/// stays inside `base`. The path must exist.
pub async fn validate_existing(requested: &str, base: &Path) -> Result<PathBuf, SandboxError> {
    let base = canonical_base(base).await?;
    let joined = base.join(requested);
    let resolved = tokio::fs::canonicalize(&joined)
        .await
        .map_err(|_| SandboxError::Rejected)?;
    if contained(&resolved, &base) {
        Ok(resolved)
    } else {
        Err(SandboxError::Rejected)
    }
}

/// As [`validate_existing`], additionally rejecting when the final
/// component is itself a symlink. Used by download and file-stream so a
/// link planted in the sandbox cannot aim reads elsewhere.
pub async fn validate_no_symlink(requested: &str, base: &Path) -> Result<PathBuf, SandboxError> {
    let canon_base = canonical_base(base).await?;
    let joined = canon_base.join(requested);
    let meta = tokio::fs::symlink_metadata(&joined)
        .await
        .map_err(|_| SandboxError::Rejected)?;
    if meta.file_type().is_symlink() {
        return Err(SandboxError::Rejected);
    }
    validate_existing(requested, base).await
}

/// Containment for a path that need not exist yet (touch, upload target):
/// only `base` is resolved; `requested` is joined lexically and may not
/// climb with `..` or restart at the root.
pub async fn validate_new(requested: &str, base: &Path) -> Result<PathBuf, SandboxError> {
    let base = canonical_base(base).await?;
    let relative = Path::new(requested);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::Rejected)
            }
        }
    }
    let joined = base.join(relative);
    if contained(&joined, &base) {
        Ok(joined)
    } else {
        Err(SandboxError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sandbox_tree() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("work");
        tokio::fs::create_dir_all(base.join("sub")).await.unwrap();
        tokio::fs::write(base.join("file.txt"), b"data").await.unwrap();
        tokio::fs::write(base.join("sub/inner.txt"), b"inner").await.unwrap();
        tokio::fs::write(dir.path().join("outside.txt"), b"secret").await.unwrap();
        (dir, base)
    }

    #[tokio::test]
    async fn existing_accepts_children_and_base() {
        let (_dir, base) = sandbox_tree().await;
        let resolved = validate_existing("file.txt", &base).await.unwrap();
        assert!(resolved.ends_with("file.txt"));
        let resolved = validate_existing("sub/inner.txt", &base).await.unwrap();
        assert!(resolved.ends_with("inner.txt"));
        // "." resolves to the base itself.
        let resolved = validate_existing(".", &base).await.unwrap();
        assert_eq!(resolved, tokio::fs::canonicalize(&base).await.unwrap());
    }

    #[tokio::test]
    async fn existing_rejects_traversal_and_absolute() {
        let (_dir, base) = sandbox_tree().await;
        assert_eq!(
            validate_existing("../outside.txt", &base).await,
            Err(SandboxError::Rejected)
        );
        assert_eq!(
            validate_existing("/etc", &base).await,
            Err(SandboxError::Rejected)
        );
        assert_eq!(
            validate_existing("missing.txt", &base).await,
            Err(SandboxError::Rejected)
        );
    }

    #[tokio::test]
    async fn containment_is_separator_aware() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("work");
        let sibling = dir.path().join("workspace");
        tokio::fs::create_dir_all(&base).await.unwrap();
        tokio::fs::create_dir_all(&sibling).await.unwrap();
        tokio::fs::write(sibling.join("f.txt"), b"x").await.unwrap();

        // "work" is a string prefix of "workspace" but not a path prefix.
        assert_eq!(
            validate_existing("../workspace/f.txt", &base).await,
            Err(SandboxError::Rejected)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_resolved_and_optionally_rejected() {
        let (dir, base) = sandbox_tree().await;

        // Link escaping the sandbox: rejected in every mode.
        std::os::unix::fs::symlink(dir.path().join("outside.txt"), base.join("escape"))
            .unwrap();
        assert_eq!(
            validate_existing("escape", &base).await,
            Err(SandboxError::Rejected)
        );

        // Link to a file inside the sandbox: fine for listing, rejected by
        // the no-symlink mode.
        std::os::unix::fs::symlink(base.join("file.txt"), base.join("alias")).unwrap();
        assert!(validate_existing("alias", &base).await.is_ok());
        assert_eq!(
            validate_no_symlink("alias", &base).await,
            Err(SandboxError::Rejected)
        );
        assert!(validate_no_symlink("file.txt", &base).await.is_ok());
    }

    #[tokio::test]
    async fn new_paths_join_without_climbing() {
        let (_dir, base) = sandbox_tree().await;
        let target = validate_new("fresh.txt", &base).await.unwrap();
        assert!(target.ends_with("fresh.txt"));
        let target = validate_new("sub/fresh.txt", &base).await.unwrap();
        assert!(target.ends_with("sub/fresh.txt"));

        assert_eq!(
            validate_new("../evil.txt", &base).await,
            Err(SandboxError::Rejected)
        );
        assert_eq!(
            validate_new("/abs.txt", &base).await,
            Err(SandboxError::Rejected)
        );
        assert_eq!(
            validate_new("sub/../../evil.txt", &base).await,
            Err(SandboxError::Rejected)
        );
    }

    #[tokio::test]
    async fn base_cache_round_trips() {
        let (_dir, base) = sandbox_tree().await;
        let first = canonical_base(&base).await.unwrap();
        let second = canonical_base(&base).await.unwrap();
        assert_eq!(first, second);
    }
}
