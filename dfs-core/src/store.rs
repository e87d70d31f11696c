//! Content store: namespaced keys mapped to files under a root directory.
//!
//! Layout is `<root>/<namespace>/<path_name>/<file_name>`, where the path comes
//! from a pluggable transform. The content-addressed transform hashes the key
//! with SHA-256 and splits the hex digest into 5 character directories.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

/// Directory segment width used by [`cas_path_transform`].
pub const CAS_BLOCK_SIZE: usize = 5;

/// Where a key lives relative to its namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }
}

pub type PathTransformFunc = fn(&str) -> PathKey;

/// SHA-256 of the key, hex encoded, split into `CAS_BLOCK_SIZE` directories.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = Sha256::digest(key.as_bytes());
    let hash = hex::encode(digest);
    let segments: Vec<&str> = hash
        .as_bytes()
        .chunks(CAS_BLOCK_SIZE)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();
    PathKey {
        path_name: segments.join("/"),
        file_name: hash,
    }
}

/// Key used verbatim as both directory and file name.
pub fn plain_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct StoreOpts {
    /// Root directory containing one directory per namespace.
    pub root: PathBuf,
    pub path_transform: PathTransformFunc,
}

pub const DEFAULT_ROOT: &str = "dfs-storage";

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: plain_path_transform,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    opts: StoreOpts,
}

impl Store {
    pub fn new(mut opts: StoreOpts) -> Self {
        if opts.root.as_os_str().is_empty() {
            opts.root = PathBuf::from(DEFAULT_ROOT);
        }
        Self { opts }
    }

    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    /// Resolve a key to its file. The namespace must be one plain directory name
    /// and the transformed path may only descend, so nothing lands outside
    /// `<root>/<namespace>`.
    fn file_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        let invalid = || StoreError::InvalidKey {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        if !is_plain_segment(namespace) {
            return Err(invalid());
        }
        let pk = (self.opts.path_transform)(key);
        let rel = pk.full_path();
        if !rel.split('/').all(is_plain_segment) {
            return Err(invalid());
        }
        Ok(self.opts.root.join(namespace).join(rel))
    }

    /// Whether `namespace`/`key` map to a path inside this store.
    pub fn check(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.file_path(namespace, key).map(|_| ())
    }

    pub async fn has(&self, namespace: &str, key: &str) -> bool {
        match self.file_path(namespace, key) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Open a stored file. Returns its size and a reader positioned at the start.
    pub async fn read(&self, namespace: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.file_path(namespace, key)?;
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Write everything `reader` yields, replacing any previous content. Returns bytes written.
    pub async fn write<R>(&self, namespace: &str, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.file_path(namespace, key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = File::create(&path).await?;
        let n = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        debug!(path = %path.display(), bytes = n, "wrote file to disk");
        Ok(n)
    }

    /// Remove a key's file, then prune directories it leaves empty.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path = self.file_path(namespace, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        let ns_dir = self.opts.root.join(namespace);
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == ns_dir || fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        debug!(path = %path.display(), "deleted file from disk");
        Ok(())
    }

    /// Remove the whole root, every namespace included.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.opts.root).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Exactly one normal path component: no separators, `.`, `..`, roots or prefixes.
fn is_plain_segment(s: &str) -> bool {
    let mut parts = Path::new(s).components();
    matches!(
        (parts.next(), parts.next()),
        (Some(Component::Normal(c)), None) if c == s
    )
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key {key} not found in namespace {namespace}")]
    NotFound { namespace: String, key: String },
    #[error("key {key:?} in namespace {namespace:?} escapes the store")]
    InvalidKey { namespace: String, key: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn cas_store(root: &Path) -> Store {
        Store::new(StoreOpts {
            root: root.to_path_buf(),
            path_transform: cas_path_transform,
        })
    }

    #[test]
    fn cas_transform_layout() {
        let pk = cas_path_transform("momsbestpicture");
        assert_eq!(pk.file_name.len(), 64);
        let segments: Vec<_> = pk.path_name.split('/').collect();
        assert_eq!(segments.len(), 13);
        assert!(segments[..12].iter().all(|s| s.len() == CAS_BLOCK_SIZE));
        assert_eq!(segments[12].len(), 4);
        assert_eq!(segments.concat(), pk.file_name);
        assert_eq!(cas_path_transform("momsbestpicture"), pk);
        assert_ne!(cas_path_transform("other"), pk);
    }

    #[test]
    fn plain_transform() {
        let pk = plain_path_transform("notes");
        assert_eq!(pk.full_path(), "notes/notes");
    }

    #[tokio::test]
    async fn write_read_has_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = cas_store(dir.path());
        let data = b"some jpg bytes".to_vec();

        assert!(!store.has("ns", "pic").await);
        let n = store.write("ns", "pic", &mut data.as_slice()).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert!(store.has("ns", "pic").await);

        let (size, mut file) = store.read("ns", "pic").await.unwrap();
        assert_eq!(size, data.len() as u64);
        let mut got = Vec::new();
        file.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, data);

        store.delete("ns", "pic").await.unwrap();
        assert!(!store.has("ns", "pic").await);
        // Empty hash directories are pruned, the namespace directory stays.
        let ns_dir = dir.path().join("ns");
        assert!(ns_dir.exists());
        assert_eq!(std::fs::read_dir(&ns_dir).unwrap().count(), 0);
        assert!(matches!(
            store.delete("ns", "pic").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = cas_store(dir.path());
        store.write("a", "k", &mut &b"from a"[..]).await.unwrap();
        assert!(store.has("a", "k").await);
        assert!(!store.has("b", "k").await);
        assert!(matches!(
            store.read("b", "k").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn overwrite_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = cas_store(dir.path());
        store.write("ns", "k", &mut &b"long content"[..]).await.unwrap();
        let n = store.write("ns", "k", &mut &b""[..]).await.unwrap();
        assert_eq!(n, 0);
        let (size, _) = store.read("ns", "k").await.unwrap();
        assert_eq!(size, 0);
    }

    #[test]
    fn plain_segments() {
        assert!(is_plain_segment("1234"));
        assert!(is_plain_segment("photo.jpg"));
        for bad in ["", ".", "..", "a/b", "/etc", "a/", "../x", "./a"] {
            assert!(!is_plain_segment(bad), "{bad:?} accepted");
        }
    }

    #[tokio::test]
    async fn hostile_names_stay_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let store = Store::new(StoreOpts {
            root: root.clone(),
            path_transform: plain_path_transform,
        });
        let cases = [
            ("../..", "escaped"),
            ("..", "escaped"),
            ("/", "escaped"),
            ("", "escaped"),
            ("ns", "../../escaped"),
            ("ns", "/tmp/escaped"),
            ("ns", "a//b"),
            ("ns", ".."),
            ("ns", ""),
        ];
        for (ns, key) in cases {
            assert!(
                matches!(
                    store.write(ns, key, &mut &b"x"[..]).await,
                    Err(StoreError::InvalidKey { .. })
                ),
                "write {ns:?}/{key:?} accepted"
            );
            assert!(!store.has(ns, key).await);
            assert!(matches!(
                store.read(ns, key).await,
                Err(StoreError::InvalidKey { .. })
            ));
            assert!(store.check(ns, key).is_err());
        }
        assert!(!dir.path().join("escaped").exists());
        assert!(!root.exists());

        // Nested keys are fine as long as they only descend.
        store.write("ns", "a/b", &mut &b"ok"[..]).await.unwrap();
        assert!(store.has("ns", "a/b").await);
        // The hash transform never produces separators from the key.
        let cas = cas_store(&root);
        cas.write("ns", "../../escaped", &mut &b"ok"[..]).await.unwrap();
        assert!(cas.has("ns", "../../escaped").await);
    }

    #[tokio::test]
    async fn clear_removes_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let store = cas_store(&root);
        store.write("ns", "k", &mut &b"x"[..]).await.unwrap();
        store.clear().await.unwrap();
        assert!(!root.exists());
        // Clearing an absent root is not an error.
        store.clear().await.unwrap();
    }
}
