//! Bounded, directory-backed file caches
//!
//! Two independent caches exist in the daemon: the inbound cache, whose files
//! remote peers read out over SDO, and the outbound cache, which accepts
//! files written in by remote peers. Each is a flat directory of files plus
//! an in-memory listing in insertion order, so the order reported over the
//! dictionary does not depend on how the OS enumerates directories.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use std::sync::Mutex;

/// The longest accepted cache file name, in bytes
pub const MAX_NAME_LEN: usize = 247;

/// Errors returned by cache operations
#[derive(Debug, Snafu)]
pub enum CacheError {
    /// The cache already holds its configured maximum number of entries
    #[snafu(display("Cache is full ({capacity} entries)"))]
    Full {
        /// The configured capacity
        capacity: usize,
    },
    /// An entry with this name is already cached
    #[snafu(display("File '{name}' already cached"))]
    Exists {
        /// The offending name
        name: String,
    },
    /// No entry with this name exists
    #[snafu(display("File '{name}' not found in cache"))]
    NotFound {
        /// The requested name
        name: String,
    },
    /// The name is empty, too long, or contains path separators
    #[snafu(display("Invalid cache file name '{name}'"))]
    InvalidName {
        /// The offending name
        name: String,
    },
    /// A filesystem operation failed
    #[snafu(display("Cache I/O failed"))]
    Io {
        /// Underlying error
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, CacheError>;

/// One cached file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// File name, unique within the cache
    pub name: String,
    /// File size in bytes
    pub size: u64,
}

struct Inner {
    root: PathBuf,
    capacity: usize,
    entries: Vec<CacheEntry>,
}

/// A bounded store of named files backed by one directory
///
/// Every mutating operation leaves the directory and the in-memory listing
/// consistent before returning. All operations take the cache lock, so a
/// remove and the following listing read cannot interleave with another
/// accessor's view.
pub struct FileCache {
    inner: Mutex<Inner>,
}

impl FileCache {
    /// Open a cache rooted at `root`, creating the directory if needed
    ///
    /// Files already present are indexed in lexical name order, since their
    /// original insertion order is not recorded on disk.
    pub fn new<P: Into<PathBuf>>(root: P, capacity: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).context(IoSnafu)?;

        let mut entries = Vec::new();
        for dirent in fs::read_dir(&root).context(IoSnafu)? {
            let dirent = dirent.context(IoSnafu)?;
            let meta = dirent.metadata().context(IoSnafu)?;
            if !meta.is_file() {
                continue;
            }
            let name = match dirent.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if validate_name(&name).is_err() {
                // Leftover temp files and other strays are not entries
                continue;
            }
            entries.push(CacheEntry {
                name,
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if entries.len() > capacity {
            log::warn!(
                "cache at {} holds {} files, over its capacity of {}; only the first {} are indexed",
                root.display(),
                entries.len(),
                capacity,
                capacity,
            );
            entries.truncate(capacity);
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                root,
                capacity,
                entries,
            }),
        })
    }

    /// The number of cached files
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns true when the cache holds no files
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured maximum number of entries
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// The root directory backing this cache
    pub fn root(&self) -> PathBuf {
        self.inner.lock().unwrap().root.clone()
    }

    /// List cached file names in insertion order
    pub fn list(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    /// List cached entries in insertion order
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Returns true if a file with this name is cached
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .any(|e| e.name == name)
    }

    /// Get the size of a cached file
    pub fn size_of(&self, name: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.size)
            .ok_or_else(|| NotFoundSnafu { name }.build())
    }

    /// Add a file to the cache, consuming a byte source
    ///
    /// Fails without mutating anything when the cache is at capacity, the
    /// name is already present, or the name is invalid. The content is
    /// staged to a temporary file and renamed into place, so a failed copy
    /// leaves no entry behind.
    pub fn add<R: Read>(&self, name: &str, reader: &mut R) -> Result<()> {
        validate_name(name)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.iter().any(|e| e.name == name) {
            return ExistsSnafu { name }.fail();
        }
        if inner.entries.len() >= inner.capacity {
            return FullSnafu {
                capacity: inner.capacity,
            }
            .fail();
        }

        // Entry names cannot start with '.', so the staging name cannot
        // collide with one
        let tmp_path = inner.root.join(format!(".staging-{name}"));
        let final_path = inner.root.join(name);
        let result = (|| {
            let mut file = fs::File::create(&tmp_path).context(IoSnafu)?;
            let size = io::copy(reader, &mut file).context(IoSnafu)?;
            fs::rename(&tmp_path, &final_path).context(IoSnafu)?;
            Ok(size)
        })();

        match result {
            Ok(size) => {
                inner.entries.push(CacheEntry {
                    name: name.to_string(),
                    size,
                });
                log::debug!("cached '{name}' ({size} bytes)");
                Ok(())
            }
            Err(e) => {
                fs::remove_file(&tmp_path).ok();
                Err(e)
            }
        }
    }

    /// Remove a file from the cache
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| NotFoundSnafu { name }.build())?;
        let path = inner.root.join(name);
        fs::remove_file(path).context(IoSnafu)?;
        inner.entries.remove(pos);
        log::debug!("removed '{name}' from cache");
        Ok(())
    }

    /// Open a cached file for reading
    pub fn open(&self, name: &str) -> Result<fs::File> {
        let path = self.path_of(name)?;
        fs::File::open(path).context(IoSnafu)
    }

    /// Get the on-disk path of a cached file
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        let inner = self.inner.lock().unwrap();
        if !inner.entries.iter().any(|e| e.name == name) {
            return NotFoundSnafu { name }.fail();
        }
        Ok(inner.root.join(name))
    }

    /// Compare a cached file against another file by whole-file checksum
    pub fn verify_matches<P: AsRef<Path>>(&self, name: &str, other: P) -> Result<bool> {
        let cached = self.path_of(name)?;
        Ok(file_crc32(&cached)? == file_crc32(other.as_ref())?)
    }
}

/// Compute the CRC-32 of a file's entire content
pub fn file_crc32(path: &Path) -> Result<u32> {
    let data = fs::read(path).context(IoSnafu)?;
    Ok(crc32fast::hash(&data))
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && !name.contains(['/', '\\']);
    if ok {
        Ok(())
    } else {
        InvalidNameSnafu { name }.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_cache(capacity: usize) -> (tempfile::TempDir, FileCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path(), capacity).unwrap();
        (dir, cache)
    }

    fn add_bytes(cache: &FileCache, name: &str, data: &[u8]) -> Result<()> {
        cache.add(name, &mut Cursor::new(data.to_vec()))
    }

    #[test]
    fn test_capacity_and_ordering() {
        let (_dir, cache) = make_cache(4);
        for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
            add_bytes(&cache, name, b"data").unwrap();
        }
        assert_eq!(vec!["a.bin", "b.bin", "c.bin", "d.bin"], cache.list());

        // Fifth add fails with a capacity error and mutates nothing
        assert!(matches!(
            add_bytes(&cache, "e.bin", b"data"),
            Err(CacheError::Full { capacity: 4 })
        ));
        assert_eq!(4, cache.len());

        cache.remove("b.bin").unwrap();
        assert_eq!(vec!["a.bin", "c.bin", "d.bin"], cache.list());
    }

    #[test]
    fn test_duplicate_add() {
        let (_dir, cache) = make_cache(4);
        add_bytes(&cache, "a.bin", b"one").unwrap();
        assert!(matches!(
            add_bytes(&cache, "a.bin", b"two"),
            Err(CacheError::Exists { .. })
        ));
        // Original content is untouched
        let mut content = String::new();
        cache.open("a.bin").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!("one", content);
    }

    #[test]
    fn test_remove_missing() {
        let (_dir, cache) = make_cache(4);
        add_bytes(&cache, "a.bin", b"data").unwrap();
        assert!(matches!(
            cache.remove("nope.bin"),
            Err(CacheError::NotFound { .. })
        ));
        assert_eq!(1, cache.len());
    }

    #[test]
    fn test_name_validation() {
        let (_dir, cache) = make_cache(4);
        for bad in ["", "a/b", "a\\b", ".hidden"] {
            assert!(matches!(
                add_bytes(&cache, bad, b"data"),
                Err(CacheError::InvalidName { .. })
            ));
        }
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(add_bytes(&cache, &long, b"data").is_err());
    }

    #[test]
    fn test_reindex_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = FileCache::new(dir.path(), 8).unwrap();
            add_bytes(&cache, "zeta", b"z").unwrap();
            add_bytes(&cache, "alpha", b"aa").unwrap();
        }
        // A new cache over the same directory indexes by name
        let cache = FileCache::new(dir.path(), 8).unwrap();
        assert_eq!(vec!["alpha", "zeta"], cache.list());
        assert_eq!(2, cache.size_of("alpha").unwrap());
    }

    #[test]
    fn test_listing_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let cache = FileCache::new(dir.path(), 2).unwrap();
        assert_eq!(2, cache.len());
        assert_eq!(vec!["a", "b"], cache.list());
    }

    #[test]
    fn test_verify_matches() {
        let (_dir, cache) = make_cache(4);
        add_bytes(&cache, "a.bin", b"match me").unwrap();

        let other = tempfile::NamedTempFile::new().unwrap();
        fs::write(other.path(), b"match me").unwrap();
        assert!(cache.verify_matches("a.bin", other.path()).unwrap());

        fs::write(other.path(), b"do not match").unwrap();
        assert!(!cache.verify_matches("a.bin", other.path()).unwrap());

        // Empty files compare equal too
        add_bytes(&cache, "empty", b"").unwrap();
        fs::write(other.path(), b"").unwrap();
        assert!(cache.verify_matches("empty", other.path()).unwrap());
    }
}
