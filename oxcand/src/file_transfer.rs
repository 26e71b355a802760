//! Dictionary file transfer records
//!
//! Mirrors a [`FileCache`] into a dictionary object so a remote peer can
//! enumerate, fetch, store, and remove cached files purely through dictionary
//! access over SDO. Two instances are registered: the inbound record at
//! 0x3004, whose data sub is read by remote peers, and the outbound record at
//! 0x3005, whose data sub accepts remote writes.
//!
//! | Sub | Field | Access |
//! |-----|-------|--------|
//! | 0 | highest supported subindex | ro |
//! | 1 | entry count | ro |
//! | 2 | listing (JSON array of names) | ro |
//! | 3 | selected file name | rw |
//! | 4 | data of the selection | ro (inbound) / wo (outbound) |
//! | 5 | remove the selection | wo |

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use oxcan_common::constants::{file_transfer_subs as subs, object_ids};
use oxcan_common::objects::SubInfo;
use oxcan_common::sdo::AbortCode;

use crate::cache::{self, CacheError, FileCache, MAX_NAME_LEN};
use crate::dict::{read_from_slice, Dictionary, ObjectAccess};

/// Which way file content moves through the record's data sub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirection {
    /// Remote peers read cached files out (the "fread" record)
    Inbound,
    /// Remote peers write new files in (the "fwrite" record)
    Outbound,
}

/// Map a cache failure onto the dictionary layer's abort vocabulary
fn map_cache_err(e: CacheError) -> AbortCode {
    match e {
        CacheError::Full { .. } => AbortCode::OutOfMemory,
        CacheError::Exists { .. } => AbortCode::CantStore,
        CacheError::NotFound { .. } => AbortCode::NoData,
        CacheError::InvalidName { .. } => AbortCode::InvalidValue,
        CacheError::Io { .. } => AbortCode::HardwareError,
    }
}

/// Render the cache listing as a JSON array of names
fn listing_json(names: &[String]) -> String {
    let mut out = String::from("[");
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        for c in name.chars() {
            match c {
                '"' | '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        out.push('"');
    }
    out.push(']');
    out
}

struct Staging {
    file: fs::File,
    path: PathBuf,
    name: String,
}

/// The dictionary view of one file cache
pub struct CacheObject {
    cache: Arc<FileCache>,
    direction: CacheDirection,
    selected: Mutex<Option<String>>,
    staging: Mutex<Option<Staging>>,
}

impl CacheObject {
    /// Create a view over a cache
    pub fn new(cache: Arc<FileCache>, direction: CacheDirection) -> Self {
        Self {
            cache,
            direction,
            selected: Mutex::new(None),
            staging: Mutex::new(None),
        }
    }

    /// The currently selected file name
    pub fn selected(&self) -> Option<String> {
        self.selected.lock().unwrap().clone()
    }

    fn selected_or_abort(&self) -> Result<String, AbortCode> {
        self.selected.lock().unwrap().clone().ok_or(AbortCode::NoData)
    }

    /// Record the name subsequent data/remove operations act on
    ///
    /// For the inbound record the name must refer to an existing entry. For
    /// the outbound record it names the entry a following data write will
    /// create, so it only has to be a valid name.
    fn select(&self, name: &str) -> Result<(), AbortCode> {
        cache::validate_name(name).map_err(map_cache_err)?;
        if self.direction == CacheDirection::Inbound && !self.cache.contains(name) {
            return Err(AbortCode::NoData);
        }
        *self.selected.lock().unwrap() = Some(name.to_string());
        Ok(())
    }

    fn remove_selected(&self) -> Result<(), AbortCode> {
        let name = self.selected_or_abort()?;
        self.cache.remove(&name).map_err(map_cache_err)?;
        // The count and listing subs read through to the cache, so they are
        // already consistent; only the dangling selection needs clearing.
        *self.selected.lock().unwrap() = None;
        Ok(())
    }

    fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let name = self.selected_or_abort()?;
        let mut file = self.cache.open(&name).map_err(map_cache_err)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| AbortCode::HardwareError)?;
        let mut total = 0;
        // A short read mid-file only happens at EOF for regular files, but
        // loop to be exact about it
        while total < buf.len() {
            let n = file
                .read(&mut buf[total..])
                .map_err(|_| AbortCode::HardwareError)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn begin_staging(&self) -> Result<(), AbortCode> {
        let name = self.selected_or_abort()?;
        if self.cache.contains(&name) {
            return Err(AbortCode::CantStore);
        }
        if self.cache.len() >= self.cache.capacity() {
            return Err(AbortCode::OutOfMemory);
        }
        let path = self.cache.root().join(".upload");
        let file = fs::File::create(&path).map_err(|_| AbortCode::HardwareError)?;
        *self.staging.lock().unwrap() = Some(Staging { file, path, name });
        Ok(())
    }

    fn write_staging(&self, data: &[u8]) -> Result<(), AbortCode> {
        let mut guard = self.staging.lock().unwrap();
        let staging = guard.as_mut().ok_or(AbortCode::GeneralError)?;
        staging
            .file
            .write_all(data)
            .map_err(|_| AbortCode::HardwareError)
    }

    fn commit_staging(&self) -> Result<(), AbortCode> {
        let staging = self
            .staging
            .lock()
            .unwrap()
            .take()
            .ok_or(AbortCode::GeneralError)?;
        drop(staging.file);
        let result = (|| {
            let mut file = fs::File::open(&staging.path).map_err(|_| AbortCode::HardwareError)?;
            self.cache
                .add(&staging.name, &mut file)
                .map_err(map_cache_err)
        })();
        fs::remove_file(&staging.path).ok();
        result
    }
}

impl ObjectAccess for CacheObject {
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        let data_access = match self.direction {
            CacheDirection::Inbound => SubInfo::new_domain().ro_access(),
            CacheDirection::Outbound => SubInfo::new_domain().wo_access(),
        };
        match sub {
            subs::HIGHEST_SUB => Ok(SubInfo::MAX_SUB_NUMBER),
            subs::COUNT => Ok(SubInfo::new_u8()),
            subs::LISTING => Ok(SubInfo::new_visible_str(0)),
            subs::NAME => Ok(SubInfo::new_visible_str(MAX_NAME_LEN).rw_access()),
            subs::DATA => Ok(data_access),
            subs::REMOVE => Ok(SubInfo::new_bool().wo_access()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        match sub {
            subs::HIGHEST_SUB | subs::COUNT => Ok(1),
            subs::LISTING => Ok(listing_json(&self.cache.list()).len()),
            subs::NAME => Ok(self.selected().map(|n| n.len()).unwrap_or(0)),
            subs::DATA => {
                let name = self.selected_or_abort()?;
                let size = self.cache.size_of(&name).map_err(map_cache_err)?;
                Ok(size as usize)
            }
            subs::REMOVE => Ok(1),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read(&self, sub: u8, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match sub {
            subs::HIGHEST_SUB => read_from_slice(&[subs::REMOVE], offset, buf),
            subs::COUNT => read_from_slice(&[self.cache.len() as u8], offset, buf),
            subs::LISTING => {
                let listing = listing_json(&self.cache.list());
                read_from_slice(listing.as_bytes(), offset, buf)
            }
            subs::NAME => {
                let name = self.selected().unwrap_or_default();
                read_from_slice(name.as_bytes(), offset, buf)
            }
            subs::DATA => self.read_data(offset, buf),
            subs::REMOVE => Err(AbortCode::WriteOnly),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        match sub {
            subs::NAME => {
                // Trailing null terminators are not part of the name
                let len = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                let name = core::str::from_utf8(&data[0..len])
                    .map_err(|_| AbortCode::InvalidValue)?;
                self.select(name)
            }
            subs::DATA => {
                self.begin_partial(sub, Some(data.len() as u64))?;
                self.write_partial(sub, data)?;
                self.end_partial(sub)
            }
            subs::REMOVE => {
                if data.len() != 1 {
                    return Err(AbortCode::DataTypeMismatchLengthHigh);
                }
                if data[0] != 0 {
                    self.remove_selected()?;
                }
                Ok(())
            }
            subs::HIGHEST_SUB | subs::COUNT | subs::LISTING => Err(AbortCode::ReadOnly),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn begin_partial(&self, sub: u8, _declared_size: Option<u64>) -> Result<(), AbortCode> {
        if sub != subs::DATA || self.direction != CacheDirection::Outbound {
            return Err(AbortCode::UnsupportedAccess);
        }
        self.begin_staging()
    }

    fn write_partial(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if sub != subs::DATA {
            return Err(AbortCode::UnsupportedAccess);
        }
        self.write_staging(data)
    }

    fn end_partial(&self, sub: u8) -> Result<(), AbortCode> {
        if sub != subs::DATA {
            return Err(AbortCode::UnsupportedAccess);
        }
        self.commit_staging()
    }

    fn abort_partial(&self, _sub: u8) {
        if let Some(staging) = self.staging.lock().unwrap().take() {
            drop(staging.file);
            fs::remove_file(&staging.path).ok();
        }
    }
}

/// Register both file transfer records into a dictionary
///
/// Returns the two views for direct use by the daemon.
pub fn register_file_transfer(
    dict: &mut Dictionary,
    fread_cache: Arc<FileCache>,
    fwrite_cache: Arc<FileCache>,
) -> (Arc<CacheObject>, Arc<CacheObject>) {
    let fread = Arc::new(CacheObject::new(fread_cache, CacheDirection::Inbound));
    let fwrite = Arc::new(CacheObject::new(fwrite_cache, CacheDirection::Outbound));
    dict.insert(object_ids::FREAD_CACHE, fread.clone());
    dict.insert(object_ids::FWRITE_CACHE, fwrite.clone());
    (fread, fwrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn inbound_fixture() -> (tempfile::TempDir, Arc<FileCache>, CacheObject) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path(), 4).unwrap());
        let obj = CacheObject::new(cache.clone(), CacheDirection::Inbound);
        (dir, cache, obj)
    }

    fn outbound_fixture() -> (tempfile::TempDir, Arc<FileCache>, CacheObject) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path(), 4).unwrap());
        let obj = CacheObject::new(cache.clone(), CacheDirection::Outbound);
        (dir, cache, obj)
    }

    fn read_all(obj: &CacheObject, sub: u8) -> Vec<u8> {
        let size = obj.current_size(sub).unwrap();
        let mut buf = vec![0u8; size];
        let n = obj.read(sub, 0, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_count_and_listing_mirror_cache() {
        let (_dir, cache, obj) = inbound_fixture();
        assert_eq!(vec![0], read_all(&obj, subs::COUNT));
        assert_eq!(b"[]".to_vec(), read_all(&obj, subs::LISTING));

        cache.add("a.bin", &mut Cursor::new(b"aaa".to_vec())).unwrap();
        cache.add("b.bin", &mut Cursor::new(b"bb".to_vec())).unwrap();
        assert_eq!(vec![2], read_all(&obj, subs::COUNT));
        assert_eq!(b"[\"a.bin\",\"b.bin\"]".to_vec(), read_all(&obj, subs::LISTING));
    }

    #[test]
    fn test_select_and_read_data() {
        let (_dir, cache, obj) = inbound_fixture();
        cache
            .add("file.txt", &mut Cursor::new(b"hello world".to_vec()))
            .unwrap();

        // Selecting an absent file aborts
        assert_eq!(Err(AbortCode::NoData), obj.write(subs::NAME, b"missing"));

        obj.write(subs::NAME, b"file.txt").unwrap();
        assert_eq!(11, obj.current_size(subs::DATA).unwrap());
        assert_eq!(b"hello world".to_vec(), read_all(&obj, subs::DATA));

        // Offset reads see the tail
        let mut buf = [0u8; 16];
        let n = obj.read(subs::DATA, 6, &mut buf).unwrap();
        assert_eq!(b"world", &buf[0..n]);
    }

    #[test]
    fn test_remove_resyncs() {
        let (_dir, cache, obj) = inbound_fixture();
        cache.add("a", &mut Cursor::new(b"1".to_vec())).unwrap();
        cache.add("b", &mut Cursor::new(b"2".to_vec())).unwrap();

        obj.write(subs::NAME, b"a").unwrap();
        obj.write(subs::REMOVE, &[1]).unwrap();
        assert_eq!(vec![1], read_all(&obj, subs::COUNT));
        assert_eq!(b"[\"b\"]".to_vec(), read_all(&obj, subs::LISTING));
        assert!(obj.selected().is_none());

        // Removing again with no selection aborts
        assert_eq!(Err(AbortCode::NoData), obj.write(subs::REMOVE, &[1]));

        // Writing false does nothing
        obj.write(subs::NAME, b"b").unwrap();
        obj.write(subs::REMOVE, &[0]).unwrap();
        assert_eq!(vec![1], read_all(&obj, subs::COUNT));
    }

    #[test]
    fn test_streamed_upload_commits_to_cache() {
        let (_dir, cache, obj) = outbound_fixture();
        obj.write(subs::NAME, b"upload.bin").unwrap();

        obj.begin_partial(subs::DATA, Some(10)).unwrap();
        obj.write_partial(subs::DATA, b"01234").unwrap();
        obj.write_partial(subs::DATA, b"56789").unwrap();
        obj.end_partial(subs::DATA).unwrap();

        assert_eq!(vec!["upload.bin".to_string()], cache.list());
        assert_eq!(10, cache.size_of("upload.bin").unwrap());

        // A second upload under the same name is rejected at the start
        assert_eq!(
            Err(AbortCode::CantStore),
            obj.begin_partial(subs::DATA, None)
        );
    }

    #[test]
    fn test_upload_requires_selection() {
        let (_dir, _cache, obj) = outbound_fixture();
        assert_eq!(Err(AbortCode::NoData), obj.begin_partial(subs::DATA, None));
    }

    #[test]
    fn test_upload_at_capacity_rejected() {
        let (_dir, cache, obj) = outbound_fixture();
        for name in ["a", "b", "c", "d"] {
            cache.add(name, &mut Cursor::new(b"x".to_vec())).unwrap();
        }
        obj.write(subs::NAME, b"e").unwrap();
        assert_eq!(
            Err(AbortCode::OutOfMemory),
            obj.begin_partial(subs::DATA, None)
        );
    }

    #[test]
    fn test_access_attributes() {
        let (_dir, _cache, obj) = inbound_fixture();
        assert!(!obj
            .sub_info(subs::HIGHEST_SUB)
            .unwrap()
            .access_type
            .is_writable());
        assert!(!obj.sub_info(subs::COUNT).unwrap().access_type.is_writable());
        assert!(!obj.sub_info(subs::DATA).unwrap().access_type.is_writable());
        assert!(!obj.sub_info(subs::REMOVE).unwrap().access_type.is_readable());

        let (_dir, _cache, obj) = outbound_fixture();
        assert!(!obj.sub_info(subs::DATA).unwrap().access_type.is_readable());
        assert!(obj.sub_info(subs::NAME).unwrap().access_type.is_writable());
    }

    #[test]
    fn test_listing_escapes_quotes() {
        let names = vec!["a\"b".to_string(), "c\\d".to_string()];
        assert_eq!(r#"["a\"b","c\\d"]"#, listing_json(&names));
    }
}
