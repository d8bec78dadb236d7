use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{PageIndex, PAGE_SIZE};
use crate::error::{BrambleError, BrambleResult};

pub type FileId = u64;

#[derive(Debug)]
struct FileEntry {
    name: String,
    file: Mutex<File>,
}

/// Directory-rooted page store. Every registered file is a raw sequence of
/// fixed-size pages addressed by index; file ids are process-local handles
/// assigned at add/open time.
#[derive(Debug)]
pub struct DiskManager {
    root: PathBuf,
    next_file_id: AtomicU64,
    files: RwLock<HashMap<FileId, Arc<FileEntry>>>,
    names: RwLock<HashMap<String, FileId>>,
}

impl DiskManager {
    pub fn try_new(root: impl AsRef<Path>) -> BrambleResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(DiskManager {
            root,
            next_file_id: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
        })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn register(&self, name: &str, file: File) -> FileId {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(FileEntry {
            name: name.to_string(),
            file: Mutex::new(file),
        });
        self.files.write().insert(file_id, entry);
        self.names.write().insert(name.to_string(), file_id);
        file_id
    }

    fn entry(&self, file_id: FileId) -> BrambleResult<Arc<FileEntry>> {
        self.files.read().get(&file_id).cloned().ok_or_else(|| {
            BrambleError::Storage(format!("file id {} is not registered", file_id))
        })
    }

    /// Create a new empty file and register it. Fails if the file already
    /// exists on disk or is already registered.
    pub fn add_file(&self, name: &str) -> BrambleResult<FileId> {
        if self.names.read().contains_key(name) {
            return Err(BrambleError::Storage(format!(
                "file `{}` is already registered",
                name
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.file_path(name))?;
        Ok(self.register(name, file))
    }

    /// Open an existing file. Returns the already assigned id when the file
    /// was registered before.
    pub fn open_file(&self, name: &str) -> BrambleResult<FileId> {
        if let Some(file_id) = self.names.read().get(name) {
            return Ok(*file_id);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(name))?;
        Ok(self.register(name, file))
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.names.read().contains_key(name) || self.file_path(name).exists()
    }

    /// Unregister the file and remove it from disk.
    pub fn delete_file(&self, file_id: FileId) -> BrambleResult<()> {
        let entry = self.entry(file_id)?;
        self.files.write().remove(&file_id);
        self.names.write().remove(&entry.name);
        std::fs::remove_file(self.file_path(&entry.name))?;
        Ok(())
    }

    /// Unregister the file keeping its contents on disk.
    pub fn close_file(&self, file_id: FileId) -> BrambleResult<()> {
        let entry = self.entry(file_id)?;
        entry.file.lock().sync_all()?;
        self.files.write().remove(&file_id);
        self.names.write().remove(&entry.name);
        Ok(())
    }

    pub fn truncate_file(&self, file_id: FileId) -> BrambleResult<()> {
        let entry = self.entry(file_id)?;
        let file = entry.file.lock();
        file.set_len(0)?;
        Ok(())
    }

    /// Number of pages currently stored in the file.
    pub fn page_count(&self, file_id: FileId) -> BrambleResult<u32> {
        let entry = self.entry(file_id)?;
        let len = entry.file.lock().metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as u32)
    }

    /// Append a zeroed page and return its index.
    pub fn allocate_page(&self, file_id: FileId) -> BrambleResult<PageIndex> {
        let entry = self.entry(file_id)?;
        let mut file = entry.file.lock();
        let len = file.metadata()?.len();
        let page_index = (len / PAGE_SIZE as u64) as PageIndex;
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        Ok(page_index)
    }

    pub fn read_page(&self, file_id: FileId, page_index: PageIndex) -> BrambleResult<Vec<u8>> {
        let entry = self.entry(file_id)?;
        let mut file = entry.file.lock();
        let mut buf = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(page_index as u64 * PAGE_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        data: &[u8],
    ) -> BrambleResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let entry = self.entry(file_id)?;
        let mut file = entry.file.lock();
        file.seek(SeekFrom::Start(page_index as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Fsync every registered file.
    pub fn sync(&self) -> BrambleResult<()> {
        let files: Vec<Arc<FileEntry>> = self.files.read().values().cloned().collect();
        for entry in files {
            if let Err(e) = entry.file.lock().sync_all() {
                warn!("sync of `{}` failed: {}", entry.name, e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_open_delete_file() {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(dir.path()).unwrap();

        let id = disk.add_file("t.mvb").unwrap();
        assert!(disk.file_exists("t.mvb"));
        assert_eq!(disk.page_count(id).unwrap(), 0);
        assert!(disk.add_file("t.mvb").is_err());

        disk.close_file(id).unwrap();
        assert!(disk.file_exists("t.mvb"));
        let reopened = disk.open_file("t.mvb").unwrap();
        disk.delete_file(reopened).unwrap();
        assert!(!disk.file_exists("t.mvb"));
    }

    #[test]
    fn page_round_trip() {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(dir.path()).unwrap();
        let id = disk.add_file("pages.mvb").unwrap();

        let p0 = disk.allocate_page(id).unwrap();
        let p1 = disk.allocate_page(id).unwrap();
        assert_eq!((p0, p1), (0, 1));
        assert_eq!(disk.page_count(id).unwrap(), 2);

        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(id, 1, &data).unwrap();

        let read = disk.read_page(id, 1).unwrap();
        assert_eq!(read, data);
        assert!(disk.read_page(id, 0).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn truncate_resets_page_count() {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(dir.path()).unwrap();
        let id = disk.add_file("trunc.mvb").unwrap();
        disk.allocate_page(id).unwrap();
        disk.allocate_page(id).unwrap();

        disk.truncate_file(id).unwrap();
        assert_eq!(disk.page_count(id).unwrap(), 0);
    }
}
