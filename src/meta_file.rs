//! The metadata backend: named, flat, byte-addressed files that the
//! context manager and the diagnostic archive persist into.
//!
//! Two backends are provided. `DiskMetaStorage` keeps one file per
//! name inside a locked directory. `MemMetaStorage` keeps the bytes in
//! memory and can be cloned to simulate a restart against the same
//! "device", or told to fail every I/O for error-path testing.

use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fault_injection::{annotate, fallible, maybe};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use tempdir::TempDir;

const WARN: &str = "DO_NOT_PUT_YOUR_FILES_HERE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaIoOpcode {
    Read,
    Write,
}

/// A single named metadata stream. All I/O is synchronous: a
/// successful write has reached stable storage when it returns.
pub trait MetaFile: Send + fmt::Debug {
    fn name(&self) -> &str;

    fn does_file_exist(&self) -> bool;

    /// Creates (or truncates) the file with `size` zeroed bytes.
    fn create(&mut self, size: u64) -> io::Result<()>;

    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn is_opened(&self) -> bool;

    fn size(&self) -> io::Result<u64>;

    #[doc(hidden)]
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    #[doc(hidden)]
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// I/O that must stay inside the created size of the file.
    fn issue_io(
        &mut self,
        opcode: MetaIoOpcode,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let size = self.size()?;
        if offset + buf.len() as u64 > size {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "io of {} bytes at offset {} is past the end of {} ({} bytes)",
                    buf.len(),
                    offset,
                    self.name(),
                    size
                ),
            )));
        }
        self.append_io(opcode, offset, buf)
    }

    /// I/O that may grow the file when writing past its end.
    fn append_io(
        &mut self,
        opcode: MetaIoOpcode,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        if !self.is_opened() {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("metadata file {} is not open", self.name()),
            )));
        }
        match opcode {
            MetaIoOpcode::Read => self.read_exact_at(offset, buf),
            MetaIoOpcode::Write => self.write_all_at(offset, buf),
        }
    }
}

/// Scoped acquisition of named metadata files.
pub trait MetaStorage: Send + Sync + fmt::Debug {
    fn file(&self, name: &str) -> Box<dyn MetaFile>;
}

/// Metadata files stored in a directory on a real filesystem.
#[derive(Debug)]
pub struct DiskMetaStorage {
    directory: PathBuf,
    // held for the exclusive lock
    _directory_lock: fs::File,
    // removes the directory on drop when temporary
    _temp: Option<TempDir>,
}

impl DiskMetaStorage {
    pub fn open<P: AsRef<Path>>(directory: P) -> io::Result<DiskMetaStorage> {
        use fs2::FileExt;

        let path = directory.as_ref();

        if let Err(e) = fs::read_dir(path) {
            if e.kind() == io::ErrorKind::NotFound {
                fallible!(fs::create_dir_all(path));
            }
        }

        let _ = fs::File::create(path.join(WARN));

        let directory_lock = fallible!(fs::File::open(path));
        fallible!(directory_lock.try_lock_exclusive());

        log::debug!("opened allocator metadata directory {:?}", path);

        Ok(DiskMetaStorage {
            directory: path.into(),
            _directory_lock: directory_lock,
            _temp: None,
        })
    }

    pub fn temporary() -> io::Result<DiskMetaStorage> {
        let temp = fallible!(TempDir::new("stripealloc"));
        let mut storage = DiskMetaStorage::open(temp.path())?;
        storage._temp = Some(temp);
        Ok(storage)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl MetaStorage for DiskMetaStorage {
    fn file(&self, name: &str) -> Box<dyn MetaFile> {
        Box::new(DiskMetaFile {
            name: name.to_owned(),
            path: self.directory.join(name),
            file: None,
        })
    }
}

#[derive(Debug)]
struct DiskMetaFile {
    name: String,
    path: PathBuf,
    file: Option<fs::File>,
}

impl DiskMetaFile {
    fn opened(&mut self) -> io::Result<&mut fs::File> {
        self.file.as_mut().ok_or_else(|| {
            annotate!(io::Error::new(
                io::ErrorKind::NotConnected,
                "metadata file is not open"
            ))
        })
    }
}

impl MetaFile for DiskMetaFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn does_file_exist(&self) -> bool {
        self.path.exists()
    }

    fn create(&mut self, size: u64) -> io::Result<()> {
        let file = fallible!(fs::File::create(&self.path));
        fallible!(file.set_len(size));
        fallible!(file.sync_all());
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true);
        self.file = Some(fallible!(options.open(&self.path)));
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            fallible!(file.sync_all());
        }
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.file.is_some()
    }

    fn size(&self) -> io::Result<u64> {
        let metadata = fallible!(fs::metadata(&self.path));
        Ok(metadata.len())
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.opened()?;
        fallible!(file.seek(SeekFrom::Start(offset)));
        maybe!(file.read_exact(buf))
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let file = self.opened()?;
        fallible!(file.seek(SeekFrom::Start(offset)));
        fallible!(file.write_all(buf));
        maybe!(file.sync_all())
    }
}

type SharedBytes = Arc<Mutex<Vec<u8>>>;

/// Metadata files kept in memory. Clones share the same files, so a
/// clone handed to a second allocator instance observes everything the
/// first one persisted.
#[derive(Debug, Default, Clone)]
pub struct MemMetaStorage {
    files: Arc<Mutex<FnvHashMap<String, SharedBytes>>>,
    fail_io: Arc<AtomicBool>,
}

impl MemMetaStorage {
    /// While set, every read and write fails with an injected error.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::Release);
    }

    /// A copy of the current contents of `name`, if it exists.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|bytes| bytes.lock().clone())
    }
}

impl MetaStorage for MemMetaStorage {
    fn file(&self, name: &str) -> Box<dyn MetaFile> {
        Box::new(MemMetaFile {
            name: name.to_owned(),
            storage: self.clone(),
            bytes: None,
        })
    }
}

#[derive(Debug)]
struct MemMetaFile {
    name: String,
    storage: MemMetaStorage,
    bytes: Option<SharedBytes>,
}

impl MemMetaFile {
    fn check_injected_failure(&self) -> io::Result<()> {
        if self.storage.fail_io.load(Ordering::Acquire) {
            Err(annotate!(io::Error::new(
                io::ErrorKind::Other,
                format!("injected io failure on {}", self.name),
            )))
        } else {
            Ok(())
        }
    }

    fn opened(&self) -> io::Result<&SharedBytes> {
        self.bytes.as_ref().ok_or_else(|| {
            annotate!(io::Error::new(
                io::ErrorKind::NotConnected,
                "metadata file is not open"
            ))
        })
    }
}

impl MetaFile for MemMetaFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn does_file_exist(&self) -> bool {
        self.storage.files.lock().contains_key(&self.name)
    }

    fn create(&mut self, size: u64) -> io::Result<()> {
        self.check_injected_failure()?;
        let bytes = vec![0; usize::try_from(size).map_err(io::Error::other)?];
        self.storage
            .files
            .lock()
            .insert(self.name.clone(), Arc::new(Mutex::new(bytes)));
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        let files = self.storage.files.lock();
        let bytes = files.get(&self.name).cloned().ok_or_else(|| {
            annotate!(io::Error::new(
                io::ErrorKind::NotFound,
                format!("metadata file {} does not exist", self.name),
            ))
        })?;
        self.bytes = Some(bytes);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.bytes = None;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.bytes.is_some()
    }

    fn size(&self) -> io::Result<u64> {
        match &self.bytes {
            Some(bytes) => Ok(bytes.lock().len() as u64),
            None => self
                .storage
                .files
                .lock()
                .get(&self.name)
                .map(|bytes| bytes.lock().len() as u64)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, self.name.clone())
                }),
        }
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_injected_failure()?;
        let bytes = self.opened()?.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer"
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check_injected_failure()?;
        let mut bytes = self.opened()?.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}
