//! Directory-rooted file access for both ends of a transfer.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
}

/// Files directly inside one directory, addressed by plain file name.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> FileStore {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `name` into the root, refusing anything that could leave it.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !plain {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::file_io(name, e)),
        }
    }

    pub async fn size(&self, name: &str) -> Result<u64> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(Error::FileNotFound(name.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::FileNotFound(name.to_string())),
            Err(e) => Err(Error::file_io(name, e)),
        }
    }

    pub async fn open(&self, name: &str, mode: OpenMode) -> Result<FileHandle> {
        let path = self.resolve(name)?;
        let opened = match mode {
            OpenMode::Read => File::open(&path).await,
            OpenMode::Write => {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .await
            }
        };
        let file = opened.map_err(|e| match e.kind() {
            ErrorKind::NotFound if mode == OpenMode::Read => Error::FileNotFound(name.to_string()),
            _ => Error::file_io(name, e),
        })?;
        Ok(FileHandle {
            name: name.to_string(),
            file,
            bytes: 0,
        })
    }

    /// Removes `name`. Returns false when there was nothing to remove.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::file_io(name, e)),
        }
    }

    /// Names of the entries in the root, sorted.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let root = self.root.display().to_string();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::file_io(root.clone(), e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::file_io(root.clone(), e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// An open file owned by one transfer. Dropping it closes the file.
#[derive(Debug)]
pub struct FileHandle {
    name: String,
    file: File,
    bytes: u64,
}

impl FileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes read or written through this handle so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Reads up to `n` bytes; fewer only at end of file, none once it is reached.
    pub async fn read_chunk(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(n);
        let mut filled = 0;
        while filled < n {
            let read = self
                .file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| Error::file_io(&self.name, e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        self.bytes += filled as u64;
        Ok(buf.freeze())
    }

    /// Appends `data` and waits until it has reached the file.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| Error::file_io(&self.name, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| Error::file_io(&self.name, e))?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::file_io(&self.name, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::file_io(&self.name, e))
    }
}
