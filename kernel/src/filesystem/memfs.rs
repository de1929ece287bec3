//! A flat, writable in-memory filesystem. None of the teacher's existing
//! `Filesystem` impls (`Ramdisk`, `Initrd`, `Devfs`) support `write`, but
//! syscalls 4/5/8/9 need a place that does — this is that place. One
//! directory level, same restriction `Initrd` already documents.

use alloc::{
    boxed::Box,
    collections::btree_map::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use spin::Mutex;

use super::vfs::{DirectoryEntry, FileType, Filesystem, FilesystemError, Inode};

struct MemFile {
    name: String,
    contents: Vec<u8>,
}

pub struct MemFs {
    dev: u32,
    next_inode: Mutex<u32>,
    files: Mutex<BTreeMap<u32, MemFile>>,
}

impl MemFs {
    pub fn new(dev: u32) -> Self {
        MemFs {
            dev,
            next_inode: Mutex::new(1),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    fn inode_for(&self, ino: u32, file: &MemFile) -> Arc<Inode> {
        Arc::new(Inode {
            dev: self.dev,
            inode: ino,
            file_type: FileType::File,
            size: file.contents.len(),
            major: None,
            minor: None,
            inner: None,
        })
    }

    fn root_inode(&self) -> Arc<Inode> {
        Arc::new(Inode {
            dev: self.dev,
            inode: 0,
            file_type: FileType::Directory,
            size: 0,
            major: None,
            minor: None,
            inner: None,
        })
    }
}

impl Filesystem for MemFs {
    fn open(&self, _inode: Arc<Inode>) -> Result<(), FilesystemError> {
        Ok(())
    }

    fn close(&self, _inode: Arc<Inode>) -> Result<(), FilesystemError> {
        Ok(())
    }

    fn read(
        &self,
        inode: Arc<Inode>,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<usize, FilesystemError> {
        if inode.dev != self.dev || inode.file_type != FileType::File {
            return Err(FilesystemError::WrongType);
        }
        let files = self.files.lock();
        let file = files.get(&inode.inode).ok_or(FilesystemError::NotFound)?;

        let offset = offset as usize;
        if offset >= file.contents.len() {
            return Ok(0);
        }
        let end = (offset + buffer.len()).min(file.contents.len());
        let n = end - offset;
        buffer[..n].copy_from_slice(&file.contents[offset..end]);
        Ok(n)
    }

    fn write(
        &self,
        inode: Arc<Inode>,
        offset: u64,
        buffer: &[u8],
    ) -> Result<usize, FilesystemError> {
        if inode.dev != self.dev || inode.file_type != FileType::File {
            return Err(FilesystemError::WrongType);
        }
        let mut files = self.files.lock();
        let file = files.get_mut(&inode.inode).ok_or(FilesystemError::NotFound)?;

        let offset = offset as usize;
        let end = offset + buffer.len();
        if file.contents.len() < end {
            file.contents.resize(end, 0);
        }
        file.contents[offset..end].copy_from_slice(buffer);
        Ok(buffer.len())
    }

    fn readdir(&self, inode: Arc<Inode>) -> Result<Vec<DirectoryEntry>, FilesystemError> {
        if inode.dev != self.dev || inode.inode != 0 {
            return Err(FilesystemError::WrongType);
        }
        Ok(self
            .files
            .lock()
            .iter()
            .map(|(ino, file)| DirectoryEntry {
                name: file.name.clone(),
                inode: *ino,
                dev: self.dev,
            })
            .collect())
    }

    fn inode(&self, dev: u32, inode: u32) -> Result<Arc<Inode>, FilesystemError> {
        if dev != self.dev {
            return Err(FilesystemError::WrongType);
        }
        if inode == 0 {
            return Ok(self.root_inode());
        }
        let files = self.files.lock();
        let file = files.get(&inode).ok_or(FilesystemError::NotFound)?;
        Ok(self.inode_for(inode, file))
    }

    fn create(
        &self,
        dir: Arc<Inode>,
        name: &str,
        initial_size: usize,
    ) -> Result<Arc<Inode>, FilesystemError> {
        if dir.dev != self.dev || dir.inode != 0 {
            return Err(FilesystemError::WrongType);
        }
        let mut files = self.files.lock();
        if files.values().any(|f| f.name == name) {
            return Err(FilesystemError::WrongType);
        }

        let mut next_inode = self.next_inode.lock();
        let ino = *next_inode;
        *next_inode += 1;

        let file = MemFile {
            name: name.to_string(),
            contents: vec![0u8; initial_size],
        };
        let result = self.inode_for(ino, &file);
        files.insert(ino, file);
        Ok(result)
    }

    fn remove(&self, dir: Arc<Inode>, name: &str) -> Result<(), FilesystemError> {
        if dir.dev != self.dev || dir.inode != 0 {
            return Err(FilesystemError::WrongType);
        }
        let mut files = self.files.lock();
        let ino = files
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(ino, _)| *ino)
            .ok_or(FilesystemError::NotFound)?;
        files.remove(&ino);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_round_trip() {
        let fs = MemFs::new(9);
        let dir = fs.root_inode();

        let file = fs.create(dir.clone(), "scratch", 0).unwrap();
        fs.write(file.clone(), 0, b"hello world").unwrap();

        let file = fs.inode(9, file.inode).unwrap();
        assert_eq!(file.size, b"hello world".len());

        let mut buf = vec![0u8; file.size];
        let n = fs.read(file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let fs = MemFs::new(1);
        let dir = fs.root_inode();
        fs.create(dir.clone(), "f", 0).unwrap();
        assert!(fs.create(dir, "f", 0).is_err());
    }

    #[test]
    fn remove_then_lookup_fails() {
        let fs = MemFs::new(1);
        let dir = fs.root_inode();
        let file = fs.create(dir.clone(), "f", 4).unwrap();
        fs.remove(dir, "f").unwrap();
        assert!(fs.inode(1, file.inode).is_err());
    }

    #[test]
    fn write_past_end_extends_file() {
        let fs = MemFs::new(1);
        let dir = fs.root_inode();
        let file = fs.create(dir, "f", 4).unwrap();
        fs.write(file.clone(), 4, b"ab").unwrap();

        let file = fs.inode(1, file.inode).unwrap();
        assert_eq!(file.size, 6);
    }
}
