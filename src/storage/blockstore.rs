//! Paged block storage
//!
//! The column store persists committed series tails as opaque blocks
//! addressed by `LogicAddr`. The `BlockStore` trait is the seam; the
//! production implementation is `VolumeStore`, a set of fixed-size paged
//! volume files created at database-creation time. Tests and the
//! in-memory construction mode use `MemoryBlockStore`.
//!
//! Volume layout:
//! ```text
//! page 0:   header: magic "SVOL", version u16, page_size u32
//! page 1..: blocks: len u32 | crc u32 | data (len bytes, crc of data)
//! ```
//!
//! A page with a zero length prefix is free; allocation is append-only
//! and blocks are never reclaimed (volume recycling is outside this
//! engine's scope).

use crate::storage::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Address of a block: volume index in the high 32 bits, page index in
/// the low 32.
pub type LogicAddr = u64;

const VOLUME_MAGIC: [u8; 4] = *b"SVOL";
const VOLUME_VERSION: u16 = 1;

/// Per-block overhead inside a page: length prefix + checksum.
const BLOCK_OVERHEAD: usize = 8;

pub fn make_addr(volume: u32, page: u32) -> LogicAddr {
    ((volume as u64) << 32) | page as u64
}

pub fn split_addr(addr: LogicAddr) -> (u32, u32) {
    ((addr >> 32) as u32, addr as u32)
}

/// Block persistence seam used by the column store.
pub trait BlockStore: Send + Sync {
    fn append_block(&self, data: &[u8]) -> StorageResult<LogicAddr>;
    fn read_block(&self, addr: LogicAddr) -> StorageResult<Vec<u8>>;
    fn flush(&self) -> StorageResult<()>;
}

struct Volume {
    file: Mutex<File>,
    path: PathBuf,
}

struct AllocState {
    volume: usize,
    next_page: u32,
}

/// File-backed block store over a declared volume set.
pub struct VolumeStore {
    volumes: Vec<Volume>,
    page_size: u64,
    pages_per_volume: u32,
    alloc: Mutex<AllocState>,
}

impl VolumeStore {
    /// Create the volume files for a new database.
    ///
    /// With `allocate` set the files are extended to full size up front;
    /// otherwise they grow sparsely.
    pub fn create(
        paths: &[PathBuf],
        page_size: u64,
        pages_per_volume: u32,
        allocate: bool,
    ) -> StorageResult<()> {
        if page_size < 64 {
            return Err(StorageError::BadInput(format!(
                "page size too small: {}",
                page_size
            )));
        }
        for path in paths {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::PermissionDenied => {
                        StorageError::Access(path.display().to_string())
                    }
                    _ => StorageError::Io(e),
                })?;
            let mut header = vec![0u8; page_size as usize];
            header[0..4].copy_from_slice(&VOLUME_MAGIC);
            header[4..6].copy_from_slice(&VOLUME_VERSION.to_le_bytes());
            header[6..10].copy_from_slice(&(page_size as u32).to_le_bytes());
            file.write_all(&header)?;
            if allocate {
                file.set_len(page_size * (1 + pages_per_volume as u64))?;
            }
            file.sync_all()?;
        }
        Ok(())
    }

    /// Open an existing volume set and find the allocation frontier.
    pub fn open(paths: &[PathBuf], page_size: u64, pages_per_volume: u32) -> StorageResult<Self> {
        let mut volumes = Vec::with_capacity(paths.len());
        for path in paths {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut header = [0u8; 10];
            file.read_exact(&mut header)?;
            if header[0..4] != VOLUME_MAGIC {
                return Err(StorageError::Corruption(format!(
                    "bad volume magic in {:?}",
                    path
                )));
            }
            let stored_page_size = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
            if stored_page_size as u64 != page_size {
                return Err(StorageError::Corruption(format!(
                    "volume page size mismatch: expected {}, found {}",
                    page_size, stored_page_size
                )));
            }
            volumes.push(Volume {
                file: Mutex::new(file),
                path: path.clone(),
            });
        }

        let store = Self {
            volumes,
            page_size,
            pages_per_volume,
            alloc: Mutex::new(AllocState {
                volume: 0,
                next_page: 1,
            }),
        };
        let frontier = store.find_frontier()?;
        *store.alloc.lock() = frontier;
        Ok(store)
    }

    /// Scan for the first free page. Pages are append-only, so the
    /// frontier is the first page with a zero length prefix.
    fn find_frontier(&self) -> StorageResult<AllocState> {
        for (vi, volume) in self.volumes.iter().enumerate() {
            let mut file = volume.file.lock();
            let len = file.metadata()?.len();
            for page in 1..=self.pages_per_volume {
                let offset = page as u64 * self.page_size;
                if offset >= len {
                    return Ok(AllocState {
                        volume: vi,
                        next_page: page,
                    });
                }
                file.seek(SeekFrom::Start(offset))?;
                let mut len_buf = [0u8; 4];
                match file.read_exact(&mut len_buf) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Ok(AllocState {
                            volume: vi,
                            next_page: page,
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
                if u32::from_le_bytes(len_buf) == 0 {
                    return Ok(AllocState {
                        volume: vi,
                        next_page: page,
                    });
                }
            }
        }
        // Every page in every volume is in use.
        Ok(AllocState {
            volume: self.volumes.len(),
            next_page: 1,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }
}

impl BlockStore for VolumeStore {
    fn append_block(&self, data: &[u8]) -> StorageResult<LogicAddr> {
        if data.len() + BLOCK_OVERHEAD > self.page_size as usize {
            return Err(StorageError::Internal(format!(
                "block of {} bytes exceeds page size {}",
                data.len(),
                self.page_size
            )));
        }
        let mut alloc = self.alloc.lock();
        if alloc.volume >= self.volumes.len() {
            return Err(StorageError::Io(std::io::Error::other(
                "volume set is full",
            )));
        }
        let addr = make_addr(alloc.volume as u32, alloc.next_page);
        let volume = &self.volumes[alloc.volume];
        {
            let mut file = volume.file.lock();
            file.seek(SeekFrom::Start(alloc.next_page as u64 * self.page_size))?;
            file.write_all(&(data.len() as u32).to_le_bytes())?;
            file.write_all(&crc32fast::hash(data).to_le_bytes())?;
            file.write_all(data)?;
        }
        alloc.next_page += 1;
        if alloc.next_page > self.pages_per_volume {
            tracing::info!(volume = %volume.path.display(), "volume full, advancing");
            alloc.volume += 1;
            alloc.next_page = 1;
        }
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> StorageResult<Vec<u8>> {
        let (vi, page) = split_addr(addr);
        let volume = self
            .volumes
            .get(vi as usize)
            .ok_or_else(|| StorageError::NotFound(format!("volume {} for addr {:#x}", vi, addr)))?;
        let mut file = volume.file.lock();
        file.seek(SeekFrom::Start(page as u64 * self.page_size))?;
        let mut prefix = [0u8; BLOCK_OVERHEAD];
        file.read_exact(&mut prefix)?;
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let stored_crc = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if len == 0 || len + BLOCK_OVERHEAD > self.page_size as usize {
            return Err(StorageError::NotFound(format!(
                "no block at addr {:#x}",
                addr
            )));
        }
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;
        if crc32fast::hash(&data) != stored_crc {
            return Err(StorageError::Corruption(format!(
                "block checksum mismatch at addr {:#x}",
                addr
            )));
        }
        Ok(data)
    }

    fn flush(&self) -> StorageResult<()> {
        for volume in &self.volumes {
            volume.file.lock().sync_data()?;
        }
        Ok(())
    }
}

/// In-memory block store for tests and the empty in-memory construction
/// mode.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn append_block(&self, data: &[u8]) -> StorageResult<LogicAddr> {
        let mut blocks = self.blocks.write();
        blocks.push(data.to_vec());
        Ok(blocks.len() as LogicAddr - 1)
    }

    fn read_block(&self, addr: LogicAddr) -> StorageResult<Vec<u8>> {
        self.blocks
            .read()
            .get(addr as usize)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("no block at addr {:#x}", addr)))
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn volume_paths(dir: &Path, n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| dir.join(format!("db.{}.vol", i))).collect()
    }

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempdir().unwrap();
        let paths = volume_paths(dir.path(), 2);
        VolumeStore::create(&paths, 4096, 16, false).unwrap();

        let store = VolumeStore::open(&paths, 4096, 16).unwrap();
        let a = store.append_block(b"first block").unwrap();
        let b = store.append_block(b"second block").unwrap();
        store.flush().unwrap();

        assert_eq!(store.read_block(a).unwrap(), b"first block");
        assert_eq!(store.read_block(b).unwrap(), b"second block");
        assert_ne!(a, b);
    }

    #[test]
    fn test_frontier_survives_reopen() {
        let dir = tempdir().unwrap();
        let paths = volume_paths(dir.path(), 1);
        VolumeStore::create(&paths, 4096, 16, false).unwrap();

        let a = {
            let store = VolumeStore::open(&paths, 4096, 16).unwrap();
            let a = store.append_block(b"persisted").unwrap();
            store.flush().unwrap();
            a
        };

        let store = VolumeStore::open(&paths, 4096, 16).unwrap();
        assert_eq!(store.read_block(a).unwrap(), b"persisted");
        let b = store.append_block(b"after reopen").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.read_block(b).unwrap(), b"after reopen");
    }

    #[test]
    fn test_volume_advance() {
        let dir = tempdir().unwrap();
        let paths = volume_paths(dir.path(), 2);
        VolumeStore::create(&paths, 256, 2, false).unwrap();
        let store = VolumeStore::open(&paths, 256, 2).unwrap();

        let addrs: Vec<_> = (0..4)
            .map(|i| store.append_block(format!("block {}", i).as_bytes()).unwrap())
            .collect();
        assert_eq!(split_addr(addrs[0]).0, 0);
        assert_eq!(split_addr(addrs[3]).0, 1);

        assert!(matches!(
            store.append_block(b"one too many"),
            Err(StorageError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_block_rejected() {
        let dir = tempdir().unwrap();
        let paths = volume_paths(dir.path(), 1);
        VolumeStore::create(&paths, 128, 4, false).unwrap();
        let store = VolumeStore::open(&paths, 128, 4).unwrap();
        assert!(matches!(
            store.append_block(&vec![0u8; 256]),
            Err(StorageError::Internal(_))
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let paths = volume_paths(dir.path(), 1);
        VolumeStore::create(&paths, 256, 4, false).unwrap();
        let addr = {
            let store = VolumeStore::open(&paths, 256, 4).unwrap();
            let addr = store.append_block(b"will be damaged").unwrap();
            store.flush().unwrap();
            addr
        };
        {
            let mut f = OpenOptions::new().write(true).open(&paths[0]).unwrap();
            f.seek(SeekFrom::Start(256 + 8 + 2)).unwrap();
            f.write_all(&[0xff]).unwrap();
        }
        let store = VolumeStore::open(&paths, 256, 4).unwrap();
        assert!(matches!(
            store.read_block(addr),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlockStore::new();
        let a = store.append_block(b"x").unwrap();
        assert_eq!(store.read_block(a).unwrap(), b"x");
        assert!(store.read_block(99).is_err());
    }
}
