//! Id generator state files.
//!
//! Layout, little endian:
//!
//! ```text
//! magic "GCID" | version u8 | clean u8 | space u8 | pad u8 | high u64 | count u32 | ids u64* | crc32
//! ```
//!
//! The checksum covers everything before it. A file is marked unclean as soon as its
//! generator is opened and only marked clean again by [`FileIdGeneratorFactory::close_all`].

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::{IdGenerator, IdGeneratorFactory, IdGeneratorState};
use crate::metrics::{default_metrics, CacheMetrics};
use crate::types::{CacheError, IdSpace, Result};

const MAGIC: &[u8; 4] = b"GCID";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4;

fn ordinal(space: IdSpace) -> u8 {
    IdSpace::ALL
        .iter()
        .position(|candidate| *candidate == space)
        .unwrap_or(0) as u8
}

struct IdFile {
    clean: bool,
    state: IdGeneratorState,
}

fn encode(space: IdSpace, file: &IdFile) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + file.state.free_ids.len() * 8 + 4);
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.push(u8::from(file.clean));
    buf.push(ordinal(space));
    buf.push(0);
    buf.extend_from_slice(&file.state.high_id.to_le_bytes());
    buf.extend_from_slice(&(file.state.free_ids.len() as u32).to_le_bytes());
    for id in &file.state.free_ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    buf.get(at..at + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(CacheError::Corruption("id file truncated"))
}

fn decode(space: IdSpace, buf: &[u8]) -> Result<IdFile> {
    if buf.len() < HEADER_LEN + 4 {
        return Err(CacheError::Corruption("id file truncated"));
    }
    let (body, tail) = buf.split_at(buf.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32fast::hash(body) != stored {
        return Err(CacheError::Corruption("id file checksum mismatch"));
    }
    if &body[..4] != MAGIC {
        return Err(CacheError::Corruption("id file magic mismatch"));
    }
    if body[4] != VERSION {
        return Err(CacheError::Corruption("unsupported id file version"));
    }
    if body[6] != ordinal(space) {
        return Err(CacheError::Corruption("id file belongs to another id space"));
    }
    let clean = body[5] == 1;
    let high_id = read_u64(body, 8)?;
    let count = u32::from_le_bytes([body[16], body[17], body[18], body[19]]) as usize;
    if body.len() != HEADER_LEN + count * 8 {
        return Err(CacheError::Corruption("id file length mismatch"));
    }
    let free_ids = (0..count)
        .map(|i| read_u64(body, HEADER_LEN + i * 8))
        .collect::<Result<Vec<_>>>()?;
    Ok(IdFile {
        clean,
        state: IdGeneratorState { high_id, free_ids },
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("id.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Keeps one state file per id space under a directory.
pub struct FileIdGeneratorFactory {
    dir: PathBuf,
    generators: Mutex<FxHashMap<IdSpace, Arc<IdGenerator>>>,
    metrics: Arc<dyn CacheMetrics>,
}

impl FileIdGeneratorFactory {
    /// Factory rooted at `dir`; the directory must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_metrics(dir, default_metrics())
    }

    /// Like [`FileIdGeneratorFactory::new`] with an explicit metrics sink.
    pub fn with_metrics(dir: impl Into<PathBuf>, metrics: Arc<dyn CacheMetrics>) -> Self {
        Self {
            dir: dir.into(),
            generators: Mutex::new(FxHashMap::default()),
            metrics,
        }
    }

    /// State file of `space`.
    pub fn path(&self, space: IdSpace) -> PathBuf {
        self.dir.join(format!("{}.id", space.name()))
    }

    fn store(&self, space: IdSpace, file: &IdFile) -> Result<()> {
        write_atomic(&self.path(space), &encode(space, file))?;
        Ok(())
    }

    /// Writes every open generator's state and marks the files clean.
    pub fn close_all(&self) -> Result<()> {
        let mut generators = self.generators.lock();
        for (space, generator) in generators.iter() {
            self.store(
                *space,
                &IdFile {
                    clean: true,
                    state: generator.state(),
                },
            )?;
        }
        debug!(count = generators.len(), "ids.file.close_all");
        generators.clear();
        Ok(())
    }
}

impl IdGeneratorFactory for FileIdGeneratorFactory {
    fn create(&self, space: IdSpace, high_id: u64) -> Result<Arc<IdGenerator>> {
        let generator = Arc::new(IdGenerator::with_metrics(
            space,
            high_id,
            Arc::clone(&self.metrics),
        ));
        self.store(
            space,
            &IdFile {
                clean: false,
                state: generator.state(),
            },
        )?;
        self.generators.lock().insert(space, Arc::clone(&generator));
        Ok(generator)
    }

    fn open(&self, space: IdSpace) -> Result<Arc<IdGenerator>> {
        if let Some(existing) = self.generators.lock().get(&space) {
            return Ok(Arc::clone(existing));
        }
        let bytes = fs::read(self.path(space))?;
        let mut file = decode(space, &bytes)?;
        if !file.clean {
            warn!(
                space = space.name(),
                dropped = file.state.free_ids.len(),
                "ids.file.unclean"
            );
            file.state.free_ids.clear();
        }
        let generator = Arc::new(IdGenerator::from_state(
            space,
            file.state,
            Arc::clone(&self.metrics),
        )?);
        self.store(
            space,
            &IdFile {
                clean: false,
                state: IdGeneratorState {
                    high_id: generator.high_id(),
                    free_ids: Vec::new(),
                },
            },
        )?;
        self.generators.lock().insert(space, Arc::clone(&generator));
        Ok(generator)
    }

    fn get(&self, space: IdSpace) -> Result<Arc<IdGenerator>> {
        self.generators
            .lock()
            .get(&space)
            .cloned()
            .ok_or(CacheError::Invalid("id generator not opened"))
    }
}
