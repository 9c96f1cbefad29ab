//! file-based storage implementation using std::fs
//!
//! stores a partition log in a directory with:
//! - blocks.log: append-only frames of `lowest | highest | length | data`
//! - meta.json: number of committed blocks, rewritten atomically

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::index::BlockIndex;
use crate::{
    Address, AppendListener, Block, DurabilityPolicy, LogStorage, LogStorageReader, Position,
    StorageError,
};

/// lowest (8) + highest (8) + data length (4)
const BLOCK_HEADER_LENGTH: u64 = 20;

const BLOCKS_FILE: &str = "blocks.log";
const META_FILE: &str = "meta.json";
const META_TEMP_FILE: &str = "meta.tmp";

/// metadata persisted next to the blocks
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    committed_blocks: u64,
}

struct PendingCommit {
    address: Address,
    highest_position: Position,
    listener: Box<dyn AppendListener>,
}

#[derive(Default)]
struct FileState {
    file: Option<File>,
    index: BlockIndex,
    /// byte offset of each block's frame
    offsets: Vec<u64>,
    /// end of the last complete frame
    end: u64,
    pending: Vec<PendingCommit>,
}

/// segment-file block storage
///
/// `open` recovers previously written blocks and truncates a torn frame at
/// the tail. Blocks that survived on disk are committed again on open.
pub struct FileLogStorage {
    dir: PathBuf,
    policy: DurabilityPolicy,
    state: Arc<RwLock<FileState>>,
}

impl FileLogStorage {
    /// create a file storage in `dir`; call `open` before appending
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_policy(dir, DurabilityPolicy::Immediate)
    }

    pub fn with_policy(dir: impl Into<PathBuf>, policy: DurabilityPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            state: Arc::new(RwLock::new(FileState::default())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blocks_path(&self) -> PathBuf {
        self.dir.join(BLOCKS_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, FileState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, FileState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_meta(&self) -> Result<MetaData, StorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(MetaData::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    // atomic write: write to temp file then rename
    fn save_meta(&self, committed_blocks: usize) -> Result<(), StorageError> {
        let meta = MetaData {
            committed_blocks: committed_blocks as u64,
        };
        let json = serde_json::to_string_pretty(&meta)?;

        let temp_path = self.dir.join(META_TEMP_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        Ok(())
    }

    /// scan all complete frames, cutting off a torn tail
    fn recover(&self, file: &mut File, state: &mut FileState) -> Result<(), StorageError> {
        let length = file.metadata()?.len();
        let mut offset = 0u64;
        let mut header = [0u8; BLOCK_HEADER_LENGTH as usize];
        file.seek(SeekFrom::Start(0))?;

        while offset + BLOCK_HEADER_LENGTH <= length {
            file.read_exact(&mut header)?;
            let (lowest, highest, data_length) = parse_header(&header);
            let frame_end = offset + BLOCK_HEADER_LENGTH + data_length;
            if frame_end > length {
                break;
            }
            if let Err(error) = state.index.check(lowest, highest) {
                return Err(StorageError::Corrupted {
                    address: state.index.len() as Address + 1,
                    reason: error.to_string(),
                });
            }
            state.index.push(lowest, highest);
            state.offsets.push(offset);
            file.seek(SeekFrom::Start(frame_end))?;
            offset = frame_end;
        }

        if offset < length {
            warn!(
                path = %self.blocks_path().display(),
                valid_bytes = offset,
                torn_bytes = length - offset,
                "truncating torn block at end of log"
            );
            file.set_len(offset)?;
        }
        state.end = offset;
        Ok(())
    }
}

/// Length field of a frame holding `block_len` bytes
fn frame_length(block_len: usize) -> Result<u32, StorageError> {
    u32::try_from(block_len).map_err(|_| StorageError::BlockTooLarge(block_len))
}

fn write_frame(file: &mut File, offset: u64, frame: &[u8], sync: bool) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(frame)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn parse_header(header: &[u8; BLOCK_HEADER_LENGTH as usize]) -> (Position, Position, u64) {
    let mut word = [0u8; 8];
    word.copy_from_slice(&header[0..8]);
    let lowest = u64::from_le_bytes(word);
    word.copy_from_slice(&header[8..16]);
    let highest = u64::from_le_bytes(word);
    let mut length = [0u8; 4];
    length.copy_from_slice(&header[16..20]);
    (lowest, highest, u32::from_le_bytes(length) as u64)
}

impl LogStorage for FileLogStorage {
    fn open(&self) -> Result<(), StorageError> {
        let mut state = self.write_state();
        if state.file.is_some() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let meta = self.load_meta()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.blocks_path())?;

        let mut recovered = FileState::default();
        self.recover(&mut file, &mut recovered)?;

        if (recovered.index.len() as u64) < meta.committed_blocks {
            return Err(StorageError::Corrupted {
                address: recovered.index.len() as Address + 1,
                reason: format!(
                    "{} blocks were committed but only {} are on disk",
                    meta.committed_blocks,
                    recovered.index.len()
                ),
            });
        }

        file.sync_all()?;
        let blocks = recovered.index.len();
        recovered.index.commit_up_to(blocks as Address);
        self.save_meta(blocks)?;

        info!(path = %self.dir.display(), blocks, "opened file log storage");
        recovered.file = Some(file);
        *state = recovered;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.write_state();
        if state.file.take().is_some() {
            if !state.pending.is_empty() {
                debug!(count = state.pending.len(), "closing with uncommitted blocks");
            }
            state.pending.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.read_state().file.is_some()
    }

    fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        block: &[u8],
        mut listener: Box<dyn AppendListener>,
    ) -> Result<Address, StorageError> {
        let address = {
            let mut state = self.write_state();
            if state.file.is_none() {
                return Err(StorageError::Closed);
            }
            let start = state.end;
            state.index.check(lowest_position, highest_position)?;
            let length = frame_length(block.len())?;
            let file = state.file.as_mut().ok_or(StorageError::Closed)?;

            let mut frame = Vec::with_capacity(BLOCK_HEADER_LENGTH as usize + block.len());
            frame.extend_from_slice(&lowest_position.to_le_bytes());
            frame.extend_from_slice(&highest_position.to_le_bytes());
            frame.extend_from_slice(&length.to_le_bytes());
            frame.extend_from_slice(block);

            let sync = self.policy == DurabilityPolicy::Immediate;
            if let Err(error) = write_frame(file, start, &frame, sync) {
                // drop whatever part of the frame made it to disk
                let _ = file.set_len(start);
                return Err(error.into());
            }

            let address = state.index.push(lowest_position, highest_position);
            state.offsets.push(start);
            state.end = start + frame.len() as u64;

            if self.policy == DurabilityPolicy::Immediate {
                if let Err(error) = self.save_meta(address as usize) {
                    state.index.pop();
                    state.offsets.pop();
                    state.end = start;
                    if let Some(file) = state.file.as_mut() {
                        let _ = file.set_len(start);
                    }
                    return Err(error);
                }
                state.index.commit_up_to(address);
            }
            address
        };

        listener.on_write(address, highest_position);
        match self.policy {
            DurabilityPolicy::Immediate => listener.on_commit(address, highest_position),
            DurabilityPolicy::OnFlush => self.write_state().pending.push(PendingCommit {
                address,
                highest_position,
                listener,
            }),
        }
        Ok(address)
    }

    fn flush(&self) -> Result<(), StorageError> {
        let pending = {
            let mut state = self.write_state();
            let file = match state.file.as_mut() {
                Some(file) => file,
                None => return Ok(()),
            };
            file.sync_all()?;

            let pending = std::mem::take(&mut state.pending);
            if let Some(last) = pending.last() {
                if let Err(error) = self.save_meta(last.address as usize) {
                    state.pending = pending;
                    return Err(error);
                }
                state.index.commit_up_to(last.address);
            }
            pending
        };

        for mut commit in pending {
            commit.listener.on_commit(commit.address, commit.highest_position);
        }
        Ok(())
    }

    fn new_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(FileReader {
            path: self.blocks_path(),
            state: Arc::clone(&self.state),
            file: None,
        })
    }
}

struct FileReader {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
    file: Option<File>,
}

impl FileReader {
    fn state(&self) -> RwLockReadGuard<'_, FileState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_data(&mut self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "block file not open"))?;

        let mut header = [0u8; BLOCK_HEADER_LENGTH as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        let (_, _, stored_length) = parse_header(&header);
        if stored_length != length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {stored_length} does not match index length {length}"),
            ));
        }

        let mut data = vec![0u8; length as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }
}

impl LogStorageReader for FileReader {
    fn is_empty(&self) -> bool {
        self.state().index.is_empty()
    }

    fn read(&mut self, address: Address) -> Result<Option<Block>, StorageError> {
        let (range, offset, length, committed) = {
            let state = self.state();
            let committed = state.index.is_committed(address);
            let range = match state.index.range(address) {
                Some(range) => range,
                None if committed => {
                    return Err(StorageError::Corrupted {
                        address,
                        reason: "committed block is missing from the index".to_string(),
                    })
                }
                None => return Ok(None),
            };
            let slot = (address - 1) as usize;
            let offset = state.offsets[slot];
            let end = state.offsets.get(slot + 1).copied().unwrap_or(state.end);
            (range, offset, end - offset - BLOCK_HEADER_LENGTH, committed)
        };

        match self.read_data(offset, length) {
            Ok(data) => Ok(Some(Block {
                address,
                lowest_position: range.lowest,
                highest_position: range.highest,
                data,
            })),
            Err(error) if committed => Err(StorageError::Corrupted {
                address,
                reason: error.to_string(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    fn read_last_block(&mut self) -> Result<Option<Block>, StorageError> {
        let last = self.state().index.len() as Address;
        if last == 0 {
            return Ok(None);
        }
        self.read(last)
    }

    fn lookup_approximate_address(&self, position: Position) -> Option<Address> {
        self.state().index.lookup(position)
    }
}
