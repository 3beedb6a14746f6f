//! Append-only page log with an in-memory ordered index.
//!
//! # File format
//! ```text
//! magic (4 bytes LE)
//! frame*
//!
//! frame = key_len (u32 LE) | value_len (u32 LE) | key | value | crc32 (u32 LE)
//! ```
//! The checksum covers both length fields, the key and the value.
//!
//! Values are not kept in memory: the index maps each key to the offset and
//! length of its value in the log, and reads go straight to the file.

use super::{PageEngine, StoreError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

/// Page log magic number
const LOG_MAGIC: u32 = 0x50474C47; // "PGLG"

const MAGIC_LEN: u64 = 4;
const FRAME_HEADER_LEN: u64 = 8;
const FRAME_TRAILER_LEN: u64 = 4;

/// Log file name inside the data directory
pub const LOG_FILE_NAME: &str = "pages.log";

/// fsync policy for log appends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// fsync after every append (safest, slowest)
    Always,
    /// Leave syncing to the OS; close still syncs
    #[default]
    Never,
}

#[derive(Debug, Clone, Copy)]
pub struct LogEngineOptions {
    pub fsync: FsyncPolicy,
    /// Capacity of the append buffer in front of the log file
    pub write_buffer_bytes: usize,
}

impl Default for LogEngineOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::Never,
            write_buffer_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ValueLocation {
    offset: u64,
    len: u32,
}

struct LogWriter {
    file: BufWriter<File>,
    /// Offset where the next frame starts
    end: u64,
}

/// Result of scanning a log file
struct Replay {
    index: BTreeMap<Vec<u8>, ValueLocation>,
    /// End of the last valid frame
    valid_end: u64,
    /// First invalid frame, if any
    corruption: Option<(u64, String)>,
}

/// Ordered, durable key-value engine backed by a single append-only file
pub struct LogEngine {
    path: PathBuf,
    options: LogEngineOptions,
    index: RwLock<BTreeMap<Vec<u8>, ValueLocation>>,
    /// `None` once closed
    writer: Mutex<Option<LogWriter>>,
    reader: File,
    #[cfg(test)]
    tear_next_append: AtomicBool,
}

impl LogEngine {
    /// Open or create the log under `dir`.
    ///
    /// Fails with [`StoreError::Corrupted`] if any frame is torn or fails its
    /// checksum; use [`LogEngine::recover`] to truncate past the damage.
    #[instrument(level = "debug", skip(dir, options), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, options: LogEngineOptions) -> Result<Self, StoreError> {
        let path = Self::prepare(dir.as_ref())?;
        let replay = Self::replay(&path)?;

        if let Some((offset, reason)) = replay.corruption {
            return Err(StoreError::Corrupted { offset, reason });
        }

        Self::finish_open(path, options, replay)
    }

    /// Open the log, truncating it at the first invalid frame.
    ///
    /// A log whose magic header is wrong cannot be recovered.
    #[instrument(level = "debug", skip(dir, options), fields(dir = %dir.as_ref().display()))]
    pub fn recover(dir: impl AsRef<Path>, options: LogEngineOptions) -> Result<Self, StoreError> {
        let path = Self::prepare(dir.as_ref())?;
        let replay = Self::replay(&path)?;

        if let Some((offset, reason)) = &replay.corruption {
            let file = OpenOptions::new().write(true).open(&path)?;
            let original_len = file.metadata()?.len();
            file.set_len(replay.valid_end)?;
            file.sync_all()?;
            warn!(
                offset,
                reason = %reason,
                dropped_bytes = original_len - replay.valid_end,
                kept_pages = replay.index.len(),
                "page log truncated after corruption"
            );
        }

        Self::finish_open(path, options, replay)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All keys in order (for inspection and tests)
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.read().keys().cloned().collect()
    }

    /// Size of the log in bytes, including the header
    pub fn log_size(&self) -> u64 {
        self.writer
            .lock()
            .as_ref()
            .map(|writer| writer.end)
            .unwrap_or(0)
    }

    fn prepare(dir: &Path) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let is_new = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        if is_new {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(&LOG_MAGIC.to_le_bytes())?;
            file.sync_all()?;
            debug!(path = %path.display(), "created page log");
        }

        Ok(path)
    }

    fn replay(path: &Path) -> Result<Replay, StoreError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(StoreError::BadHeader(format!(
                    "log is {} bytes, shorter than its header",
                    file_len
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let magic = u32::from_le_bytes(magic);
        if magic != LOG_MAGIC {
            return Err(StoreError::BadHeader(format!(
                "invalid log magic: expected {:#x}, got {:#x}",
                LOG_MAGIC, magic
            )));
        }

        let mut index = BTreeMap::new();
        let mut offset = MAGIC_LEN;
        let mut corruption = None;

        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < FRAME_HEADER_LEN {
                corruption = Some((offset, "torn frame header".to_string()));
                break;
            }

            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            reader.read_exact(&mut header)?;
            let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let value_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let frame_len =
                FRAME_HEADER_LEN + key_len as u64 + value_len as u64 + FRAME_TRAILER_LEN;
            if frame_len > remaining {
                corruption = Some((offset, "torn frame body".to_string()));
                break;
            }

            let mut body = vec![0u8; key_len as usize + value_len as usize];
            reader.read_exact(&mut body)?;
            let mut trailer = [0u8; FRAME_TRAILER_LEN as usize];
            reader.read_exact(&mut trailer)?;

            let stored = u32::from_le_bytes(trailer);
            let computed = frame_checksum(&header, &body);
            if stored != computed {
                corruption = Some((
                    offset,
                    format!(
                        "checksum mismatch: stored {:#x}, computed {:#x}",
                        stored, computed
                    ),
                ));
                break;
            }

            let key = body[..key_len as usize].to_vec();
            index.insert(
                key,
                ValueLocation {
                    offset: offset + FRAME_HEADER_LEN + key_len as u64,
                    len: value_len,
                },
            );
            offset += frame_len;
        }

        Ok(Replay {
            index,
            valid_end: offset,
            corruption,
        })
    }

    fn finish_open(
        path: PathBuf,
        options: LogEngineOptions,
        replay: Replay,
    ) -> Result<Self, StoreError> {
        let file = OpenOptions::new().append(true).open(&path)?;
        let reader = File::open(&path)?;

        info!(
            path = %path.display(),
            pages = replay.index.len(),
            log_bytes = replay.valid_end,
            "page log opened"
        );

        Ok(Self {
            path,
            options,
            index: RwLock::new(replay.index),
            writer: Mutex::new(Some(LogWriter {
                file: BufWriter::with_capacity(options.write_buffer_bytes, file),
                end: replay.valid_end,
            })),
            reader,
            #[cfg(test)]
            tear_next_append: AtomicBool::new(false),
        })
    }

    fn append_frame(
        &self,
        writer: &mut LogWriter,
        header: &[u8],
        key: &[u8],
        value: &[u8],
        checksum: u32,
    ) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if self.tear_next_append.swap(false, Ordering::SeqCst) {
                // Header reaches the file, the rest never does
                writer.file.write_all(header)?;
                writer.file.flush()?;
                return Err(std::io::Error::new(ErrorKind::Other, "torn append"));
            }
        }

        writer.file.write_all(header)?;
        writer.file.write_all(key)?;
        writer.file.write_all(value)?;
        writer.file.write_all(&checksum.to_le_bytes())?;

        // Readers use positional reads on a separate handle, so the frame must
        // reach the OS before it is indexed
        writer.file.flush()?;
        if self.options.fsync == FsyncPolicy::Always {
            writer.file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drop buffered bytes of a failed append and truncate the log to `end`
    fn discard_torn_frame(&self, writer: LogWriter) -> std::io::Result<LogWriter> {
        let LogWriter { file, end } = writer;
        let (file, _unwritten) = file.into_parts();
        file.set_len(end)?;
        warn!(path = %self.path.display(), log_bytes = end, "rolled back torn append");
        Ok(LogWriter {
            file: BufWriter::with_capacity(self.options.write_buffer_bytes, file),
            end,
        })
    }

    fn read_value(&self, location: ValueLocation) -> Result<Bytes, StoreError> {
        let mut buf = vec![0u8; location.len as usize];
        read_exact_at(&self.reader, &mut buf, location.offset)?;
        Ok(Bytes::from(buf))
    }
}

impl PageEngine for LogEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let key_len = u32::try_from(key.len()).map_err(|_| StoreError::TooLarge(key.len()))?;
        let value_len =
            u32::try_from(value.len()).map_err(|_| StoreError::TooLarge(value.len()))?;

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        header[..4].copy_from_slice(&key_len.to_le_bytes());
        header[4..].copy_from_slice(&value_len.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(key);
        hasher.update(value);
        let checksum = hasher.finalize();

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;

        if let Err(e) = self.append_frame(writer, &header, key, value, checksum) {
            // Part of the frame may sit in the buffer or the file; cut it so
            // the next frame starts at `end` again
            if let Some(torn) = guard.take() {
                match self.discard_torn_frame(torn) {
                    Ok(writer) => *guard = Some(writer),
                    Err(rollback) => error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "failed to roll back torn append, page log closed for writes"
                    ),
                }
            }
            return Err(e.into());
        }

        let location = ValueLocation {
            offset: writer.end + FRAME_HEADER_LEN + key_len as u64,
            len: value_len,
        };
        writer.end += FRAME_HEADER_LEN + key_len as u64 + value_len as u64 + FRAME_TRAILER_LEN;

        // Indexed under the writer lock so the index follows log order
        self.index.write().insert(key.to_vec(), location);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let location = match self.index.read().get(key) {
            Some(location) => *location,
            None => return Ok(None),
        };
        self.read_value(location).map(Some)
    }

    fn len(&self) -> usize {
        self.index.read().len()
    }

    fn close(&self) -> Result<(), StoreError> {
        let Some(mut writer) = self.writer.lock().take() else {
            return Ok(());
        };
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        info!(path = %self.path.display(), log_bytes = writer.end, "page log closed");
        Ok(())
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().as_mut() {
            if let Err(e) = writer.file.flush() {
                warn!(error = %e, "failed to flush page log on drop");
            }
        }
    }
}

fn frame_checksum(header: &[u8], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(body);
    hasher.finalize()
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
