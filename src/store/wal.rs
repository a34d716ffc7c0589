use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_RECORD_BYTES;
use crate::model::Event;

/// Length prefix plus CRC trailer around every payload.
const FRAME_BYTES: u64 = 8;

/// Encode one committed transaction to [len][bincode][crc32] format.
/// Returns the number of bytes written.
fn encode_record(writer: &mut impl Write, events: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("WAL record of {} bytes exceeds {MAX_RECORD_BYTES}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_BYTES)
}

/// What [`Wal::replay`] recovered from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<Vec<Event>>,
    /// Byte offset just past the last intact record.
    pub valid_len: u64,
}

/// Append-only Write-Ahead Log.
///
/// Format per record: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - A record is every event of one committed transaction, so a booking
///   and its ledger entry replay together or not at all.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last record (crash) is discarded via length-prefix + CRC check,
///   and [`Wal::open`] cuts it off so new records never land behind it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Bytes handed to the writer, synced or not.
    written_len: u64,
    /// Bytes known to be durable. Everything past this is discarded by `rewind`.
    synced_len: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, truncating it to
    /// `valid_len` (from [`Wal::replay`]) when a torn tail follows.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "discarding {} torn bytes at the end of {}",
                on_disk - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let len = on_disk.min(valid_len);
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            written_len: len,
            synced_len: len,
        })
    }

    /// Append a single record and fsync. Used by tests only;
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Append a record to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        self.written_len += encode_record(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.written_len;
        Ok(())
    }

    /// Drop everything appended since the last successful sync, both the
    /// buffered bytes and whatever already reached the file.
    pub fn rewind(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (_, _discarded) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.written_len = self.synced_len;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted state to a temp file and fsync.
    /// One record per event: a snapshot has no cross-row atomicity to keep.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_record(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.written_len = len;
        self.synced_len = len;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records in order and
    /// the offset where the intact prefix ends.
    /// Truncated/corrupt trailing records are discarded.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_BYTES {
                break; // garbage length, not a record
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(events) => records.push(events),
                Err(_) => break,
            }
            valid_len += len as u64 + FRAME_BYTES;
        }

        Ok(Replay { records, valid_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AmenityKind, Resource};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("roomslot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn resource(label: &str) -> Event {
        Event::ResourceUpserted(Resource {
            id: Ulid::new(),
            kind: AmenityKind::MeetingRoom,
            label: label.into(),
            capacity: 4,
            floor_id: 1,
        })
    }

    #[test]
    fn append_and_replay_keeps_record_boundaries() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let first = vec![resource("a")];
        let second = vec![resource("b"), Event::ResourceDeleted { id: Ulid::new() }];

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap().records;
        assert_eq!(replayed, vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_truncated_transaction_whole() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let committed = vec![resource("a")];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&committed).unwrap();
        }

        // Write the first half of a two-event record to simulate a crash mid-append
        {
            let payload = bincode::serialize(&vec![resource("b"), resource("c")]).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap().records;
        assert_eq!(replayed, vec![committed]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().records.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&vec![resource("a")]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().records.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let kept = resource("kept");
        let later = vec![resource("later")];

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for _ in 0..10 {
                wal.append(&[resource("churn")]).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            wal.append(&later).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap().records;
        assert_eq!(replayed, vec![vec![kept], later]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_cuts_torn_tail_before_appending() {
        let path = tmp_path("torn_tail.wal");
        let _ = fs::remove_file(&path);

        let first = vec![resource("a")];
        let second = vec![resource("b")];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![first.clone()]);
        assert!(replay.valid_len < fs::metadata(&path).unwrap().len());
        {
            let mut wal = Wal::open(&path, replay.valid_len).unwrap();
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().records, vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_treated_as_torn() {
        let path = tmp_path("oversized_len.wal");
        let _ = fs::remove_file(&path);

        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewind_discards_unsynced_bytes() {
        let path = tmp_path("rewind.wal");
        let _ = fs::remove_file(&path);

        let kept = vec![resource("kept")];
        let failed = vec![resource("failed")];
        let later = vec![resource("later")];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&kept).unwrap();
            // Bytes reach the file but the sync never completes.
            wal.append_buffered(&failed).unwrap();
            wal.writer.flush().unwrap();
            wal.rewind().unwrap();
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().records, vec![kept, later]);

        let _ = fs::remove_file(&path);
    }
}
