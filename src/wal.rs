//! Durable log of viewing snapshots.
//!
//! Every write to a viewing appends the whole row as it stands after the
//! write. Nothing is ever updated in place: on startup the store folds the
//! log by id and keeps the newest snapshot. Compaction rewrites the file to
//! hold exactly that fold, one snapshot per viewing.
//!
//! Frame: `[u32 le: payload len][bincode Viewing][u32 le: crc32 of payload]`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_RECORD_BYTES;
use crate::model::Viewing;

fn write_frame(out: &mut impl Write, snapshot: &Viewing) -> io::Result<()> {
    let body =
        bincode::serialize(snapshot).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(body.len() as u32).to_le_bytes())?;
    out.write_all(&body)?;
    out.write_all(&crc32fast::hash(&body).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first, which is a torn tail.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact snapshot, or `None` at the end of the usable log.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Viewing>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    if !fill(reader, &mut body)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&body) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&body).ok())
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn staging_path(&self) -> PathBuf {
        Self::staging_for(&self.path)
    }

    fn staging_for(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, snapshot: &Viewing) -> io::Result<()> {
        self.append_buffered(snapshot)?;
        self.flush_sync()
    }

    /// Buffer one snapshot. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, snapshot: &Viewing) -> io::Result<()> {
        write_frame(&mut self.writer, snapshot)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage the folded state (one snapshot per viewing) next to the log.
    /// The live log is untouched until [`Wal::swap_compact_file`].
    pub fn write_compact_file(path: &Path, latest: &[Viewing]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(Self::staging_for(path))?);
        for snapshot in latest {
            write_frame(&mut out, snapshot)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Replace the log with the staged file and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.staging_path(), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, latest: &[Viewing]) -> io::Result<()> {
        Self::write_compact_file(&self.path, latest)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact snapshot in append order, older versions included.
    /// Reading stops at the first torn, oversized, corrupt or undecodable frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Viewing>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut snapshots = Vec::new();
        while let Some(snapshot) = read_frame(&mut reader)? {
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{sample_viewing, Span, ViewingStatus, HOUR_MS};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("viewings_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn viewing() -> Viewing {
        sample_viewing(Ulid::new(), Span::new(0, HOUR_MS), ViewingStatus::Requested)
    }

    #[test]
    fn replay_returns_every_version_in_append_order() {
        let path = tmp_path("versions.wal");
        let mut v = viewing();
        let other = viewing();
        let mut written = Vec::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            for snapshot in [&v, &other] {
                wal.append(snapshot).unwrap();
                written.push(snapshot.clone());
            }
            v.status = ViewingStatus::Confirmed;
            v.version += 1;
            wal.append(&v).unwrap();
            written.push(v.clone());
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, written);
        // Folding by id is the reader's job; the newest copy comes last.
        let newest = replayed.iter().rev().find(|s| s.id == v.id).unwrap();
        assert_eq!(newest.status, ViewingStatus::Confirmed);
    }

    #[test]
    fn torn_tail_drops_only_the_partial_snapshot() {
        let path = tmp_path("torn.wal");
        let snapshot = viewing();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&snapshot).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot]);
    }

    #[test]
    fn missing_log_replays_empty() {
        assert!(Wal::replay(&tmp_path("missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_ends_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = viewing();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
            let body = bincode::serialize(&viewing()).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&body).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn oversized_length_ends_replay() {
        let path = tmp_path("oversized.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&((MAX_RECORD_BYTES as u32) + 1).to_le_bytes()).unwrap();
            f.write_all(&[0u8; 64]).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_keeps_latest_snapshots_and_appends_after() {
        let path = tmp_path("compact.wal");
        let mut v = viewing();
        let later = viewing();
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                v.version += 1;
                wal.append(&v).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&v)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert!(!Wal::staging_for(&path).exists());
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![v, later]);
    }
}
