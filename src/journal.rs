use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only journal of scheduling events.
///
/// Frame format: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// `len` covers the bincode payload only. A crash mid-write leaves a
/// truncated or checksum-broken tail frame which replay silently drops.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_rewrite: u64,
}

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

impl Journal {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_rewrite: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one event without flushing. The group-commit writer calls
    /// `sync` once per batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_rewrite += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append a single event durably. Test convenience; production goes
    /// through the group-commit writer.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.sync()
    }

    pub fn appends_since_rewrite(&self) -> u64 {
        self.appends_since_rewrite
    }

    /// Phase one of compaction: write the replacement event set to a temp
    /// file and fsync it. Slow I/O, runs outside the writer's turn.
    pub fn write_rewrite_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp = path.with_extension("journal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: atomically rename the temp file over the journal and
    /// reopen for appends.
    pub fn swap_rewrite_file(&mut self) -> io::Result<()> {
        let tmp = self.path.with_extension("journal.tmp");
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_rewrite = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_rewrite_file(&self.path, events)?;
        self.swap_rewrite_file()
    }

    /// Read every intact frame from disk. A missing file is an empty
    /// journal; a corrupt or truncated tail ends the replay early.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, Event};
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn sample_event() -> Event {
        Event::SlotDeleted { id: Ulid::new() }
    }

    fn confirm_event() -> Event {
        Event::AppointmentConfirmed {
            id: Ulid::new(),
            actor: Actor::Provider(Ulid::new()),
            method: crate::model::ConfirmationMethod::Sms,
            code: "K2X9QA".into(),
            at: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap()),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let events = vec![sample_event(), confirm_event()];

        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append(e).unwrap();
            }
        }

        assert_eq!(Journal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.journal");
        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncated.journal");
        let event = sample_event();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 5]).unwrap(); // partial frame
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.journal");
        let payload = bincode::serialize(&sample_event()).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xBADC_0DEu32.to_le_bytes()).unwrap();
        }
        assert!(Journal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewrite_shrinks_and_preserves() {
        let path = tmp_path("rewrite.journal");
        {
            let mut journal = Journal::open(&path).unwrap();
            for _ in 0..50 {
                journal.append(&confirm_event()).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let kept = vec![sample_event()];
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.rewrite(&kept).unwrap();
            assert_eq!(journal.appends_since_rewrite(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before);
        assert_eq!(Journal::replay(&path).unwrap(), kept);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_after_rewrite() {
        let path = tmp_path("rewrite_then_append.journal");
        let first = sample_event();
        let second = confirm_event();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&confirm_event()).unwrap();
            journal.rewrite(std::slice::from_ref(&first)).unwrap();
            journal.append(&second).unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_visible_after_sync() {
        let path = tmp_path("buffered.journal");
        let events: Vec<Event> = (0..4).map(|_| sample_event()).collect();
        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append_buffered(e).unwrap();
            }
            assert_eq!(journal.appends_since_rewrite(), 4);
            journal.sync().unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
