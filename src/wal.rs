use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;
/// Upper bound on appends sharing one fsync.
const MAX_BATCH: usize = 512;

fn invalid(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn le_u32(bytes: &[u8]) -> Option<u32> {
    bytes.try_into().ok().map(u32::from_le_bytes)
}

/// `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(event).map_err(invalid)?;
    let len = u32::try_from(payload.len()).map_err(|_| invalid("journal record too large"))?;
    let mut out = Vec::with_capacity(LEN_BYTES + payload.len() + CRC_BYTES);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(out)
}

enum Frame {
    /// A decoded event and the bytes it took.
    Intact(Event, usize),
    Damaged(&'static str),
}

fn read_frame(buf: &[u8]) -> Frame {
    let Some(len) = buf.get(..LEN_BYTES).and_then(le_u32) else {
        return Frame::Damaged("torn length prefix");
    };
    let end = LEN_BYTES + len as usize;
    let (Some(payload), Some(crc)) = (
        buf.get(LEN_BYTES..end),
        buf.get(end..end + CRC_BYTES).and_then(le_u32),
    ) else {
        return Frame::Damaged("torn record");
    };
    if crc != crc32fast::hash(payload) {
        return Frame::Damaged("checksum mismatch");
    }
    match bincode::deserialize(payload) {
        Ok(event) => Frame::Intact(event, end + CRC_BYTES),
        Err(_) => Frame::Damaged("undecodable record"),
    }
}

/// Contents of a journal file: every event up to the first damaged frame.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the intact prefix, and what was wrong with the first of them.
    pub discarded: u64,
    pub damage: Option<&'static str>,
}

impl Replay {
    pub fn read(path: &Path) -> io::Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mut replay = Self::default();
        let mut at = 0;
        while at < bytes.len() {
            match read_frame(&bytes[at..]) {
                Frame::Intact(event, used) => {
                    replay.events.push(event);
                    at += used;
                }
                Frame::Damaged(why) => {
                    replay.damage = Some(why);
                    break;
                }
            }
        }
        replay.valid_len = at as u64;
        replay.discarded = (bytes.len() - at) as u64;
        Ok(replay)
    }
}

/// Append-only journal of store mutations. A crash mid-write leaves at most one
/// damaged frame at the tail; [`Journal::recover`] cuts it off.
pub struct Journal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Journal {
    /// Replay `path`, truncate a damaged tail so new frames follow the last intact one,
    /// then open for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Replay::read(path)?;
        if replay.discarded > 0 {
            warn!(
                path = %path.display(),
                kept = replay.events.len(),
                discarded_bytes = replay.discarded,
                damage = replay.damage.unwrap_or("unknown"),
                "truncating damaged journal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, replay.events))
    }

    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Write `events` and fsync once.
    pub fn commit<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let written = events.into_iter().try_for_each(|event| -> io::Result<()> {
            self.out.write_all(&frame(event)?)?;
            self.appends_since_compact += 1;
            Ok(())
        });
        // Always flush: a failed batch must not leave bytes buffered for the next one.
        let synced = self.out.flush().and_then(|()| self.out.get_ref().sync_data());
        written.and(synced)
    }

    /// Replace the journal with `events` through a synced temp file and a rename.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        for event in events {
            out.write_all(&frame(event)?)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&tmp, &self.path)?;
        *self = Self::open(&self.path)?;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

// ── Writer task ──────────────────────────────────────────

type Ack<T> = oneshot::Sender<io::Result<T>>;

pub(crate) enum JournalCommand {
    Append { event: Event, response: Ack<()> },
    Compact { events: Vec<Event>, response: Ack<()> },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the journal. Appends queued while an fsync runs share the next one; a
/// control command splits the batch so everything queued ahead of it lands first.
pub(crate) async fn run_writer(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    let mut queued = Vec::with_capacity(MAX_BATCH);
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while rx.recv_many(&mut queued, MAX_BATCH).await > 0 {
        for cmd in queued.drain(..) {
            match cmd {
                JournalCommand::Append { event, response } => batch.push((event, response)),
                JournalCommand::Compact { events, response } => {
                    commit_batch(&mut journal, &mut batch);
                    let _ = response.send(journal.rewrite(&events));
                }
                JournalCommand::AppendsSinceCompact { response } => {
                    commit_batch(&mut journal, &mut batch);
                    let _ = response.send(journal.appends_since_compact());
                }
            }
        }
        commit_batch(&mut journal, &mut batch);
    }
}

fn commit_batch(journal: &mut Journal, batch: &mut Vec<(Event, Ack<()>)>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = journal.commit(batch.iter().map(|(event, _)| event));
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!(error = %e, records = batch.len(), "journal commit failed");
    }
    for (_, response) in batch.drain(..) {
        let ack = result
            .as_ref()
            .map(|_| ())
            .map_err(|e| io::Error::new(e.kind(), e.to_string()));
        let _ = response.send(ack);
    }
}
