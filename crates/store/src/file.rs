//! File-backed event log: a JSON-lines journal under an in-memory index.
//!
//! One journal line holds one committed unit, an appended batch or a
//! metadata write, so recovery is a line-by-line replay. A line is written
//! and fsynced before the commit becomes visible; an append acknowledged to
//! the caller is therefore on disk in full.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rill_core::{ExpectedVersion, StreamId};

use crate::error::{StoreError, StoreResult};
use crate::index::{self, AppendPlan, StreamIndex};
use crate::log::EventLog;
use crate::record::{AppendReceipt, ProposedEvent, RecordedEvent, StreamMetadata};
use crate::seq::GlobalSequencer;
use crate::source::SourceSelector;
use crate::truncation;

/// Durable [`EventLog`] for single-node embedded use.
///
/// Reads are served from the in-memory index; the journal is written on the
/// append path and replayed on open. Appends to different streams still
/// serialize on the journal file itself.
#[derive(Debug)]
pub struct FileEventLog {
    index: StreamIndex,
    seq: GlobalSequencer,
    truncation_stamp: AtomicU64,
    journal: Mutex<Journal>,
    path: PathBuf,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry<'a> {
    Batch { events: &'a [RecordedEvent] },
    Marker {
        stream_id: &'a StreamId,
        metadata: StreamMetadata,
    },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecoveredEntry {
    Batch { events: Vec<RecordedEvent> },
    Marker {
        stream_id: StreamId,
        metadata: StreamMetadata,
    },
}

#[derive(Debug)]
struct Journal {
    file: File,
    committed_len: u64,
    wedged: bool,
}

impl Journal {
    /// Write one line and fsync it. On failure the file is rolled back to
    /// the last committed line; if even that fails the journal stops
    /// accepting writes until the log is reopened.
    fn write_entry(&mut self, buf: &[u8]) -> StoreResult<()> {
        if self.wedged {
            return Err(StoreError::storage(
                "journal wedged after a failed write; reopen the log",
            ));
        }
        if let Err(e) = self
            .file
            .write_all(buf)
            .and_then(|()| self.file.sync_all())
        {
            let rolled_back = self
                .file
                .set_len(self.committed_len)
                .and_then(|()| self.file.seek(SeekFrom::End(0)).map(|_| ()));
            if rolled_back.is_err() {
                self.wedged = true;
            }
            return Err(StoreError::storage(e));
        }
        self.committed_len += buf.len() as u64;
        Ok(())
    }
}

impl FileEventLog {
    /// Open (or create) a journal file and replay it.
    ///
    /// An unterminated or unparsable final line is a torn write: it is
    /// logged and truncated away. A damaged line with further entries behind
    /// it means the journal is unusable and opening fails.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::storage(e)),
        };

        let (entries, keep_len) = parse_journal(&contents)?;

        let index = StreamIndex::new();
        let mut next_global = 0u64;
        let mut marker_writes = 0u64;
        let mut batches = 0u64;
        for entry in entries {
            match entry {
                RecoveredEntry::Batch { events } => {
                    let Some(first) = events.first() else { continue };
                    let stream_id = first.stream_id.clone();
                    let slot = index.get_or_create(&stream_id)?;
                    let mut state = slot.lock()?;
                    let base = state.next_event_number();
                    for (offset, event) in events.iter().enumerate() {
                        if event.stream_id != stream_id {
                            return Err(StoreError::storage(
                                "journal inconsistent: one batch spans several streams",
                            ));
                        }
                        if event.event_number != base + offset as u64 {
                            return Err(StoreError::Storage(format!(
                                "journal inconsistent: stream '{stream_id}' jumps from event {} to {}",
                                base + offset as u64,
                                event.event_number
                            )));
                        }
                        next_global = next_global.max(event.global_position + 1);
                    }
                    state.commit(events);
                    batches += 1;
                }
                RecoveredEntry::Marker {
                    stream_id,
                    metadata,
                } => {
                    let slot = index.get_or_create(&stream_id)?;
                    slot.lock()?.set_metadata(metadata);
                    marker_writes += 1;
                }
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(StoreError::storage)?;
        if keep_len < contents.len() as u64 {
            file.set_len(keep_len).map_err(StoreError::storage)?;
            file.sync_all().map_err(StoreError::storage)?;
        }
        file.seek(SeekFrom::End(0)).map_err(StoreError::storage)?;

        info!(
            path = %path.display(),
            batches,
            markers = marker_writes,
            next_global,
            "event journal opened"
        );

        Ok(Self {
            index,
            seq: GlobalSequencer::starting_at(next_global),
            truncation_stamp: AtomicU64::new(marker_writes),
            journal: Mutex::new(Journal {
                file,
                committed_len: keep_len,
                wedged: false,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn index(&self) -> &StreamIndex {
        &self.index
    }

    pub(crate) fn sequencer(&self) -> &GlobalSequencer {
        &self.seq
    }

    fn write_journal(&self, entry: &JournalEntry<'_>) -> StoreResult<()> {
        let mut buf = serde_json::to_vec(entry).map_err(StoreError::storage)?;
        buf.push(b'\n');
        let mut journal = self
            .journal
            .lock()
            .map_err(|_| StoreError::storage("journal lock poisoned"))?;
        journal.write_entry(&buf)
    }
}

impl EventLog for FileEventLog {
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> StoreResult<AppendReceipt> {
        let slot = self.index.get_or_create(stream_id)?;
        let mut state = slot.lock()?;
        match index::plan_append(&state, stream_id, expected, events)? {
            AppendPlan::AlreadyCommitted {
                current_version,
                deduplicated,
            } => Ok(AppendReceipt {
                stream_id: stream_id.clone(),
                new_version: current_version,
                last_global_position: None,
                appended: 0,
                deduplicated,
            }),
            AppendPlan::Commit(prepared) => {
                let deduplicated = prepared.deduplicated;
                if prepared.fresh.is_empty() {
                    return Ok(AppendReceipt {
                        stream_id: stream_id.clone(),
                        new_version: state.current_version(),
                        last_global_position: None,
                        appended: 0,
                        deduplicated,
                    });
                }
                let reservation = self.seq.reserve(prepared.fresh.len() as u64);
                let records = index::build_records(
                    stream_id,
                    prepared.fresh,
                    prepared.first_event_number,
                    &reservation,
                );
                // Durability first. A failed write abandons the reserved
                // positions, which is where the permanent holes in the
                // global sequence come from.
                if let Err(e) = self.write_journal(&JournalEntry::Batch { events: &records }) {
                    self.seq.release(reservation);
                    return Err(e);
                }
                let receipt = AppendReceipt {
                    stream_id: stream_id.clone(),
                    new_version: records.last().map(|r| r.event_number),
                    last_global_position: records.last().map(|r| r.global_position),
                    appended: records.len(),
                    deduplicated,
                };
                state.commit(records);
                self.seq.release(reservation);
                Ok(receipt)
            }
        }
    }

    fn read(
        &self,
        stream_id: &StreamId,
        from_event_number: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>> {
        match self.index.get(stream_id)? {
            None => Ok(Vec::new()),
            Some(slot) => {
                let state = slot.lock()?;
                Ok(state.read_page(from_event_number, max_count))
            }
        }
    }

    fn read_merged(
        &self,
        selector: &SourceSelector,
        from_global_position: u64,
        max_count: usize,
    ) -> StoreResult<Vec<RecordedEvent>> {
        index::read_merged(&self.index, &self.seq, selector, from_global_position, max_count)
    }

    fn current_version(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        match self.index.get(stream_id)? {
            None => Ok(None),
            Some(slot) => Ok(slot.lock()?.current_version()),
        }
    }

    fn stream_metadata(&self, stream_id: &StreamId) -> StoreResult<StreamMetadata> {
        let slot = self
            .index
            .get(stream_id)?
            .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))?;
        let state = slot.lock()?;
        if !state.exists() {
            return Err(StoreError::StreamNotFound(stream_id.clone()));
        }
        Ok(state.metadata())
    }

    fn set_truncate_before(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        truncate_before: u64,
    ) -> StoreResult<u64> {
        let slot = self
            .index
            .get(stream_id)?
            .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))?;
        let mut state = slot.lock()?;
        if !state.exists() {
            return Err(StoreError::StreamNotFound(stream_id.clone()));
        }
        let metadata = state.metadata();
        truncation::check_marker_move(stream_id, &metadata, expected, truncate_before)?;
        let updated = truncation::apply_marker_move(metadata, truncate_before);
        self.write_journal(&JournalEntry::Marker {
            stream_id,
            metadata: updated,
        })?;
        state.set_metadata(updated);
        self.truncation_stamp.fetch_add(1, Ordering::SeqCst);
        Ok(updated.metadata_version)
    }

    fn stream_names(&self) -> StoreResult<Vec<StreamId>> {
        self.index.names()
    }

    fn horizon(&self) -> u64 {
        self.seq.horizon()
    }

    fn truncation_stamp(&self) -> u64 {
        self.truncation_stamp.load(Ordering::SeqCst)
    }
}

/// Split the journal into parsed entries plus the byte length worth keeping.
fn parse_journal(contents: &[u8]) -> StoreResult<(Vec<RecoveredEntry>, u64)> {
    let mut entries = Vec::new();
    let mut keep_len = 0usize;
    let mut cursor = 0usize;
    while cursor < contents.len() {
        let Some(newline) = contents[cursor..].iter().position(|b| *b == b'\n') else {
            warn!(
                bytes = contents.len() - cursor,
                "dropping unterminated journal tail"
            );
            break;
        };
        let line = &contents[cursor..cursor + newline];
        let line_end = cursor + newline + 1;
        match serde_json::from_slice::<RecoveredEntry>(line) {
            Ok(entry) => {
                entries.push(entry);
                keep_len = line_end;
                cursor = line_end;
            }
            Err(parse_err) => {
                if contents[line_end..].contains(&b'\n') {
                    return Err(StoreError::Storage(format!(
                        "journal corrupted at byte {cursor}: {parse_err}"
                    )));
                }
                warn!(
                    at = cursor,
                    error = %parse_err,
                    "dropping torn journal tail"
                );
                break;
            }
        }
    }
    Ok((entries, keep_len as u64))
}
