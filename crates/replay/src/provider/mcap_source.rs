//! Leaf reader over an MCAP file.
//!
//! The file is memory-mapped and indexed once during `initialize`. When the
//! summary section carries chunk and message indexes the index is built from
//! them without decompressing anything; otherwise the records are walked one
//! frame at a time. Either way the index only holds where each payload lives:
//! a byte range in the file, or a position inside a chunk. `get_messages`
//! binary-searches the index and decodes only the slice it returns.
//!
//! A record that fails to parse, or a message on a channel nobody declared,
//! is skipped with a warning. Reading only stops early when a record's length
//! runs past the end of the file.

use async_trait::async_trait;
use memmap2::Mmap;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};

use mcap::records::{op, ChunkHeader, Record};

use super::{DataProvider, MCAP_PROVIDER};
use crate::error::{ReplayError, Result};
use crate::schema::MessageDefinition;
use crate::time::{Time, TimeRange};
use crate::types::{
    ExtensionPoint, InitializationResult, LogRecord, MessageEvent, PayloadFormat, Subscription,
    Topic,
};

/// Opcode byte plus little-endian body length.
const RECORD_PREFIX_LEN: usize = 9;
/// Channel id, sequence, log time and publish time ahead of a message payload.
const MESSAGE_HEADER_LEN: usize = 2 + 4 + 8 + 8;

#[derive(Debug, Deserialize)]
pub(crate) struct McapArgs {
    pub path: PathBuf,
}

/// Where a message payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Payload bytes of an unchunked message.
    File { offset: usize, len: usize },
    /// Position among the message records of a chunk.
    Chunk { chunk: usize, ordinal: usize },
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    receive_time: Time,
    channel_id: u16,
    location: Location,
}

struct McapIndex {
    mmap: Mmap,
    /// Channel id to position in `topics`.
    channels: HashMap<u16, usize>,
    topics: Vec<Topic>,
    entries: Vec<IndexEntry>,
    /// Body of every chunk record, by chunk number.
    chunks: Vec<Range<usize>>,
}

impl McapIndex {
    /// Index positions of the first and one-past-last entries inside `range`.
    fn bounds(&self, range: &TimeRange) -> (usize, usize) {
        let first = self
            .entries
            .partition_point(|e| e.receive_time < range.start);
        let last = self
            .entries
            .partition_point(|e| e.receive_time <= range.end);
        (first, last.max(first))
    }

    /// Payloads of every message record in `chunk`, in record order.
    ///
    /// A chunk that stops decoding part way yields what came before the
    /// damage.
    fn chunk_messages(&self, chunk: usize) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let Some(body) = self
            .chunks
            .get(chunk)
            .and_then(|r| self.mmap.get(r.clone()))
        else {
            return messages;
        };
        let (header, data) = match mcap::parse_record(op::CHUNK, body) {
            Ok(Record::Chunk { header, data }) => (header, data),
            Ok(_) => return messages,
            Err(e) => {
                log::warn!("Chunk {} is unreadable: {}", chunk, e);
                return messages;
            }
        };
        let reader = match mcap::read::ChunkReader::new(header, &data) {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!("Chunk {} is unreadable: {}", chunk, e);
                return messages;
            }
        };
        for record in reader {
            match record {
                Ok(Record::Message { data, .. }) => messages.push(data.into_owned()),
                Ok(_) => {}
                Err(e) => {
                    log::warn!(
                        "Chunk {} is damaged after {} messages: {}",
                        chunk,
                        messages.len(),
                        e
                    );
                    break;
                }
            }
        }
        messages
    }

    /// Copy one entry's payload out of the file, decoding its chunk at most
    /// once per `decoded` map.
    fn record(
        &self,
        entry: &IndexEntry,
        decoded: &mut HashMap<usize, Vec<Vec<u8>>>,
    ) -> Option<LogRecord> {
        let data = match entry.location {
            Location::File { offset, len } => self.mmap.get(offset..offset + len)?.to_vec(),
            Location::Chunk { chunk, ordinal } => {
                let messages = decoded
                    .entry(chunk)
                    .or_insert_with(|| self.chunk_messages(chunk));
                std::mem::take(messages.get_mut(ordinal)?)
            }
        };
        Some(LogRecord {
            channel_id: entry.channel_id,
            receive_time: entry.receive_time,
            data,
        })
    }
}

/// Opcode and body of the record starting at `pos`, if its frame fits
/// before `end`.
fn frame_at(buf: &[u8], pos: usize, end: usize) -> Option<(u8, &[u8])> {
    let prefix = buf.get(pos..pos.checked_add(RECORD_PREFIX_LEN)?)?;
    let len = u64::from_le_bytes(prefix[1..].try_into().ok()?);
    let body_start = pos + RECORD_PREFIX_LEN;
    let body_end = body_start.checked_add(usize::try_from(len).ok()?)?;
    if body_end > end {
        return None;
    }
    Some((prefix[0], &buf[body_start..body_end]))
}

struct SchemaRecord {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

struct ChannelRecord {
    topic: String,
    schema_id: u16,
    message_encoding: String,
}

/// Accumulates schemas, channels and message locations while a file is read.
struct IndexBuilder<'a> {
    path: &'a Path,
    ext: &'a ExtensionPoint,
    schemas: HashMap<u16, SchemaRecord>,
    channel_records: HashMap<u16, ChannelRecord>,
    channels: HashMap<u16, usize>,
    topic_positions: HashMap<String, usize>,
    topics: Vec<Topic>,
    datatypes: BTreeMap<String, MessageDefinition>,
    entries: Vec<IndexEntry>,
    chunks: Vec<Range<usize>>,
    skipped: usize,
}

impl<'a> IndexBuilder<'a> {
    fn new(path: &'a Path, ext: &'a ExtensionPoint) -> Self {
        Self {
            path,
            ext,
            schemas: HashMap::new(),
            channel_records: HashMap::new(),
            channels: HashMap::new(),
            topic_positions: HashMap::new(),
            topics: Vec::new(),
            datatypes: BTreeMap::new(),
            entries: Vec::new(),
            chunks: Vec::new(),
            skipped: 0,
        }
    }

    fn skip(&mut self, reason: String) {
        self.skipped += 1;
        log::warn!("{}: skipping record: {}", self.path.display(), reason);
        self.ext
            .warn(MCAP_PROVIDER, None, format!("malformed record skipped: {reason}"));
    }

    fn add_schema(&mut self, id: u16, name: &str, encoding: &str, data: &[u8]) {
        self.schemas.entry(id).or_insert_with(|| SchemaRecord {
            name: name.to_string(),
            encoding: encoding.to_string(),
            data: data.to_vec(),
        });
    }

    fn add_channel(&mut self, id: u16, topic: &str, schema_id: u16, message_encoding: &str) {
        self.channel_records.entry(id).or_insert_with(|| ChannelRecord {
            topic: topic.to_string(),
            schema_id,
            message_encoding: message_encoding.to_string(),
        });
    }

    /// Datatype name for `schema_id`, registering its definition on first use.
    fn datatype(&mut self, schema_id: u16) -> String {
        if schema_id == 0 {
            return String::new();
        }
        let Some(schema) = self.schemas.get(&schema_id) else {
            log::warn!(
                "{}: schema {} is never declared",
                self.path.display(),
                schema_id
            );
            return String::new();
        };
        if !self.datatypes.contains_key(&schema.name) {
            let definition =
                MessageDefinition::from_schema(&schema.name, &schema.encoding, &schema.data)
                    .unwrap_or_else(|e| {
                        log::warn!("Schema '{}' is unreadable: {}", schema.name, e);
                        MessageDefinition::unresolved(&schema.name, &schema.encoding, &schema.data)
                    });
            self.datatypes.insert(schema.name.clone(), definition);
        }
        schema.name.clone()
    }

    /// Topic position for `channel_id`, registering the topic on its first
    /// message.
    fn topic_position(&mut self, channel_id: u16) -> Option<usize> {
        if let Some(position) = self.channels.get(&channel_id) {
            return Some(*position);
        }
        let channel = self.channel_records.get(&channel_id)?;
        let (topic, schema_id, message_encoding) = (
            channel.topic.clone(),
            channel.schema_id,
            channel.message_encoding.clone(),
        );
        let position = match self.topic_positions.get(&topic) {
            Some(position) => *position,
            None => {
                let datatype = self.datatype(schema_id);
                self.topics.push(Topic {
                    name: topic.clone(),
                    datatype,
                    channel_id,
                    message_encoding,
                });
                self.topic_positions.insert(topic, self.topics.len() - 1);
                self.topics.len() - 1
            }
        };
        self.channels.insert(channel_id, position);
        Some(position)
    }

    fn add_message(&mut self, channel_id: u16, log_time: u64, location: Location) {
        if self.topic_position(channel_id).is_none() {
            self.skip(format!(
                "message at {} on unknown channel {}",
                Time::from_nanos(log_time),
                channel_id
            ));
            return;
        }
        self.entries.push(IndexEntry {
            receive_time: Time::from_nanos(log_time),
            channel_id,
            location,
        });
    }

    /// Build the index from the summary section's chunk and message indexes.
    ///
    /// Returns `false`, having changed nothing, when the file has no usable
    /// summary; the caller then walks the records instead.
    fn read_summary(&mut self, buf: &[u8]) -> bool {
        let summary = match mcap::Summary::read(buf) {
            Ok(Some(summary)) => summary,
            Ok(None) => return false,
            Err(e) => {
                log::debug!("{}: summary unusable: {}", self.path.display(), e);
                return false;
            }
        };
        // Chunks without messages have no message indexes; a file with none
        // at all was written without them.
        if summary
            .chunk_indexes
            .iter()
            .all(|chunk| chunk.message_index_offsets.is_empty())
        {
            return false;
        }

        let mut chunks = Vec::with_capacity(summary.chunk_indexes.len());
        let mut messages = Vec::new();
        for (chunk, index) in summary.chunk_indexes.iter().enumerate() {
            let body = usize::try_from(index.chunk_start_offset)
                .ok()
                .zip(usize::try_from(index.chunk_length).ok())
                .and_then(|(start, len)| {
                    Some(start.checked_add(RECORD_PREFIX_LEN)?..start.checked_add(len)?)
                })
                .filter(|body| body.start <= body.end && body.end <= buf.len());
            let Some(body) = body else {
                log::debug!(
                    "{}: chunk index {} points outside the file",
                    self.path.display(),
                    chunk
                );
                return false;
            };
            chunks.push(body);
            if index.message_index_offsets.is_empty() {
                continue;
            }

            let indexes = match summary.read_message_indexes(buf, index) {
                Ok(indexes) => indexes,
                Err(e) => {
                    log::debug!(
                        "{}: message index of chunk {} unusable: {}",
                        self.path.display(),
                        chunk,
                        e
                    );
                    return false;
                }
            };
            let mut in_chunk: Vec<(u64, u64, u16)> = indexes
                .iter()
                .flat_map(|(channel, entries)| {
                    entries
                        .iter()
                        .map(move |e| (e.offset, e.log_time, channel.id))
                })
                .collect();
            // Offset order is record order, so rank gives the message ordinal.
            in_chunk.sort_unstable_by_key(|(offset, _, _)| *offset);
            messages.extend(
                in_chunk
                    .into_iter()
                    .enumerate()
                    .map(|(ordinal, (_, log_time, channel_id))| {
                        (chunk, ordinal, log_time, channel_id)
                    }),
            );
        }

        for schema in summary.schemas.values() {
            self.add_schema(schema.id, &schema.name, &schema.encoding, &schema.data);
        }
        for channel in summary.channels.values() {
            let schema_id = channel.schema.as_ref().map_or(0, |s| s.id);
            self.add_channel(channel.id, &channel.topic, schema_id, &channel.message_encoding);
        }
        for (chunk, ordinal, log_time, channel_id) in messages {
            self.add_message(channel_id, log_time, Location::Chunk { chunk, ordinal });
        }
        self.chunks = chunks;
        true
    }

    /// Walk every record frame between the magic bytes.
    fn scan_records(&mut self, buf: &[u8]) {
        let end = if buf.len() >= 2 * mcap::MAGIC.len() && buf.ends_with(mcap::MAGIC) {
            buf.len() - mcap::MAGIC.len()
        } else {
            self.ext.warn(
                MCAP_PROVIDER,
                None,
                format!("{} is truncated; reading up to the damage", self.path.display()),
            );
            buf.len()
        };

        let mut pos = mcap::MAGIC.len();
        while pos < end {
            let Some((opcode, body)) = frame_at(buf, pos, end) else {
                log::warn!(
                    "{}: record at byte {} runs past the end of the file",
                    self.path.display(),
                    pos
                );
                self.ext.warn(
                    MCAP_PROVIDER,
                    None,
                    format!("log truncated at byte {pos}: record length exceeds the file"),
                );
                break;
            };
            let body_start = pos + RECORD_PREFIX_LEN;
            let body_end = body_start + body.len();
            pos = body_end;

            match mcap::parse_record(opcode, body) {
                Ok(Record::Schema { header, data }) => {
                    self.add_schema(header.id, &header.name, &header.encoding, &data)
                }
                Ok(Record::Channel(channel)) => self.add_channel(
                    channel.id,
                    &channel.topic,
                    channel.schema_id,
                    &channel.message_encoding,
                ),
                Ok(Record::Message { header, data }) => self.add_message(
                    header.channel_id,
                    header.log_time,
                    Location::File {
                        offset: body_start + MESSAGE_HEADER_LEN,
                        len: data.len(),
                    },
                ),
                Ok(Record::Chunk { header, data }) => {
                    self.scan_chunk(header, &data, body_start..body_end)
                }
                Ok(Record::DataEnd(_)) | Ok(Record::Footer(_)) => break,
                Ok(_) => {}
                Err(e) => self.skip(format!(
                    "record at byte {} (opcode {:#04x}): {}",
                    body_start - RECORD_PREFIX_LEN,
                    opcode,
                    e
                )),
            }
        }
    }

    fn scan_chunk(&mut self, header: ChunkHeader, data: &[u8], body: Range<usize>) {
        let chunk = self.chunks.len();
        let start = body.start - RECORD_PREFIX_LEN;
        self.chunks.push(body);
        let reader = match mcap::read::ChunkReader::new(header, data) {
            Ok(reader) => reader,
            Err(e) => {
                self.skip(format!("chunk at byte {start}: {e}"));
                return;
            }
        };

        let mut ordinal = 0;
        for record in reader {
            match record {
                Ok(Record::Schema { header, data }) => {
                    self.add_schema(header.id, &header.name, &header.encoding, &data)
                }
                Ok(Record::Channel(channel)) => self.add_channel(
                    channel.id,
                    &channel.topic,
                    channel.schema_id,
                    &channel.message_encoding,
                ),
                Ok(Record::Message { header, .. }) => {
                    self.add_message(
                        header.channel_id,
                        header.log_time,
                        Location::Chunk { chunk, ordinal },
                    );
                    ordinal += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    self.skip(format!("chunk at byte {start} after {ordinal} messages: {e}"));
                    break;
                }
            }
        }
    }

    fn finish(mut self, mmap: Mmap) -> (McapIndex, BTreeMap<String, MessageDefinition>) {
        self.entries.sort_by_key(|e| (e.receive_time, e.channel_id));
        if self.skipped > 0 {
            log::warn!(
                "{}: skipped {} malformed records",
                self.path.display(),
                self.skipped
            );
        }
        let index = McapIndex {
            mmap,
            channels: self.channels,
            topics: self.topics,
            entries: self.entries,
            chunks: self.chunks,
        };
        (index, self.datatypes)
    }
}

/// Leaf provider reading one MCAP file.
pub struct McapSource {
    path: PathBuf,
    index: Option<McapIndex>,
    closed: bool,
}

impl McapSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            index: None,
            closed: false,
        }
    }

    fn build_index(
        &self,
        ext: &ExtensionPoint,
    ) -> Result<(McapIndex, BTreeMap<String, MessageDefinition>)> {
        let file = std::fs::File::open(&self.path)?;
        // SAFETY: the mapping is read-only and lives as long as the index.
        // Recordings are not rewritten while they are played back.
        let mmap = unsafe { Mmap::map(&file)? };
        if !mmap.starts_with(mcap::MAGIC) {
            return Err(ReplayError::Mcap(mcap::McapError::BadMagic));
        }

        let mut builder = IndexBuilder::new(&self.path, ext);
        if builder.read_summary(&mmap) {
            log::debug!("{}: indexed from summary", self.path.display());
        } else {
            builder.scan_records(&mmap);
        }
        Ok(builder.finish(mmap))
    }
}

#[async_trait]
impl DataProvider for McapSource {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        let (index, datatypes) = self.build_index(&ext)?;

        let time_range = match (index.entries.first(), index.entries.last()) {
            (Some(first), Some(last)) => TimeRange {
                start: first.receive_time,
                end: last.receive_time,
            },
            _ => {
                ext.warn(MCAP_PROVIDER, None, "log contains no messages");
                TimeRange::instant(Time::ZERO)
            }
        };

        log::info!(
            "Indexed {}: {} topics, {} messages, {} chunks, {}",
            self.path.display(),
            index.topics.len(),
            index.entries.len(),
            index.chunks.len(),
            time_range
        );
        ext.progress(1.0);

        let topics = index.topics.clone();
        self.index = Some(index);
        Ok(InitializationResult {
            topics,
            datatypes,
            time_range,
        })
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        if self.closed {
            return Err(ReplayError::Closed);
        }
        let index = self
            .index
            .as_ref()
            .ok_or(ReplayError::NotInitialized(MCAP_PROVIDER))?;

        let wanted: Vec<usize> = index
            .topics
            .iter()
            .enumerate()
            .filter(|(_, topic)| {
                subscriptions
                    .iter()
                    .any(|s| s.format == PayloadFormat::Raw && s.topic == topic.name)
            })
            .map(|(position, _)| position)
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let (first, last) = index.bounds(&range);
        let mut decoded = HashMap::new();
        let mut events = Vec::new();
        for entry in &index.entries[first..last] {
            let Some(position) = index.channels.get(&entry.channel_id).copied() else {
                continue;
            };
            if !wanted.contains(&position) {
                continue;
            }
            let Some(record) = index.record(entry, &mut decoded) else {
                continue;
            };
            events.push(MessageEvent::raw(
                index.topics[position].name.clone(),
                record.receive_time,
                record.channel_id,
                record.data,
            ));
        }

        log::debug!(
            "{}: {} events in {} ({} chunks decoded)",
            self.path.display(),
            events.len(),
            range,
            decoded.len()
        );
        Ok(events)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            log::debug!("Closing {}", self.path.display());
        }
        self.closed = true;
        self.index = None;
        Ok(())
    }
}
