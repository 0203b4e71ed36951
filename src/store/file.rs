//! On-disk store: a directory of checksummed files
//!
//! ```text
//! <store>/manifest.json     parameters the store was built with
//! <store>/pairs.bin         header, then one batch per committed origin
//! <store>/pairs.low.idx     sorted keys of low-stress connected rows
//! <store>/pairs.high.idx    sorted keys of high-stress connected rows
//! ```
//!
//! `pairs.bin` header (24 bytes): magic `BCPR`, version u16, reserved u16,
//! created_unix u64, CRC-64 of the preceding 16 bytes.
//!
//! Batch: magic `BATC`, origin i64, scenario flag u8, subtract u8, reserved
//! u16, scenario_id i64, n_pairs u32, CRC-64 of those 28 header bytes, then
//! `n_pairs × (target i64, code u8)` and a CRC-64 over the whole batch.
//! Batches are only ever appended; a crash mid-append leaves a torn last
//! batch that is cut off on the next open. A batch whose header checksum
//! fails is corruption, never a torn tail.
//!
//! Index files carry the length and trailing CRC-64 of the `pairs.bin` they
//! were built from, so any later commit or delete makes them stale. Entries
//! are fixed-size and sorted, and `targets` binary-searches them on disk.

use crc::{Crc, CRC_64_GO_ISO};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    scenario_label, ConnectivityStore, IndexStats, OriginBatch, PairRecord, ScenarioSelector,
    ScenarioTag, StoreError, StoreManifest, StressFilter, FORMAT_VERSION,
};
use crate::blocks::BlockId;
use crate::evaluate::Connectivity;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

const PAIRS_MAGIC: u32 = 0x4243_5052; // "BCPR"
const BATCH_MAGIC: u32 = 0x4241_5443; // "BATC"
const INDEX_MAGIC: u32 = 0x4243_4958; // "BCIX"

const HEADER_LEN: usize = 24;
const BATCH_FIELDS_LEN: usize = 28;
const BATCH_HEADER_LEN: usize = BATCH_FIELDS_LEN + CRC_LEN;
const ROW_LEN: usize = 9;
const INDEX_HEADER_LEN: usize = 32;
const INDEX_ENTRY_LEN: usize = 26;
const CRC_LEN: usize = 8;

const MANIFEST_FILE: &str = "manifest.json";
const PAIRS_FILE: &str = "pairs.bin";
const LOW_INDEX_FILE: &str = "pairs.low.idx";
const HIGH_INDEX_FILE: &str = "pairs.high.idx";

type BatchKey = (Option<ScenarioTag>, BlockId);
type RowKey = (Option<ScenarioTag>, BlockId, BlockId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatchMeta {
    offset: u64,
    len: u64,
    n_pairs: u32,
}

/// Result of walking `pairs.bin`
#[derive(Debug)]
struct Scan {
    batches: Vec<(BatchKey, BatchMeta)>,
    valid_len: u64,
    torn_bytes: u64,
}

/// Outcome of a full checksum pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub batches: usize,
    pub pairs: usize,
    pub bytes: u64,
    pub indexes_valid: bool,
}

fn le_bytes<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

fn encode_scenario(scenario: Option<ScenarioTag>) -> (u8, u8, i64) {
    match scenario {
        Some(tag) => (1, tag.subtract as u8, tag.scenario_id),
        None => (0, 0, 0),
    }
}

fn decode_scenario(flag: u8, subtract: u8, id: i64) -> Option<Option<ScenarioTag>> {
    match (flag, subtract) {
        (0, 0) => Some(None),
        (1, 0 | 1) => Some(Some(ScenarioTag {
            scenario_id: id,
            subtract: subtract == 1,
        })),
        _ => None,
    }
}

fn encode_header(created_unix: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&PAIRS_MAGIC.to_le_bytes());
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&created_unix.to_le_bytes());
    let crc = CRC64.checksum(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn encode_batch(batch: &OriginBatch) -> Result<Vec<u8>, StoreError> {
    let n_pairs = u32::try_from(batch.pairs.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("origin {} has too many pairs for one batch", batch.origin),
        )
    })?;
    let mut buf =
        Vec::with_capacity(BATCH_HEADER_LEN + batch.pairs.len() * ROW_LEN + CRC_LEN);

    let (flag, subtract, scenario_id) = encode_scenario(batch.scenario);
    buf.extend_from_slice(&BATCH_MAGIC.to_le_bytes());
    buf.extend_from_slice(&batch.origin.to_le_bytes());
    buf.push(flag);
    buf.push(subtract);
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&scenario_id.to_le_bytes());
    buf.extend_from_slice(&n_pairs.to_le_bytes());
    let header_crc = CRC64.checksum(&buf);
    buf.extend_from_slice(&header_crc.to_le_bytes());

    for &(target, connectivity) in &batch.pairs {
        buf.extend_from_slice(&target.to_le_bytes());
        buf.push(connectivity.code());
    }

    let crc = CRC64.checksum(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Rows of one checksummed batch (`bytes` is exactly the batch)
fn decode_rows(bytes: &[u8]) -> Result<Vec<(BlockId, Connectivity)>, StoreError> {
    let n_pairs = u32::from_le_bytes(le_bytes(bytes, 24)) as usize;
    let mut rows = Vec::with_capacity(n_pairs);
    for i in 0..n_pairs {
        let at = BATCH_HEADER_LEN + i * ROW_LEN;
        let target = i64::from_le_bytes(le_bytes(bytes, at));
        let code = bytes[at + 8];
        let connectivity = Connectivity::from_code(code).ok_or(StoreError::InvalidCode(code))?;
        rows.push((target, connectivity));
    }
    Ok(rows)
}

fn scan(path: &Path, bytes: &[u8]) -> Result<Scan, StoreError> {
    let corrupt = |offset: usize, reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt(0, "truncated header"));
    }
    if u32::from_le_bytes(le_bytes(bytes, 0)) != PAIRS_MAGIC {
        return Err(corrupt(0, "bad magic"));
    }
    if u16::from_le_bytes(le_bytes(bytes, 4)) != FORMAT_VERSION {
        return Err(corrupt(4, "unsupported version"));
    }
    if u64::from_le_bytes(le_bytes(bytes, 16)) != CRC64.checksum(&bytes[..16]) {
        return Err(corrupt(16, "header checksum mismatch"));
    }

    let mut batches = Vec::new();
    let mut pos = HEADER_LEN;

    while pos < bytes.len() {
        let remaining = bytes.len() - pos;
        if remaining < BATCH_HEADER_LEN {
            // Header never fully landed
            break;
        }
        if u32::from_le_bytes(le_bytes(bytes, pos)) != BATCH_MAGIC {
            return Err(corrupt(pos, "bad batch magic"));
        }
        let header_end = pos + BATCH_FIELDS_LEN;
        if u64::from_le_bytes(le_bytes(bytes, header_end))
            != CRC64.checksum(&bytes[pos..header_end])
        {
            return Err(corrupt(pos, "batch header checksum mismatch"));
        }
        let n_pairs = u32::from_le_bytes(le_bytes(bytes, pos + 24));
        let total = BATCH_HEADER_LEN + n_pairs as usize * ROW_LEN + CRC_LEN;
        if total > remaining {
            // Verified header, body cut short
            break;
        }

        let body_end = pos + total - CRC_LEN;
        let stored = u64::from_le_bytes(le_bytes(bytes, body_end));
        if stored != CRC64.checksum(&bytes[pos..body_end]) {
            if pos + total == bytes.len() {
                // Last batch: a write that never completed
                break;
            }
            return Err(corrupt(pos, "batch checksum mismatch"));
        }

        let origin = i64::from_le_bytes(le_bytes(bytes, pos + 4));
        let scenario = decode_scenario(
            bytes[pos + 12],
            bytes[pos + 13],
            i64::from_le_bytes(le_bytes(bytes, pos + 16)),
        )
        .ok_or_else(|| corrupt(pos + 12, "bad scenario flags"))?;

        batches.push((
            (scenario, origin),
            BatchMeta {
                offset: pos as u64,
                len: total as u64,
                n_pairs,
            },
        ));
        pos += total;
    }

    Ok(Scan {
        batches,
        valid_len: pos as u64,
        torn_bytes: (bytes.len() - pos) as u64,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    Low,
    High,
}

impl IndexKind {
    fn code(self) -> u8 {
        match self {
            IndexKind::Low => 0,
            IndexKind::High => 1,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            IndexKind::Low => LOW_INDEX_FILE,
            IndexKind::High => HIGH_INDEX_FILE,
        }
    }
}

/// Length and trailing checksum of `pairs.bin`
///
/// The last 8 bytes are the CRC of the newest batch (or of the file header),
/// so an append, a compaction or a recreate changes the stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PairsStamp {
    len: u64,
    tail: u64,
}

impl PairsStamp {
    fn of(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len() as u64,
            tail: u64::from_le_bytes(le_bytes(bytes, bytes.len() - CRC_LEN)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexHeader {
    stamp: PairsStamp,
    n_entries: u64,
}

fn index_entry_offset(i: u64) -> u64 {
    INDEX_HEADER_LEN as u64 + i * INDEX_ENTRY_LEN as u64
}

fn encode_index(kind: IndexKind, stamp: PairsStamp, entries: &[RowKey]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INDEX_HEADER_LEN + entries.len() * INDEX_ENTRY_LEN + CRC_LEN);
    buf.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.push(kind.code());
    buf.push(0);
    buf.extend_from_slice(&stamp.len.to_le_bytes());
    buf.extend_from_slice(&stamp.tail.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());

    for &(scenario, source, target) in entries {
        let (flag, subtract, scenario_id) = encode_scenario(scenario);
        buf.push(flag);
        buf.push(subtract);
        buf.extend_from_slice(&scenario_id.to_le_bytes());
        buf.extend_from_slice(&source.to_le_bytes());
        buf.extend_from_slice(&target.to_le_bytes());
    }

    let crc = CRC64.checksum(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Check the fixed header against the index kind and the file's size
fn decode_index_header(
    path: &Path,
    kind: IndexKind,
    header: &[u8],
    file_len: u64,
) -> Result<IndexHeader, StoreError> {
    let corrupt = |offset: u64, reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        offset,
        reason: reason.to_string(),
    };

    if u32::from_le_bytes(le_bytes(header, 0)) != INDEX_MAGIC || header[6] != kind.code() {
        return Err(corrupt(0, "bad index magic"));
    }
    if u16::from_le_bytes(le_bytes(header, 4)) != FORMAT_VERSION {
        return Err(corrupt(4, "unsupported version"));
    }
    let stamp = PairsStamp {
        len: u64::from_le_bytes(le_bytes(header, 8)),
        tail: u64::from_le_bytes(le_bytes(header, 16)),
    };
    let n_entries = u64::from_le_bytes(le_bytes(header, 24));
    let expected = n_entries
        .checked_mul(INDEX_ENTRY_LEN as u64)
        .and_then(|body| body.checked_add((INDEX_HEADER_LEN + CRC_LEN) as u64));
    if expected != Some(file_len) {
        return Err(corrupt(24, "entry count does not match file size"));
    }
    Ok(IndexHeader { stamp, n_entries })
}

fn decode_index_entry(entry: &[u8]) -> Option<RowKey> {
    let scenario = decode_scenario(entry[0], entry[1], i64::from_le_bytes(le_bytes(entry, 2)))?;
    let source = i64::from_le_bytes(le_bytes(entry, 10));
    let target = i64::from_le_bytes(le_bytes(entry, 18));
    Some((scenario, source, target))
}

/// Fully decode an index file, checksum included
fn decode_index(path: &Path, kind: IndexKind, bytes: &[u8]) -> Result<Vec<RowKey>, StoreError> {
    let corrupt = |offset: usize, reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.to_string(),
    };

    if bytes.len() < INDEX_HEADER_LEN + CRC_LEN {
        return Err(corrupt(0, "truncated index"));
    }
    let body_end = bytes.len() - CRC_LEN;
    if u64::from_le_bytes(le_bytes(bytes, body_end)) != CRC64.checksum(&bytes[..body_end]) {
        return Err(corrupt(body_end, "index checksum mismatch"));
    }
    let header = decode_index_header(path, kind, &bytes[..INDEX_HEADER_LEN], bytes.len() as u64)?;

    (0..header.n_entries as usize)
        .map(|i| {
            let at = INDEX_HEADER_LEN + i * INDEX_ENTRY_LEN;
            decode_index_entry(&bytes[at..at + INDEX_ENTRY_LEN])
                .ok_or_else(|| corrupt(at, "bad scenario flags"))
        })
        .collect()
}

/// Random access to the fixed-size entries of one index file
struct IndexCursor {
    path: PathBuf,
    reader: BufReader<File>,
}

impl IndexCursor {
    fn read_at(&mut self, i: u64) -> Result<RowKey, StoreError> {
        self.reader.seek(SeekFrom::Start(index_entry_offset(i)))?;
        self.read_next(i)
    }

    /// Entry `i`, assuming the reader already sits on it
    fn read_next(&mut self, i: u64) -> Result<RowKey, StoreError> {
        let mut entry = [0u8; INDEX_ENTRY_LEN];
        self.reader.read_exact(&mut entry)?;
        decode_index_entry(&entry).ok_or_else(|| StoreError::Corrupt {
            path: self.path.clone(),
            offset: index_entry_offset(i),
            reason: "bad scenario flags".to_string(),
        })
    }
}

/// Write `bytes` to a sibling temp file, sync, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Store rooted at a directory
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    batches: BTreeMap<BatchKey, BatchMeta>,
    pairs_len: u64,
}

impl FileStore {
    /// Open `dir`, recovering from a torn last batch; a missing store is fine
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let mut store = Self {
            dir: dir.as_ref().to_path_buf(),
            batches: BTreeMap::new(),
            pairs_len: 0,
        };
        if store.exists() {
            store.load()?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn pairs_path(&self) -> PathBuf {
        self.dir.join(PAIRS_FILE)
    }

    fn index_path(&self, kind: IndexKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn require(&self) -> Result<(), StoreError> {
        if self.exists() {
            Ok(())
        } else {
            Err(StoreError::Missing(self.dir.clone()))
        }
    }

    fn load(&mut self) -> Result<(), StoreError> {
        let path = self.pairs_path();
        let bytes = fs::read(&path)?;
        let scan = scan(&path, &bytes)?;

        if scan.torn_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                torn_bytes = scan.torn_bytes,
                valid_len = scan.valid_len,
                "truncating incomplete trailing batch"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        self.batches = scan.batches.into_iter().collect();
        self.pairs_len = scan.valid_len;
        tracing::debug!(
            path = %path.display(),
            batches = self.batches.len(),
            bytes = self.pairs_len,
            "opened pair store"
        );
        Ok(())
    }

    fn read_batch(&self, meta: &BatchMeta) -> Result<Vec<(BlockId, Connectivity)>, StoreError> {
        let path = self.pairs_path();
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(meta.offset))?;
        let mut bytes = vec![0u8; meta.len as usize];
        file.read_exact(&mut bytes)?;

        let body_end = bytes.len() - CRC_LEN;
        if u64::from_le_bytes(le_bytes(&bytes, body_end)) != CRC64.checksum(&bytes[..body_end]) {
            return Err(StoreError::Corrupt {
                path,
                offset: meta.offset,
                reason: "batch checksum mismatch".to_string(),
            });
        }
        decode_rows(&bytes)
    }

    /// Stamp of the current `pairs.bin`, from its length and last 8 bytes
    fn pairs_stamp(&self) -> Result<PairsStamp, StoreError> {
        let path = self.pairs_path();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN as u64 {
            return Err(StoreError::Corrupt {
                path,
                offset: 0,
                reason: "truncated header".to_string(),
            });
        }
        file.seek(SeekFrom::Start(len - CRC_LEN as u64))?;
        let mut tail = [0u8; CRC_LEN];
        file.read_exact(&mut tail)?;
        Ok(PairsStamp {
            len,
            tail: u64::from_le_bytes(tail),
        })
    }

    /// Open one index and read only its header; `None` when it was never built
    fn open_index(&self, kind: IndexKind) -> Result<Option<(IndexCursor, IndexHeader)>, StoreError> {
        let path = self.index_path(kind);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header = [0u8; INDEX_HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut header) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(StoreError::Corrupt {
                    path,
                    offset: 0,
                    reason: "truncated index".to_string(),
                });
            }
            return Err(e.into());
        }
        let header = decode_index_header(&path, kind, &header, file_len)?;
        Ok(Some((IndexCursor { path, reader }, header)))
    }

    /// Index `kind`, if it was built from the current `pairs.bin`
    fn fresh_index(
        &self,
        kind: IndexKind,
        stamp: PairsStamp,
    ) -> Result<Option<(IndexCursor, IndexHeader)>, StoreError> {
        Ok(self
            .open_index(kind)?
            .filter(|(_, header)| header.stamp == stamp))
    }

    fn index_checks_out(&self, kind: IndexKind) -> Result<(), StoreError> {
        let path = self.index_path(kind);
        decode_index(&path, kind, &fs::read(&path)?).map(|_| ())
    }

    /// Re-read every batch and check its checksum and codes
    pub fn verify(&self) -> Result<VerifyReport, StoreError> {
        self.require()?;
        let path = self.pairs_path();
        let bytes = fs::read(&path)?;
        let scan = scan(&path, &bytes)?;
        if scan.torn_bytes > 0 {
            return Err(StoreError::Corrupt {
                path,
                offset: scan.valid_len,
                reason: format!("{} trailing bytes after the last batch", scan.torn_bytes),
            });
        }

        let mut pairs = 0;
        for (_, meta) in &scan.batches {
            let start = meta.offset as usize;
            pairs += decode_rows(&bytes[start..start + meta.len as usize])?.len();
        }

        Ok(VerifyReport {
            batches: scan.batches.len(),
            pairs,
            bytes: scan.valid_len,
            indexes_valid: self.indexes_valid()
                && self.index_checks_out(IndexKind::Low).is_ok()
                && self.index_checks_out(IndexKind::High).is_ok(),
        })
    }
}

impl ConnectivityStore for FileStore {
    fn exists(&self) -> bool {
        self.manifest_path().exists()
    }

    fn create(&mut self, overwrite: bool, manifest: StoreManifest) -> Result<(), StoreError> {
        if self.exists() {
            if !overwrite {
                return Err(StoreError::AlreadyExists(self.dir.clone()));
            }
            // Manifest goes first so an interrupted overwrite reads as missing
            remove_if_exists(&self.manifest_path())?;
            remove_if_exists(&self.index_path(IndexKind::Low))?;
            remove_if_exists(&self.index_path(IndexKind::High))?;
            remove_if_exists(&self.pairs_path())?;
        }

        fs::create_dir_all(&self.dir)?;
        let created_unix = manifest.created_at.timestamp().max(0) as u64;
        let header = encode_header(created_unix);
        write_atomic(&self.pairs_path(), &header)?;
        write_atomic(&self.manifest_path(), &serde_json::to_vec_pretty(&manifest)?)?;

        self.batches.clear();
        self.pairs_len = header.len() as u64;
        tracing::info!(dir = %self.dir.display(), "created pair store");
        Ok(())
    }

    fn manifest(&self) -> Result<StoreManifest, StoreError> {
        self.require()?;
        let reader = BufReader::new(File::open(self.manifest_path())?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn drop_indexes(&mut self) -> Result<(), StoreError> {
        self.require()?;
        remove_if_exists(&self.index_path(IndexKind::Low))?;
        remove_if_exists(&self.index_path(IndexKind::High))?;
        Ok(())
    }

    fn build_indexes(&mut self) -> Result<IndexStats, StoreError> {
        self.require()?;
        let bytes = fs::read(self.pairs_path())?;
        let stamp = PairsStamp::of(&bytes);

        let mut low = Vec::new();
        let mut high = Vec::new();
        for (&(scenario, source), meta) in &self.batches {
            let start = meta.offset as usize;
            for (target, connectivity) in decode_rows(&bytes[start..start + meta.len as usize])? {
                if connectivity.low_stress() {
                    low.push((scenario, source, target));
                }
                if connectivity.high_stress() {
                    high.push((scenario, source, target));
                }
            }
        }
        low.sort_unstable();
        high.sort_unstable();

        write_atomic(
            &self.index_path(IndexKind::Low),
            &encode_index(IndexKind::Low, stamp, &low),
        )?;
        write_atomic(
            &self.index_path(IndexKind::High),
            &encode_index(IndexKind::High, stamp, &high),
        )?;

        Ok(IndexStats {
            low_stress_rows: low.len(),
            high_stress_rows: high.len(),
        })
    }

    fn indexes_valid(&self) -> bool {
        if !self.exists() {
            return false;
        }
        let Ok(stamp) = self.pairs_stamp() else {
            return false;
        };
        [IndexKind::Low, IndexKind::High]
            .into_iter()
            .all(|kind| matches!(self.fresh_index(kind, stamp), Ok(Some(_))))
    }

    fn delete_rows(&mut self, selector: ScenarioSelector) -> Result<usize, StoreError> {
        self.require()?;
        let doomed: Vec<(BatchKey, BatchMeta)> = self
            .batches
            .iter()
            .filter(|((scenario, _), _)| selector.matches(*scenario))
            .map(|(&key, &meta)| (key, meta))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let path = self.pairs_path();
        let bytes = fs::read(&path)?;
        let mut kept: Vec<&BatchMeta> = self
            .batches
            .iter()
            .filter(|((scenario, _), _)| !selector.matches(*scenario))
            .map(|(_, meta)| meta)
            .collect();
        kept.sort_by_key(|meta| meta.offset);

        let mut compacted = Vec::with_capacity(bytes.len());
        compacted.extend_from_slice(&bytes[..HEADER_LEN]);
        for meta in kept {
            let start = meta.offset as usize;
            compacted.extend_from_slice(&bytes[start..start + meta.len as usize]);
        }
        write_atomic(&path, &compacted)?;
        self.load()?;

        let deleted = doomed.iter().map(|(_, meta)| meta.n_pairs as usize).sum();
        tracing::info!(
            batches = doomed.len(),
            rows = deleted,
            selector = ?selector,
            "deleted rows"
        );
        Ok(deleted)
    }

    fn commit_origin(&mut self, batch: &OriginBatch) -> Result<usize, StoreError> {
        self.require()?;
        let key = (batch.scenario, batch.origin);
        if self.batches.contains_key(&key) {
            return Err(StoreError::DuplicateOrigin {
                origin: batch.origin,
                scenario: scenario_label(batch.scenario),
            });
        }

        let bytes = encode_batch(batch)?;
        let path = self.pairs_path();
        let mut file = OpenOptions::new().append(true).open(&path)?;
        let start = file.metadata()?.len();
        if start != self.pairs_len {
            // Appending here would misplace every offset recorded from now on
            return Err(StoreError::Corrupt {
                path,
                offset: self.pairs_len,
                reason: format!(
                    "pairs file is {start} bytes, expected {}; reopen the store to recover",
                    self.pairs_len
                ),
            });
        }
        if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_data()) {
            // Roll back whatever part of the batch reached the file
            if let Err(rollback) = file.set_len(start) {
                tracing::error!(
                    path = %path.display(),
                    offset = start,
                    error = %rollback,
                    "could not roll back a failed batch write"
                );
            }
            return Err(e.into());
        }

        self.batches.insert(
            key,
            BatchMeta {
                offset: start,
                len: bytes.len() as u64,
                n_pairs: batch.pairs.len() as u32,
            },
        );
        self.pairs_len += bytes.len() as u64;
        Ok(batch.pairs.len())
    }

    fn has_rows(&self, selector: ScenarioSelector) -> Result<bool, StoreError> {
        self.require()?;
        Ok(self
            .batches
            .iter()
            .any(|((scenario, _), meta)| selector.matches(*scenario) && meta.n_pairs > 0))
    }

    fn lookup(
        &self,
        source: BlockId,
        target: BlockId,
        scenario: Option<ScenarioTag>,
    ) -> Result<Option<Connectivity>, StoreError> {
        self.require()?;
        let Some(meta) = self.batches.get(&(scenario, source)) else {
            return Ok(None);
        };
        Ok(self
            .read_batch(meta)?
            .into_iter()
            .find(|&(t, _)| t == target)
            .map(|(_, connectivity)| connectivity))
    }

    fn targets(
        &self,
        source: BlockId,
        level: StressFilter,
        scenario: Option<ScenarioTag>,
    ) -> Result<Vec<BlockId>, StoreError> {
        self.require()?;
        let kind = match level {
            StressFilter::LowStress => IndexKind::Low,
            StressFilter::HighStress => IndexKind::High,
        };
        let (mut cursor, header) = self
            .fresh_index(kind, self.pairs_stamp()?)?
            .ok_or(StoreError::IndexUnavailable)?;

        // First entry not below (scenario, source, MIN)
        let lower = (scenario, source, BlockId::MIN);
        let (mut lo, mut hi) = (0, header.n_entries);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cursor.read_at(mid)? < lower {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut targets = Vec::new();
        if lo < header.n_entries {
            cursor.reader.seek(SeekFrom::Start(index_entry_offset(lo)))?;
        }
        for i in lo..header.n_entries {
            let (s, src, target) = cursor.read_next(i)?;
            if s != scenario || src != source {
                break;
            }
            targets.push(target);
        }
        Ok(targets)
    }

    fn rows(&self) -> Result<Vec<PairRecord>, StoreError> {
        self.require()?;
        let bytes = fs::read(self.pairs_path())?;
        let mut rows = Vec::new();
        for (&(scenario, source), meta) in &self.batches {
            let start = meta.offset as usize;
            for (target, connectivity) in decode_rows(&bytes[start..start + meta.len as usize])? {
                rows.push(PairRecord {
                    scenario,
                    source,
                    target,
                    connectivity,
                });
            }
        }
        rows.sort_unstable();
        Ok(rows)
    }
}
