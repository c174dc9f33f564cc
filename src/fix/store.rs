// =============================================================================
// FIX Session Store — persistent sequence numbers + append-only message log
// =============================================================================
//
// Layout under `<base>/<session_id>/`:
//   header.json   — {in_seq, out_seq, last_logon}, saved with tmp + rename
//                   and fsync'd before the rename
//   messages.log  — framed records: direction u8, seq u64 LE, len u32 LE,
//                   payload bytes
//
// Critical outbound messages (NewOrderSingle, cancel/replace) are fsync'd
// before the session acknowledges the send; everything else is appended
// without the flush. All access is serialized behind one per-session mutex.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::now_ms;

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_u8(self) -> u8 {
        match self {
            Self::Inbound => 0,
            Self::Outbound => 1,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Inbound),
            1 => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreHeader {
    in_seq: u64,
    out_seq: u64,
    last_logon: i64,
}

struct StoreInner {
    header: StoreHeader,
    log: File,
}

/// Per-session persistent store. One instance per FIX session.
pub struct SessionStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    /// Open (or create) the store for `session_id` under `base`.
    pub fn open(base: &Path, session_id: &str) -> Result<Self> {
        let dir = base.join(session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store dir {}", dir.display()))?;

        let header_path = dir.join("header.json");
        let header = match std::fs::read_to_string(&header_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(session = %session_id, error = %e, "corrupt store header — starting fresh");
                StoreHeader::default()
            }),
            Err(_) => StoreHeader::default(),
        };

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(dir.join("messages.log"))
            .with_context(|| format!("failed to open message log in {}", dir.display()))?;

        info!(
            session = %session_id,
            in_seq = header.in_seq,
            out_seq = header.out_seq,
            "session store opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(StoreInner { header, log }),
        })
    }

    /// Last processed inbound sequence number.
    pub fn in_seq(&self) -> u64 {
        self.inner.lock().header.in_seq
    }

    /// Last assigned outbound sequence number.
    pub fn out_seq(&self) -> u64 {
        self.inner.lock().header.out_seq
    }

    /// Allocate the next outbound sequence number and persist the counter.
    pub fn next_out_seq(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.header.out_seq += 1;
        let seq = inner.header.out_seq;
        self.save_header(&inner.header)?;
        Ok(seq)
    }

    /// Record the highest processed inbound sequence number.
    pub fn set_in_seq(&self, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.header.in_seq = seq;
        self.save_header(&inner.header)
    }

    /// Stamp a successful logon.
    pub fn record_logon(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.header.last_logon = now_ms();
        self.save_header(&inner.header)
    }

    /// Append one message to the log. `critical` forces an fsync before
    /// returning — the caller must not put the message on the wire until this
    /// returns.
    pub fn append(
        &self,
        direction: Direction,
        seq: u64,
        payload: &[u8],
        critical: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut record = Vec::with_capacity(13 + payload.len());
        record.push(direction.as_u8());
        record.extend_from_slice(&seq.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        inner.log.write_all(&record).context("log append failed")?;
        if critical {
            inner.log.sync_data().context("log fsync failed")?;
        }
        Ok(())
    }

    /// Read outbound messages with `begin <= seq <= end` (`end == 0` means
    /// "to infinity", matching EndSeqNo=0 on the wire).
    pub fn outbound_range(&self, begin: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let inner = self.inner.lock();
        let mut reader = inner
            .log
            .try_clone()
            .context("failed to clone log handle")?;
        reader.seek(SeekFrom::Start(0)).context("log seek failed")?;

        let mut out = Vec::new();
        let mut head = [0u8; 13];
        loop {
            match reader.read_exact(&mut head) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("log read failed"),
            }
            let direction = Direction::from_u8(head[0]);
            let seq = u64::from_le_bytes(head[1..9].try_into().unwrap());
            let len = u32::from_le_bytes(head[9..13].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; len];
            reader
                .read_exact(&mut payload)
                .context("log payload read failed")?;

            if direction == Some(Direction::Outbound)
                && seq >= begin
                && (end == 0 || seq <= end)
            {
                out.push((seq, payload));
            }
        }
        Ok(out)
    }

    /// Zero both counters and truncate the log (reset-on-logon).
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.header = StoreHeader::default();
        self.save_header(&inner.header)?;
        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(self.dir.join("messages.log"))
            .context("failed to truncate message log")?;
        inner.log = log;
        info!(dir = %self.dir.display(), "session store reset");
        Ok(())
    }

    /// Atomic header save: tmp file, fsync, rename.
    fn save_header(&self, header: &StoreHeader) -> Result<()> {
        let path = self.dir.join("header.json");
        let tmp = self.dir.join("header.json.tmp");
        let json = serde_json::to_string(header).context("header serialize failed")?;
        let mut file = File::create(&tmp).context("header tmp create failed")?;
        file.write_all(json.as_bytes())
            .context("header tmp write failed")?;
        file.sync_data().context("header fsync failed")?;
        std::fs::rename(&tmp, &path).context("header rename failed")?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionStore")
            .field("dir", &self.dir)
            .field("in_seq", &inner.header.in_seq)
            .field("out_seq", &inner.header.out_seq)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
