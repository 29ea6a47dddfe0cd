use byteorder::{LittleEndian, WriteBytesExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{DaqError, DaqResult};
use crate::hal::RHS2116_PAYLOAD_BYTES;

/// Current on-disk format
pub const FORMAT_VERSION: u32 = 2;

pub const METADATA_FILE: &str = "session.json";
pub const DATA_FILE: &str = "data.bin";
pub const TIME_FILE: &str = "time.bin";
pub const STIM_ID_FILE: &str = "stim_id.bin";
pub const STIM_CATALOG_FILE: &str = "stim_catalog.bin";

/// Bytes of the clock-tick prefix of each data record
pub const CLOCK_BYTES: usize = 8;

/// `session.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    pub version: u32,
    pub created: String,
    pub device_order: Vec<u32>,
    /// Payload bytes per device per frame
    pub payload_bytes: usize,
    pub probe_count: usize,
    pub sample_rate_hz: f64,
    pub hub_clock_hz: f64,
    pub heartbeat_hz: f64,
    pub channel_map: Vec<usize>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            // Files written before the version field existed are version 1
            version: 1,
            created: String::new(),
            device_order: Vec::new(),
            payload_bytes: RHS2116_PAYLOAD_BYTES,
            probe_count: 0,
            sample_rate_hz: 30_000.0,
            hub_clock_hz: 250_000_000.0,
            heartbeat_hz: 100.0,
            channel_map: Vec::new(),
        }
    }
}

impl SessionMetadata {
    /// Size of one `data.bin` record
    pub fn frame_bytes(&self) -> usize {
        CLOCK_BYTES + self.payload_bytes * self.device_order.len()
    }

    /// Frames in one nominal heartbeat period; playback's drift tick
    pub fn frames_per_heartbeat(&self) -> u64 {
        (self.sample_rate_hz / self.heartbeat_hz).round().max(1.0) as u64
    }
}

/// A session folder on disk
#[derive(Debug, Clone)]
pub struct RecordingSession {
    dir: PathBuf,
    metadata: SessionMetadata,
}

impl RecordingSession {
    /// Allocate a timestamped folder under `root` and write its metadata
    pub fn create(root: &Path, mut metadata: SessionMetadata) -> DaqResult<Self> {
        fs::create_dir_all(root).map_err(|e| DaqError::storage(root, e))?;

        let now = chrono::Local::now();
        let stem = now.format("%Y%m%d_%H%M%S").to_string();
        let mut dir = root.join(&stem);
        let mut suffix = 1;
        while dir.exists() {
            dir = root.join(format!("{}_{}", stem, suffix));
            suffix += 1;
        }
        fs::create_dir(&dir).map_err(|e| DaqError::storage(&dir, e))?;

        metadata.version = FORMAT_VERSION;
        metadata.created = now.to_rfc3339();
        let session = Self { dir, metadata };
        session.save_metadata()?;

        info!("Created recording session {:?}", session.dir);
        Ok(session)
    }

    /// Open an existing session, upgrading older formats in place
    pub fn open(dir: &Path) -> DaqResult<Self> {
        let path = dir.join(METADATA_FILE);
        let content = fs::read_to_string(&path).map_err(|e| DaqError::storage(&path, e))?;
        let metadata: SessionMetadata = serde_json::from_str(&content)
            .map_err(|e| DaqError::DataIntegrity(format!("unreadable {:?}: {}", path, e)))?;

        if metadata.version > FORMAT_VERSION {
            return Err(DaqError::DataIntegrity(format!(
                "session format {} is newer than supported version {}",
                metadata.version, FORMAT_VERSION
            )));
        }

        let mut session = Self {
            dir: dir.to_path_buf(),
            metadata,
        };
        if session.metadata.version < FORMAT_VERSION {
            session.upgrade()?;
        }
        Ok(session)
    }

    fn upgrade(&mut self) -> DaqResult<()> {
        let from = self.metadata.version;
        let warning = DaqError::DataIntegrity(format!(
            "session {:?} is format version {}, upgrading to {}",
            self.dir, from, FORMAT_VERSION
        ));
        warn!("{}", warning);

        if from < 2 {
            let frames = self.data_frames()?;
            let path = self.path(STIM_ID_FILE);
            let file = File::create(&path).map_err(|e| DaqError::storage(&path, e))?;
            let mut w = BufWriter::new(file);
            for _ in 0..frames {
                w.write_i32::<LittleEndian>(-1).map_err(|e| DaqError::storage(&path, e))?;
            }
            w.flush().map_err(|e| DaqError::storage(&path, e))?;

            let catalog = self.path(STIM_CATALOG_FILE);
            File::create(&catalog).map_err(|e| DaqError::storage(&catalog, e))?;
        }

        if self.metadata.probe_count == 0 {
            self.metadata.probe_count = self.metadata.device_order.len() * crate::hal::RHS2116_CHANNELS;
        }
        self.metadata.version = FORMAT_VERSION;
        self.save_metadata()
    }

    /// Whole frames in `data.bin`
    fn data_frames(&self) -> DaqResult<u64> {
        let path = self.path(DATA_FILE);
        let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(len / self.metadata.frame_bytes().max(1) as u64)
    }

    pub fn save_metadata(&self) -> DaqResult<()> {
        let path = self.path(METADATA_FILE);
        let json = serde_json::to_string_pretty(&self.metadata)
            .map_err(|e| DaqError::DataIntegrity(e.to_string()))?;
        fs::write(&path, json).map_err(|e| DaqError::storage(&path, e))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Open one stream for appending
    pub(crate) fn append(&self, file: &str) -> DaqResult<BufWriter<File>> {
        let path = self.path(file);
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DaqError::storage(&path, e))?;
        Ok(BufWriter::new(f))
    }
}
