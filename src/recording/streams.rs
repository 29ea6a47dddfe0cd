use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use super::session::{RecordingSession, DATA_FILE, STIM_CATALOG_FILE, STIM_ID_FILE, TIME_FILE};
use crate::error::{DaqError, DaqResult};
use crate::stimulus::StimulusSet;

/// One frame as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub clock_ticks: u64,
    /// Device payloads in configured device order
    pub payload: Vec<u8>,
    pub wall_clock_ns: u64,
    /// Session catalog index, -1 = none
    pub stimulus_id: i32,
}

/// Append-only writer over the four session streams
pub struct SessionWriter {
    dir: PathBuf,
    data: BufWriter<File>,
    time: BufWriter<File>,
    stim_id: BufWriter<File>,
    catalog: BufWriter<File>,
    payload_len: usize,
    frames: u64,
    catalog_records: usize,
}

impl SessionWriter {
    pub fn open(session: &RecordingSession) -> DaqResult<Self> {
        let meta = session.metadata();
        Ok(Self {
            dir: session.dir().to_path_buf(),
            data: session.append(DATA_FILE)?,
            time: session.append(TIME_FILE)?,
            stim_id: session.append(STIM_ID_FILE)?,
            catalog: session.append(STIM_CATALOG_FILE)?,
            payload_len: meta.payload_bytes * meta.device_order.len(),
            frames: 0,
            catalog_records: 0,
        })
    }

    fn fault(&self, file: &str, e: std::io::Error) -> DaqError {
        DaqError::storage(self.dir.join(file), e)
    }

    pub fn write_frame(&mut self, frame: &RecordedFrame) -> DaqResult<()> {
        if frame.payload.len() != self.payload_len {
            return Err(DaqError::DataIntegrity(format!(
                "frame payload is {} bytes, session expects {}",
                frame.payload.len(),
                self.payload_len
            )));
        }

        self.data
            .write_u64::<LittleEndian>(frame.clock_ticks)
            .and_then(|_| self.data.write_all(&frame.payload))
            .map_err(|e| self.fault(DATA_FILE, e))?;
        self.time
            .write_u64::<LittleEndian>(frame.wall_clock_ns)
            .map_err(|e| self.fault(TIME_FILE, e))?;
        self.stim_id
            .write_i32::<LittleEndian>(frame.stimulus_id)
            .map_err(|e| self.fault(STIM_ID_FILE, e))?;
        self.frames += 1;
        Ok(())
    }

    /// Append a catalog record; returns its session index
    pub fn write_catalog(&mut self, set: &StimulusSet) -> DaqResult<i32> {
        set.write_record(&mut self.catalog)
            .map_err(|e| self.fault(STIM_CATALOG_FILE, e))?;
        self.catalog_records += 1;
        Ok((self.catalog_records - 1) as i32)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn flush(&mut self) -> DaqResult<()> {
        self.data.flush().map_err(|e| self.fault(DATA_FILE, e))?;
        self.time.flush().map_err(|e| self.fault(TIME_FILE, e))?;
        self.stim_id.flush().map_err(|e| self.fault(STIM_ID_FILE, e))?;
        self.catalog.flush().map_err(|e| self.fault(STIM_CATALOG_FILE, e))?;
        Ok(())
    }
}

/// Sequential reader over a session, with the time stream memory-mapped
pub struct SessionReader {
    dir: PathBuf,
    data: BufReader<File>,
    stim_id: BufReader<File>,
    times: Option<Mmap>,
    frame_bytes: usize,
    frames: u64,
    position: u64,
    catalog: Vec<StimulusSet>,
}

impl SessionReader {
    /// Open all streams; misaligned lengths are truncated to the shortest
    pub fn open(session: &RecordingSession) -> DaqResult<Self> {
        let meta = session.metadata();
        let frame_bytes = meta.frame_bytes();

        let open = |file: &str| -> DaqResult<File> {
            let path = session.path(file);
            File::open(&path).map_err(|e| DaqError::storage(&path, e))
        };
        let len = |file: &str| -> u64 { fs::metadata(session.path(file)).map(|m| m.len()).unwrap_or(0) };

        let data_frames = len(DATA_FILE) / frame_bytes.max(1) as u64;
        let time_frames = len(TIME_FILE) / 8;
        let stim_frames = len(STIM_ID_FILE) / 4;
        let frames = data_frames.min(time_frames).min(stim_frames);
        if frames != data_frames || frames != time_frames || frames != stim_frames {
            let warning = DaqError::DataIntegrity(format!(
                "streams in {:?} are misaligned (data {}, time {}, stim {}), playing {} frames",
                session.dir(),
                data_frames,
                time_frames,
                stim_frames,
                frames
            ));
            warn!("{}", warning);
        }

        let time_file = open(TIME_FILE)?;
        let times = if len(TIME_FILE) >= 8 {
            // Read-only view; the writer for this session is closed
            let map = unsafe { Mmap::map(&time_file) }
                .map_err(|e| DaqError::storage(session.path(TIME_FILE), e))?;
            Some(map)
        } else {
            None
        };

        let catalog = Self::load_catalog(session)?;
        debug!("Opened session {:?}: {} frames, {} stimulus sets", session.dir(), frames, catalog.len());

        Ok(Self {
            dir: session.dir().to_path_buf(),
            data: BufReader::new(open(DATA_FILE)?),
            stim_id: BufReader::new(open(STIM_ID_FILE)?),
            times,
            frame_bytes,
            frames,
            position: 0,
            catalog,
        })
    }

    fn load_catalog(session: &RecordingSession) -> DaqResult<Vec<StimulusSet>> {
        let path = session.path(STIM_CATALOG_FILE);
        let bytes = fs::read(&path).map_err(|e| DaqError::storage(&path, e))?;
        let record = StimulusSet::record_bytes(session.metadata().probe_count);
        let mut catalog = Vec::new();
        let mut rest = bytes.as_slice();
        while rest.len() >= record {
            let set = StimulusSet::read_record(&mut rest, session.metadata().probe_count)
                .map_err(|e| DaqError::DataIntegrity(format!("bad catalog record in {:?}: {}", path, e)))?;
            catalog.push(set);
        }
        if !rest.is_empty() {
            warn!("Ignoring {} trailing catalog bytes in {:?}", rest.len(), path);
        }
        Ok(catalog)
    }

    /// Aligned frame count
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn catalog(&self) -> &[StimulusSet] {
        &self.catalog
    }

    /// Wall-clock timestamp of frame `index`, read from the mapped stream
    pub fn time_at(&self, index: u64) -> Option<u64> {
        if index >= self.frames {
            return None;
        }
        let map = self.times.as_ref()?;
        let at = index as usize * 8;
        Some(LittleEndian::read_u64(&map[at..at + 8]))
    }

    pub fn duration_ns(&self) -> u64 {
        match (self.time_at(0), self.frames.checked_sub(1).and_then(|last| self.time_at(last))) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }

    pub fn read_frame(&mut self) -> DaqResult<Option<RecordedFrame>> {
        if self.position >= self.frames {
            return Ok(None);
        }
        let data_path = self.dir.join(DATA_FILE);
        let clock_ticks = self
            .data
            .read_u64::<LittleEndian>()
            .map_err(|e| DaqError::storage(&data_path, e))?;
        let mut payload = vec![0u8; self.frame_bytes - 8];
        self.data
            .read_exact(&mut payload)
            .map_err(|e| DaqError::storage(&data_path, e))?;
        let stimulus_id = self
            .stim_id
            .read_i32::<LittleEndian>()
            .map_err(|e| DaqError::storage(self.dir.join(STIM_ID_FILE), e))?;
        let wall_clock_ns = self.time_at(self.position).unwrap_or(0);

        self.position += 1;
        Ok(Some(RecordedFrame {
            clock_ticks,
            payload,
            wall_clock_ns,
            stimulus_id,
        }))
    }

    pub fn rewind(&mut self) -> DaqResult<()> {
        self.data
            .seek(SeekFrom::Start(0))
            .map_err(|e| DaqError::storage(self.dir.join(DATA_FILE), e))?;
        self.stim_id
            .seek(SeekFrom::Start(0))
            .map_err(|e| DaqError::storage(self.dir.join(STIM_ID_FILE), e))?;
        self.position = 0;
        Ok(())
    }
}
