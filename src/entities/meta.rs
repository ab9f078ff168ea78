//! Frame metadata of a job or task
//!
//! `RawMetadata` is the wire payload of the metadata collaborator.
//! `FramesMetaData` is the validated form the cache works with: it maps
//! absolute (data) frame numbers onto positions in the chunked layout and
//! tracks local deleted-frame edits until they are saved.
//!
//! # Frame numbering
//!
//! - *data frame*: number in the task's source data
//! - *job-relative frame*: `(data - start_frame) / step`
//! - *segment index*: position in the job's frame list, the unit chunks are
//!   cut from (`chunk = index / chunk_size`)

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::error::{FrameError, Result};

static FRAME_FILTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*step\s*=\s*(\d+)\s*$").expect("valid frame filter regex"));

/// Kind of session metadata is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Job,
    Task,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Job => write!(f, "job"),
            SessionType::Task => write!(f, "task"),
        }
    }
}

/// Per-frame descriptor reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub name: String,
    /// Number of related (context) images attached to the frame
    #[serde(default)]
    pub related_files: usize,
}

/// Metadata payload as delivered by the metadata collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMetadata {
    pub chunk_size: usize,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub image_quality: u8,
    pub start_frame: i64,
    pub stop_frame: i64,
    /// Optional `step=N` expression
    #[serde(default)]
    pub frame_filter: String,
    /// Sparse frame selection (data frame numbers)
    #[serde(default)]
    pub included_frames: Option<Vec<i64>>,
    #[serde(default)]
    pub deleted_frames: Vec<i64>,
    #[serde(default)]
    pub frames: Vec<FrameInfo>,
    /// Bumped by the server whenever chunk contents are regenerated
    #[serde(default)]
    pub chunks_updated_date: DateTime<Utc>,
}

/// Direction of a pending deleted-frame edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEdit {
    Deleted,
    Restored,
}

impl FrameEdit {
    pub fn opposite(self) -> Self {
        match self {
            FrameEdit::Deleted => FrameEdit::Restored,
            FrameEdit::Restored => FrameEdit::Deleted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameEdit::Deleted => "deleted",
            FrameEdit::Restored => "restored",
        }
    }
}

/// Deleted-frame set with pending edit tracking.
///
/// Every `set`/`unset` records a pending edit keyed by frame. An edit that
/// exactly cancels a still-pending opposite edit clears the record instead,
/// so delete-then-restore before saving leaves nothing to save.
#[derive(Debug, Clone, Default)]
pub struct DeletedFrames {
    frames: BTreeSet<i64>,
    pending: BTreeMap<i64, FrameEdit>,
}

impl DeletedFrames {
    pub fn from_frames(frames: impl IntoIterator<Item = i64>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            pending: BTreeMap::new(),
        }
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.frames.contains(&frame)
    }

    /// Mark frame deleted (`true`) or restored (`false`)
    pub fn set(&mut self, frame: i64, deleted: bool) {
        let edit = if deleted {
            self.frames.insert(frame);
            FrameEdit::Deleted
        } else {
            self.frames.remove(&frame);
            FrameEdit::Restored
        };
        self.record(frame, edit);
    }

    /// Restore frame (remove it from the deleted set)
    pub fn unset(&mut self, frame: i64) {
        self.set(frame, false);
    }

    pub(crate) fn apply(&mut self, frame: i64, edit: FrameEdit) {
        self.set(frame, edit == FrameEdit::Deleted);
    }

    fn record(&mut self, frame: i64, edit: FrameEdit) {
        match self.pending.get(&frame) {
            Some(prev) if *prev == edit.opposite() => {
                self.pending.remove(&frame);
            }
            _ => {
                self.pending.insert(frame, edit);
            }
        }
        log::trace!("deletedFrames:{}:{}", frame, edit.as_str());
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.frames.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn pending(&self) -> &BTreeMap<i64, FrameEdit> {
        &self.pending
    }

    pub fn take_pending(&mut self) -> BTreeMap<i64, FrameEdit> {
        std::mem::take(&mut self.pending)
    }
}

/// Validated frame metadata of one job (or task)
#[derive(Debug, Clone)]
pub struct FramesMetaData {
    chunk_size: usize,
    size: usize,
    image_quality: u8,
    start_frame: i64,
    stop_frame: i64,
    frame_filter: String,
    frame_step: i64,
    included_frames: Option<Vec<i64>>,
    deleted_frames: DeletedFrames,
    frames: Vec<FrameInfo>,
    chunks_updated_date: DateTime<Utc>,
}

/// Parse `step=N` frame filter. Empty filter means step 1.
pub fn parse_frame_step(filter: &str) -> Result<i64> {
    if filter.trim().is_empty() {
        return Ok(1);
    }
    let step = FRAME_FILTER_RE
        .captures(filter)
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .filter(|step| *step > 0)
        .ok_or_else(|| FrameError::InvalidFrameFilter(filter.to_string()))?;
    Ok(step)
}

impl FramesMetaData {
    pub fn new(raw: RawMetadata) -> Result<Self> {
        if raw.chunk_size == 0 {
            return Err(FrameError::InvalidMetadata("chunk size is zero".into()));
        }
        if raw.stop_frame < raw.start_frame {
            return Err(FrameError::InvalidMetadata(format!(
                "stop frame {} precedes start frame {}",
                raw.stop_frame, raw.start_frame
            )));
        }
        let frame_step = parse_frame_step(&raw.frame_filter)?;

        let included_frames = match raw.included_frames {
            Some(mut included) => {
                if frame_step != 1 {
                    return Err(FrameError::InvalidMetadata(
                        "included frames cannot be combined with a frame step".into(),
                    ));
                }
                included.sort_unstable();
                included.dedup();
                match (included.first(), included.last()) {
                    (Some(first), Some(last))
                        if *first >= raw.start_frame && *last <= raw.stop_frame => {}
                    (None, _) | (_, None) => {
                        return Err(FrameError::InvalidMetadata("included frames are empty".into()));
                    }
                    _ => {
                        return Err(FrameError::InvalidMetadata(
                            "included frames fall outside the frame range".into(),
                        ));
                    }
                }
                Some(included)
            }
            None => None,
        };

        Ok(Self {
            chunk_size: raw.chunk_size,
            size: raw.size,
            image_quality: raw.image_quality,
            start_frame: raw.start_frame,
            stop_frame: raw.stop_frame,
            frame_filter: raw.frame_filter,
            frame_step,
            included_frames,
            deleted_frames: DeletedFrames::from_frames(raw.deleted_frames),
            frames: raw.frames,
            chunks_updated_date: raw.chunks_updated_date,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn image_quality(&self) -> u8 {
        self.image_quality
    }

    pub fn start_frame(&self) -> i64 {
        self.start_frame
    }

    pub fn stop_frame(&self) -> i64 {
        self.stop_frame
    }

    pub fn frame_filter(&self) -> &str {
        &self.frame_filter
    }

    pub fn frame_step(&self) -> i64 {
        self.frame_step
    }

    pub fn included_frames(&self) -> Option<&[i64]> {
        self.included_frames.as_deref()
    }

    pub fn frames(&self) -> &[FrameInfo] {
        &self.frames
    }

    pub fn chunks_updated_date(&self) -> DateTime<Utc> {
        self.chunks_updated_date
    }

    pub fn deleted_frames(&self) -> &DeletedFrames {
        &self.deleted_frames
    }

    pub fn deleted_frames_mut(&mut self) -> &mut DeletedFrames {
        &mut self.deleted_frames
    }

    pub fn is_deleted(&self, frame: i64) -> bool {
        self.deleted_frames.contains(frame)
    }

    /// Pending deleted-frame edits without draining them
    pub fn pending_edits(&self) -> &BTreeMap<i64, FrameEdit> {
        self.deleted_frames.pending()
    }

    /// Drain pending deleted-frame edits
    pub fn take_updated(&mut self) -> BTreeMap<i64, FrameEdit> {
        self.deleted_frames.take_pending()
    }

    pub fn data_frame_number(&self, job_relative: i64) -> i64 {
        job_relative * self.frame_step + self.start_frame
    }

    pub fn job_relative_frame_number(&self, data_frame: i64) -> i64 {
        (data_frame - self.start_frame) / self.frame_step
    }

    /// Position of a data frame in the chunked layout
    pub fn frame_index(&self, data_frame: i64) -> Result<usize> {
        if data_frame < self.start_frame || data_frame > self.stop_frame {
            return Err(FrameError::FrameOutOfJob(data_frame));
        }
        match &self.included_frames {
            Some(included) => included
                .binary_search(&data_frame)
                .map_err(|_| FrameError::FrameOutOfJob(data_frame)),
            None => Ok(((data_frame - self.start_frame) / self.frame_step) as usize),
        }
    }

    pub fn frame_chunk_index(&self, data_frame: i64) -> Result<usize> {
        Ok(self.frame_index(data_frame)? / self.chunk_size)
    }

    /// All data frames of the job in layout order
    pub fn data_frame_numbers(&self) -> Vec<i64> {
        match &self.included_frames {
            Some(included) => included.clone(),
            None => (self.start_frame..=self.stop_frame)
                .step_by(self.frame_step as usize)
                .collect(),
        }
    }

    /// Number of frames in the chunked layout
    pub fn frame_count(&self) -> usize {
        match &self.included_frames {
            Some(included) => included.len(),
            None => ((self.stop_frame - self.start_frame) / self.frame_step + 1) as usize,
        }
    }

    /// Job frame numbers of every data frame, offset by `job_start_frame`
    pub fn segment_frame_numbers(&self, job_start_frame: i64) -> Vec<i64> {
        self.data_frame_numbers()
            .into_iter()
            .map(|frame| self.job_relative_frame_number(frame) + job_start_frame)
            .collect()
    }

    /// Descriptor of a data frame. Video sources report one descriptor that
    /// applies to every frame.
    pub fn frame_info(&self, data_frame: i64) -> Result<&FrameInfo> {
        let index = self.frame_index(data_frame)?;
        match self.frames.len() {
            0 => Err(FrameError::InvalidMetadata("no frame descriptors".into())),
            1 => Ok(&self.frames[0]),
            _ => self.frames.get(index).ok_or_else(|| {
                FrameError::InvalidMetadata(format!("no descriptor for frame index {index}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: i64, stop: i64, chunk_size: usize, filter: &str) -> RawMetadata {
        RawMetadata {
            chunk_size,
            size: 0,
            image_quality: 70,
            start_frame: start,
            stop_frame: stop,
            frame_filter: filter.to_string(),
            included_frames: None,
            deleted_frames: Vec::new(),
            frames: vec![FrameInfo {
                width: 8,
                height: 4,
                name: "video.mp4".into(),
                related_files: 0,
            }],
            chunks_updated_date: DateTime::<Utc>::default(),
        }
    }

    #[test]
    fn test_frame_filter_parsing() {
        assert_eq!(parse_frame_step("").unwrap(), 1);
        assert_eq!(parse_frame_step("step=3").unwrap(), 3);
        assert_eq!(parse_frame_step(" step = 5 ").unwrap(), 5);
        assert!(matches!(parse_frame_step("step=0"), Err(FrameError::InvalidFrameFilter(_))));
        assert!(matches!(parse_frame_step("every=2"), Err(FrameError::InvalidFrameFilter(_))));
        assert!(matches!(parse_frame_step("step="), Err(FrameError::InvalidFrameFilter(_))));
    }

    #[test]
    fn test_invalid_filter_fails_construction() {
        assert!(matches!(
            FramesMetaData::new(raw(0, 10, 4, "step")),
            Err(FrameError::InvalidFrameFilter(_))
        ));
    }

    #[test]
    fn test_frame_numbering_with_step() {
        let meta = FramesMetaData::new(raw(10, 40, 4, "step=3")).unwrap();
        assert_eq!(meta.data_frame_number(0), 10);
        assert_eq!(meta.data_frame_number(2), 16);
        assert_eq!(meta.job_relative_frame_number(16), 2);
        assert_eq!(meta.frame_index(16).unwrap(), 2);
        assert_eq!(meta.frame_chunk_index(22).unwrap(), 1);
        assert_eq!(meta.frame_count(), 11);
        assert_eq!(meta.data_frame_numbers().last(), Some(&40));
    }

    #[test]
    fn test_round_trip_for_all_valid_frames() {
        let meta = FramesMetaData::new(raw(7, 103, 5, "step=4")).unwrap();
        for frame in meta.data_frame_numbers() {
            assert_eq!(meta.data_frame_number(meta.job_relative_frame_number(frame)), frame);
        }
    }

    #[test]
    fn test_frame_out_of_job() {
        let meta = FramesMetaData::new(raw(10, 20, 4, "")).unwrap();
        assert!(matches!(meta.frame_index(9), Err(FrameError::FrameOutOfJob(9))));
        assert!(matches!(meta.frame_index(21), Err(FrameError::FrameOutOfJob(21))));
        assert!(meta.frame_index(20).is_ok());
    }

    #[test]
    fn test_included_frames_layout() {
        let mut data = raw(0, 100, 2, "");
        data.included_frames = Some(vec![50, 3, 17, 99, 17]);
        let meta = FramesMetaData::new(data).unwrap();
        assert_eq!(meta.data_frame_numbers(), vec![3, 17, 50, 99]);
        assert_eq!(meta.frame_index(50).unwrap(), 2);
        assert_eq!(meta.frame_chunk_index(99).unwrap(), 1);
        assert!(matches!(meta.frame_index(4), Err(FrameError::FrameOutOfJob(4))));
    }

    #[test]
    fn test_included_frames_with_step_rejected() {
        let mut data = raw(0, 100, 2, "step=2");
        data.included_frames = Some(vec![2, 4]);
        assert!(matches!(FramesMetaData::new(data), Err(FrameError::InvalidMetadata(_))));
    }

    #[test]
    fn test_segment_frame_numbers() {
        let meta = FramesMetaData::new(raw(100, 110, 4, "step=5")).unwrap();
        assert_eq!(meta.segment_frame_numbers(0), vec![0, 1, 2]);
        assert_eq!(meta.segment_frame_numbers(20), vec![20, 21, 22]);
    }

    #[test]
    fn test_frame_info_per_frame() {
        let mut data = raw(0, 2, 2, "");
        data.frames = (0..3)
            .map(|i| FrameInfo {
                width: 10 + i,
                height: 10,
                name: format!("img_{i}.png"),
                related_files: i as usize,
            })
            .collect();
        let meta = FramesMetaData::new(data).unwrap();
        assert_eq!(meta.frame_info(2).unwrap().name, "img_2.png");
        assert_eq!(meta.frame_info(1).unwrap().related_files, 1);
    }

    #[test]
    fn test_delete_restore_coalesces() {
        let mut meta = FramesMetaData::new(raw(0, 20, 4, "")).unwrap();
        meta.deleted_frames_mut().set(7, true);
        assert!(meta.is_deleted(7));
        meta.deleted_frames_mut().unset(7);
        assert!(!meta.is_deleted(7));
        assert!(meta.take_updated().is_empty());
    }

    #[test]
    fn test_pending_edits_drain() {
        let mut data = raw(0, 20, 4, "");
        data.deleted_frames = vec![3];
        let mut meta = FramesMetaData::new(data).unwrap();
        meta.deleted_frames_mut().set(5, true);
        meta.deleted_frames_mut().unset(3);
        meta.deleted_frames_mut().set(5, true);

        assert_eq!(meta.pending_edits().len(), 2);
        let updated = meta.take_updated();
        assert_eq!(updated.get(&5), Some(&FrameEdit::Deleted));
        assert_eq!(updated.get(&3), Some(&FrameEdit::Restored));
        assert!(meta.take_updated().is_empty());
        assert!(meta.is_deleted(5));
        assert!(!meta.is_deleted(3));
    }

    #[test]
    fn test_raw_metadata_json() {
        let json = r#"{
            "chunk_size": 36,
            "size": 72,
            "start_frame": 0,
            "stop_frame": 71,
            "frame_filter": "",
            "deleted_frames": [4],
            "frames": [{"width": 1920, "height": 1080, "name": "a.mp4", "related_files": 2}],
            "chunks_updated_date": "2024-03-01T10:00:00Z"
        }"#;
        let raw: RawMetadata = serde_json::from_str(json).unwrap();
        let meta = FramesMetaData::new(raw).unwrap();
        assert!(meta.is_deleted(4));
        assert_eq!(meta.frame_info(70).unwrap().related_files, 2);
        assert_eq!(meta.chunks_updated_date().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }
}
