//! Per-job metadata cache and reconciliation of unsaved edits
//!
//! One metadata fetch per job at a time: the first caller stores a pending
//! `Flight` in the map and fetches; concurrent callers join that flight. A
//! synchronous mirror holds the settled handle for callers that must not
//! block (`get_sync`).
//!
//! Forced reloads replace the cached metadata wholesale, but pending
//! deleted/restored edits of the previous version are re-applied on top of
//! the fresh payload (`merge_meta_data`). Local intent wins over server state
//! until the next explicit save.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::{FrameError, Result};
use super::flight::Flight;
use crate::entities::{FramesMetaData, MetadataSource, RawMetadata, SessionType};

/// Shared, mutable metadata of one job
#[derive(Debug, Clone)]
pub struct SharedMeta(Arc<RwLock<FramesMetaData>>);

impl SharedMeta {
    pub fn new(meta: FramesMetaData) -> Self {
        Self(Arc::new(RwLock::new(meta)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FramesMetaData> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FramesMetaData> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ptr_eq(&self, other: &SharedMeta) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

type MetaOutcome = Result<SharedMeta>;

enum MetaEntry {
    Pending(Arc<Flight<MetaOutcome>>),
    Ready(SharedMeta),
}

/// Build metadata from a fresh payload and carry over pending edits of the
/// previous version. The previous version's edits are drained.
pub fn merge_meta_data(fresh: RawMetadata, previous: Option<&SharedMeta>) -> Result<FramesMetaData> {
    let mut meta = FramesMetaData::new(fresh)?;
    if let Some(previous) = previous {
        let edits = previous.write().take_updated();
        if !edits.is_empty() {
            debug!("Re-applying {} unsaved deleted-frame edits", edits.len());
        }
        for (frame, edit) in edits {
            meta.deleted_frames_mut().apply(frame, edit);
        }
    }
    Ok(meta)
}

/// A running metadata fetch owning the job's `Pending` entry. Settles the
/// entry and wakes joined callers exactly once, also when the fetch unwinds.
struct MetaFetch<'a> {
    cache: &'a MetaCache,
    id: u64,
    flight: Arc<Flight<MetaOutcome>>,
    previous: Option<SharedMeta>,
    settled: bool,
}

impl MetaFetch<'_> {
    fn settle(&mut self, outcome: MetaOutcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        let id = self.id;
        {
            let mut entries = self.cache.entries.lock().unwrap_or_else(|e| e.into_inner());
            let ours = matches!(entries.get(&id), Some(MetaEntry::Pending(f)) if Arc::ptr_eq(f, &self.flight));
            if ours {
                match &outcome {
                    Ok(meta) => {
                        entries.insert(id, MetaEntry::Ready(meta.clone()));
                        self.cache
                            .sync
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(id, meta.clone());
                    }
                    Err(err) => {
                        warn!("Metadata fetch for job {} failed: {}", id, err);
                        // keep serving the previous version
                        match self.previous.take() {
                            Some(meta) => {
                                entries.insert(id, MetaEntry::Ready(meta));
                            }
                            None => {
                                entries.remove(&id);
                            }
                        }
                    }
                }
            }
        }
        self.flight.complete(outcome);
    }
}

impl Drop for MetaFetch<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let cause = anyhow::anyhow!("metadata fetch of job {} was aborted", self.id);
            self.settle(Err(FrameError::fetch("metadata fetch", cause)));
        }
    }
}

/// Metadata cache of all open jobs
pub struct MetaCache {
    source: Arc<dyn MetadataSource>,
    entries: Mutex<HashMap<u64, MetaEntry>>,
    sync: Mutex<HashMap<u64, SharedMeta>>,
}

impl MetaCache {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
            sync: Mutex::new(HashMap::new()),
        }
    }

    /// Metadata of a job or task. Task metadata is never cached.
    pub fn get(&self, session: SessionType, id: u64, force_reload: bool) -> Result<SharedMeta> {
        if session == SessionType::Task {
            let raw = self
                .source
                .fetch_meta(session, id)
                .map_err(|e| FrameError::fetch("metadata fetch", e))?;
            return Ok(SharedMeta::new(FramesMetaData::new(raw)?));
        }

        let (flight, previous) = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(&id) {
                Some(MetaEntry::Ready(meta)) if !force_reload => return Ok(meta.clone()),
                Some(MetaEntry::Pending(flight)) if !force_reload => {
                    let flight = Arc::clone(flight);
                    drop(entries);
                    return flight.wait();
                }
                _ => {}
            }
            let flight = Arc::new(Flight::new());
            let previous = entries.insert(id, MetaEntry::Pending(Arc::clone(&flight)));
            (flight, previous)
        };

        let previous = match previous {
            Some(MetaEntry::Ready(meta)) => Some(meta),
            Some(MetaEntry::Pending(earlier)) => earlier.wait().ok(),
            None => None,
        };
        let mut fetch = MetaFetch {
            cache: self,
            id,
            flight,
            previous,
            settled: false,
        };

        debug!("Fetching metadata of job {} (force={})", id, force_reload);
        let outcome = self
            .source
            .fetch_meta(SessionType::Job, id)
            .map_err(|e| FrameError::fetch("metadata fetch", e))
            .and_then(|raw| merge_meta_data(raw, fetch.previous.as_ref()))
            .map(SharedMeta::new);

        fetch.settle(outcome.clone());
        outcome
    }

    /// Settled metadata of a job without blocking
    pub fn get_sync(&self, id: u64) -> Result<SharedMeta> {
        self.sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(FrameError::NotInitialized(id))
    }

    /// Persist pending deleted-frame edits of a job. No network call when
    /// nothing is pending.
    pub fn patch(&self, id: u64) -> Result<SharedMeta> {
        let meta = self.get(SessionType::Job, id, false)?;
        let (edits, deleted) = {
            let mut guard = meta.write();
            let edits = guard.take_updated();
            let deleted: Vec<i64> = guard.deleted_frames().iter().collect();
            (edits, deleted)
        };
        if edits.is_empty() {
            return Ok(meta);
        }

        info!("Saving {} deleted-frame edits of job {}", edits.len(), id);
        let saved = self
            .source
            .save_meta(SessionType::Job, id, &deleted)
            .map_err(|e| FrameError::fetch("metadata save", e))
            .and_then(|raw| merge_meta_data(raw, Some(&meta)));

        match saved {
            Ok(saved) => {
                let saved = SharedMeta::new(saved);
                self.entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, MetaEntry::Ready(saved.clone()));
                self.sync
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, saved.clone());
                Ok(saved)
            }
            Err(err) => {
                // nothing was saved: the drained edits are pending again
                let mut guard = meta.write();
                let newer = guard.take_updated();
                // state already reflects the edits; re-applying records them
                for (frame, edit) in edits.into_iter().chain(newer) {
                    guard.deleted_frames_mut().apply(frame, edit);
                }
                Err(err)
            }
        }
    }

    /// Forget a job
    pub fn remove(&self, id: u64) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        self.sync.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sync.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&id)
    }
}
