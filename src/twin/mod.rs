//! Twin reconciliation
//!
//! Reported patches flow device -> cloud in the order they were generated and
//! stay queued until the upstream acknowledges them. Desired patches flow
//! cloud -> device in arrival order; a newer desired version supersedes the
//! paths of an older patch the device has not received yet.
//!
//! Ordering across process restarts is not guaranteed: pending patches live in
//! memory only.

pub mod document;

pub use document::{TwinDocument, TwinPatch, VERSION_KEY};

use crate::config::TwinSection;
use crate::connection::{ConnectionManager, HubEvent};
use crate::error::{HubError, HubResult};
use crate::identity::Identity;
use crate::observability::metrics;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone)]
struct PendingPatch {
    id: u64,
    patch: TwinPatch,
}

/// Per-identity twin bookkeeping
#[derive(Debug, Default)]
pub struct TwinState {
    reported_version: Option<i64>,
    desired_version: Option<i64>,
    pending_reported: VecDeque<PendingPatch>,
    pending_desired: VecDeque<PendingPatch>,
    /// Version that last wrote each desired leaf path
    desired_path_versions: HashMap<String, i64>,
    cached: Option<TwinDocument>,
    next_patch_id: u64,
}

impl TwinState {
    fn next_id(&mut self) -> u64 {
        self.next_patch_id += 1;
        self.next_patch_id
    }

    pub fn reported_version(&self) -> Option<i64> {
        self.reported_version
    }

    pub fn desired_version(&self) -> Option<i64> {
        self.desired_version
    }

    pub fn pending_reported(&self) -> Vec<TwinPatch> {
        self.pending_reported.iter().map(|p| p.patch.clone()).collect()
    }

    pub fn pending_desired(&self) -> Vec<TwinPatch> {
        self.pending_desired.iter().map(|p| p.patch.clone()).collect()
    }

    /// Record a desired patch from the cloud
    ///
    /// Paths already written by a newer version are stripped (the cloud may
    /// deliver out of order); the remaining paths supersede the same paths in
    /// older undelivered patches. Returns the effective patch, or `None` if
    /// nothing in it is newer than what the device already has.
    pub fn record_desired(&mut self, patch: TwinPatch) -> Option<TwinPatch> {
        let mut effective = patch;
        if let Some(version) = effective.version() {
            let stale: Vec<String> = effective
                .paths()
                .into_iter()
                .filter(|path| {
                    self.desired_path_versions
                        .get(path)
                        .is_some_and(|&written| written > version)
                })
                .collect();
            if !stale.is_empty() {
                debug!(?stale, version, "Dropping desired paths already written by a newer version");
                effective = effective.without_paths(&stale);
            }
            for path in effective.paths() {
                self.desired_path_versions.insert(path, version);
            }
            self.desired_version = Some(self.desired_version.map_or(version, |v| v.max(version)));
        }

        if effective.is_empty() {
            return None;
        }

        let paths = effective.paths();
        for pending in self.pending_desired.iter_mut() {
            pending.patch = pending.patch.without_paths(&paths);
        }
        self.pending_desired.retain(|p| !p.patch.is_empty());

        if let Some(cached) = self.cached.as_mut() {
            cached.apply_desired(&effective);
        }

        let id = self.next_id();
        self.pending_desired.push_back(PendingPatch {
            id,
            patch: effective.clone(),
        });
        Some(effective)
    }

    pub fn push_reported(&mut self, patch: TwinPatch) {
        let id = self.next_id();
        self.pending_reported.push_back(PendingPatch { id, patch });
    }

    fn front_reported(&self) -> Option<PendingPatch> {
        self.pending_reported.front().cloned()
    }

    fn front_desired(&self) -> Option<PendingPatch> {
        self.pending_desired.front().cloned()
    }

    /// Remove the head of a queue if it is still the entry with `id`
    fn pop_if(queue: &mut VecDeque<PendingPatch>, id: u64) {
        if queue.front().is_some_and(|p| p.id == id) {
            queue.pop_front();
        }
    }

    fn reported_acknowledged(&mut self, id: u64, patch: &TwinPatch, version: i64) {
        Self::pop_if(&mut self.pending_reported, id);
        self.reported_version = Some(version);
        if let Some(cached) = self.cached.as_mut() {
            cached.apply_reported(patch, Some(version));
        }
    }

    fn adopt_document(&mut self, document: &TwinDocument) {
        if let Some(version) = document.reported_version() {
            self.reported_version = Some(version);
        }
        let mut cached = document.clone();
        // Desired patches already recorded locally but newer than the fetch win
        if let (Some(local), Some(fetched)) = (self.desired_version, document.desired_version()) {
            if local > fetched {
                for pending in &self.pending_desired {
                    cached.apply_desired(&pending.patch);
                }
            }
        }
        self.cached = Some(cached);
    }
}

/// Counts from one reported-patch flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub pending: usize,
}

/// Serializable view of one identity's twin bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TwinStatus {
    pub reported_version: Option<i64>,
    pub desired_version: Option<i64>,
    pub pending_reported: usize,
    pub pending_desired: usize,
}

#[derive(Default)]
struct TwinEntry {
    state: Mutex<TwinState>,
    /// Serializes reported-patch delivery for FIFO order
    reported_flush: Mutex<()>,
    /// Serializes desired-patch delivery to the device
    desired_flush: Mutex<()>,
}

/// Reconciles twin properties between devices and the cloud
pub struct TwinManager {
    entries: DashMap<Identity, Arc<TwinEntry>>,
    connections: Arc<ConnectionManager>,
    conflict_retries: u32,
}

impl TwinManager {
    pub fn new(connections: Arc<ConnectionManager>, config: &TwinSection) -> Self {
        Self {
            entries: DashMap::new(),
            connections,
            conflict_retries: config.conflict_retries,
        }
    }

    fn entry(&self, identity: &Identity) -> Arc<TwinEntry> {
        Arc::clone(
            self.entries
                .entry(identity.clone())
                .or_default()
                .value(),
        )
    }

    pub async fn status(&self, identity: &Identity) -> Option<TwinStatus> {
        let entry = self.entries.get(identity).map(|e| Arc::clone(e.value()))?;
        let state = entry.state.lock().await;
        Some(TwinStatus {
            reported_version: state.reported_version,
            desired_version: state.desired_version,
            pending_reported: state.pending_reported.len(),
            pending_desired: state.pending_desired.len(),
        })
    }

    pub async fn pending_reported(&self, identity: &Identity) -> Vec<TwinPatch> {
        match self.entries.get(identity).map(|e| Arc::clone(e.value())) {
            Some(entry) => entry.state.lock().await.pending_reported(),
            None => Vec::new(),
        }
    }

    /// Apply a desired patch from the cloud and deliver it to the device
    ///
    /// Delivery failures keep the patch pending; it is retried when the
    /// device reconnects.
    pub async fn apply_desired_patch(&self, identity: &Identity, patch: TwinPatch) -> HubResult<()> {
        let recorded = self.record_desired(identity, patch).await;
        if recorded {
            self.flush_desired(identity).await?;
        }
        Ok(())
    }

    async fn record_desired(&self, identity: &Identity, patch: TwinPatch) -> bool {
        let entry = self.entry(identity);
        let mut state = entry.state.lock().await;
        match state.record_desired(patch) {
            Some(effective) => {
                debug!(%identity, version = ?effective.version(), "Desired patch recorded");
                true
            }
            None => {
                debug!(%identity, "Desired patch fully superseded");
                false
            }
        }
    }

    /// Deliver pending desired patches to the device in order
    pub async fn flush_desired(&self, identity: &Identity) -> HubResult<usize> {
        let entry = self.entry(identity);
        let _flush = entry.desired_flush.lock().await;
        let Some(device) = self.connections.device_proxy(identity).await else {
            return Ok(0);
        };

        let mut delivered = 0;
        loop {
            let Some(pending) = entry.state.lock().await.front_desired() else {
                break;
            };
            if let Err(e) = device.send_desired_properties(&pending.patch).await {
                debug!(%identity, error = %e, "Desired patch delivery deferred");
                return Err(e);
            }
            TwinState::pop_if(&mut entry.state.lock().await.pending_desired, pending.id);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Queue a reported patch and try to deliver the queue
    ///
    /// A patch queued while the upstream is down is kept and delivered after
    /// reconnect. Version conflicts refresh the base version and resubmit up
    /// to the configured number of times, then the patch is dropped.
    pub async fn submit_reported_patch(
        &self,
        identity: &Identity,
        patch: TwinPatch,
    ) -> HubResult<FlushOutcome> {
        if patch.is_empty() {
            return Err(HubError::invalid_argument("reported patch has no properties"));
        }
        let entry = self.entry(identity);
        entry.state.lock().await.push_reported(patch);
        self.flush_reported(identity).await
    }

    /// Drain pending reported patches to the upstream in FIFO order
    pub async fn flush_reported(&self, identity: &Identity) -> HubResult<FlushOutcome> {
        let entry = self.entry(identity);
        let _flush = entry.reported_flush.lock().await;
        let mut outcome = FlushOutcome::default();

        let proxy = match self.connections.cloud_proxy(identity).await {
            Some(proxy) if proxy.is_connected() => Some(proxy),
            _ => None,
        };

        if let Some(proxy) = proxy {
            'queue: loop {
                let (pending, base_version) = {
                    let state = entry.state.lock().await;
                    match state.front_reported() {
                        Some(pending) => (pending, state.reported_version),
                        None => break,
                    }
                };

                let mut base_version = base_version;
                let mut conflicts = 0;
                loop {
                    match proxy
                        .update_reported_properties(&pending.patch, base_version)
                        .await
                    {
                        Ok(version) => {
                            entry
                                .state
                                .lock()
                                .await
                                .reported_acknowledged(pending.id, &pending.patch, version);
                            metrics().reported_patch_sent();
                            outcome.delivered += 1;
                            break;
                        }
                        Err(HubError::VersionConflict { message }) => {
                            metrics().twin_conflict();
                            if conflicts >= self.conflict_retries {
                                warn!(%identity, %message, "Dropping reported patch after repeated version conflicts");
                                TwinState::pop_if(&mut entry.state.lock().await.pending_reported, pending.id);
                                metrics().reported_patch_dropped();
                                outcome.dropped += 1;
                                break;
                            }
                            conflicts += 1;
                            match proxy.get_twin().await {
                                Ok(document) => {
                                    let mut state = entry.state.lock().await;
                                    state.adopt_document(&document);
                                    base_version = state.reported_version;
                                }
                                Err(e) => {
                                    debug!(%identity, error = %e, "Twin refresh after conflict failed");
                                    break 'queue;
                                }
                            }
                        }
                        Err(e) if e.is_retryable() || e.is_fatal() => {
                            debug!(%identity, error = %e, "Reported patch stays queued");
                            break 'queue;
                        }
                        Err(e) => {
                            warn!(%identity, error = %e, "Dropping reported patch the upstream rejected");
                            TwinState::pop_if(&mut entry.state.lock().await.pending_reported, pending.id);
                            metrics().reported_patch_dropped();
                            outcome.dropped += 1;
                            break;
                        }
                    }
                }
            }
        }

        outcome.pending = entry.state.lock().await.pending_reported.len();
        Ok(outcome)
    }

    /// Current twin: fetched when connected, otherwise the cached copy
    pub async fn get_twin(&self, identity: &Identity) -> HubResult<TwinDocument> {
        let entry = self.entry(identity);
        if let Some(proxy) = self.connections.cloud_proxy(identity).await {
            if proxy.is_connected() {
                match proxy.get_twin().await {
                    Ok(document) => {
                        let mut state = entry.state.lock().await;
                        state.adopt_document(&document);
                        if let Some(version) = document.desired_version() {
                            state.desired_version =
                                Some(state.desired_version.map_or(version, |v| v.max(version)));
                        }
                        if let Some(cached) = state.cached.clone() {
                            return Ok(cached);
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(%identity, error = %e, "Serving cached twin");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let cached = entry.state.lock().await.cached.clone();
        cached.ok_or_else(|| HubError::link_down(format!("no cached twin for {identity}")))
    }

    /// After a reconnect, pick up desired changes missed while offline
    async fn resync_desired(&self, identity: &Identity) {
        let Some(proxy) = self.connections.cloud_proxy(identity).await else {
            return;
        };
        let Some(entry) = self.entries.get(identity).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let Some(local) = entry.state.lock().await.desired_version else {
            return;
        };

        match proxy.get_twin().await {
            Ok(document) => {
                let Some(remote) = document.desired_version() else {
                    return;
                };
                if remote > local {
                    info!(%identity, local, remote, "Desired properties changed while offline");
                    let patch = TwinPatch::new(document.desired.clone());
                    if let Err(e) = self.apply_desired_patch(identity, patch).await {
                        debug!(%identity, error = %e, "Resynced desired patch not delivered yet");
                    }
                }
            }
            Err(e) => debug!(%identity, error = %e, "Desired resync skipped"),
        }
    }

    /// Forget an identity's twin bookkeeping
    pub fn remove(&self, identity: &Identity) {
        self.entries.remove(identity);
    }

    /// Follow hub events: apply desired patches, flush reported patches when
    /// the upstream comes back and desired patches when the device does
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.connections.events().subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(HubEvent::DesiredPropertiesUpdated { identity, patch }) => {
                        // Recorded inline so arrival order is kept
                        if manager.record_desired(&identity, patch).await {
                            manager.spawn_flush_desired(identity);
                        }
                    }
                    Ok(event @ HubEvent::CloudConnectivity { .. }) if event.is_cloud_connected() => {
                        let identity = event.identity().clone();
                        let manager = Arc::clone(&manager);
                        let span = crate::twin_span!(identity = %identity);
                        tokio::spawn(
                            async move {
                                if let Err(e) = manager.flush_reported(&identity).await {
                                    warn!(%identity, error = %e, "Reported flush after reconnect failed");
                                }
                                manager.resync_desired(&identity).await;
                            }
                            .instrument(span),
                        );
                    }
                    Ok(HubEvent::DeviceConnectivity {
                        identity,
                        connected: true,
                    }) => {
                        manager.spawn_flush_desired(identity);
                    }
                    Ok(HubEvent::ConnectionRemoved { identity }) => {
                        debug!(%identity, "Dropping twin state of removed connection");
                        manager.remove(&identity);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Twin manager lagged behind hub events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_flush_desired(self: &Arc<Self>, identity: Identity) {
        let manager = Arc::clone(self);
        let span = crate::twin_span!(identity = %identity);
        tokio::spawn(
            async move {
                if let Err(e) = manager.flush_desired(&identity).await {
                    debug!(%identity, error = %e, "Desired patches stay pending");
                }
            }
            .instrument(span),
        );
    }
}
