//! Resumable firmware update
//!
//! [`UpdateManager::run`] is one update procedure: up to `ota_attempts`
//! GETs against the image URL, each resuming with `Range: bytes=<n>-` once
//! bytes have been written. [`run_update_task`] wraps it in the task-level
//! retry and always ends in a restart unless there was nothing to install.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use data_encoding::HEXLOWER_PERMISSIVE;
use devlink_mcu::FirmwareTarget;
use futures::StreamExt;
use log::*;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::config::DeviceConfig;
use crate::context::{DeviceContext, RestartReason};
use crate::error::{DeviceError, ProtocolError, StorageError, TransportError};
use crate::http::HttpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaPhase {
    #[default]
    Idle,
    Requesting,
    Downloading,
    Resuming,
    Finalizing,
    Succeeded,
    Failed,
}

/// Progress of one update sequence
///
/// Kept across transport attempts and task-level tries; lost on restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OtaState {
    pub url: String,
    pub total_length: u64,
    pub completed_length: u64,
    pub attempts_used: u32,
    pub phase: OtaPhase,
}

impl OtaState {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Default::default() }
    }

    /// Whether the write target has been opened for this image
    pub fn started(&self) -> bool {
        self.total_length > 0
    }

    pub fn percent(&self) -> u8 {
        if self.total_length == 0 {
            return 0;
        }
        (self.completed_length.min(self.total_length) * 100 / self.total_length) as u8
    }

    fn reset(&mut self) {
        self.total_length = 0;
        self.completed_length = 0;
        self.phase = OtaPhase::Idle;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpdateOk,
    /// Server had no image for us (304, 204 or an empty body)
    NoUpdate,
    BadUrl,
    NoSpace,
    Fail,
}

/// Payload of `command/<id>/upgrade`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub url: String,
    pub sha256: Option<[u8; 32]>,
}

#[derive(serde::Deserialize)]
struct UpgradeDocument {
    #[serde(default)]
    url: String,
    #[serde(default)]
    sha256: Option<String>,
}

impl UpdateRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), sha256: None }
    }

    /// Either a bare URL or `{"url": "...", "sha256": "<hex>"}`
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();

        if !text.starts_with('{') {
            return Ok(Self::new(text));
        }

        let doc: UpgradeDocument = serde_json::from_str(text)?;
        let sha256 = match doc.sha256.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(hex) => {
                let bytes = HEXLOWER_PERMISSIVE
                    .decode(hex.as_bytes())
                    .map_err(|e| ProtocolError::Digest(e.to_string()))?;
                let digest = <[u8; 32]>::try_from(bytes.as_slice())
                    .map_err(|_| ProtocolError::Digest(format!("{} bytes, expected 32", bytes.len())))?;
                Some(digest)
            }
        };
        Ok(Self { url: doc.url.trim().to_string(), sha256 })
    }
}

trait DynTarget: Send {
    fn begin(&mut self, total_len: u64) -> Result<(), String>;
    fn write(&mut self, chunk: &[u8]) -> Result<usize, String>;
    fn finalize(&mut self, sha256: Option<&[u8; 32]>) -> Result<(), String>;
    fn abort(&mut self);
}

impl<T: FirmwareTarget + Send> DynTarget for T {
    fn begin(&mut self, total_len: u64) -> Result<(), String> {
        FirmwareTarget::begin(self, total_len).map_err(|e| e.to_string())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, String> {
        FirmwareTarget::write(self, chunk).map_err(|e| e.to_string())
    }

    fn finalize(&mut self, sha256: Option<&[u8; 32]>) -> Result<(), String> {
        FirmwareTarget::finalize(self, sha256).map_err(|e| e.to_string())
    }

    fn abort(&mut self) {
        FirmwareTarget::abort(self)
    }
}

/// Rate-limited progress reporting
struct Progress {
    interval: Duration,
    last: Option<Instant>,
    callback: Box<dyn FnMut(u8) + Send>,
}

impl Progress {
    fn report(&mut self, percent: u8) {
        let now = Instant::now();
        if self.last.is_some_and(|t| now.duration_since(t) < self.interval) {
            return;
        }
        self.last = Some(now);
        (self.callback)(percent);
    }
}

enum Step {
    Complete,
    Incomplete,
    NoUpdate,
}

/// Downloads an image into a [`FirmwareTarget`]
pub struct UpdateManager {
    http: Arc<dyn HttpClient>,
    target: Box<dyn DynTarget>,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
    chunk_size: usize,
    state: OtaState,
    progress: Progress,
}

impl UpdateManager {
    pub fn new<T: FirmwareTarget + Send + 'static>(http: Arc<dyn HttpClient>, target: T, config: &DeviceConfig) -> Self {
        Self {
            http,
            target: Box::new(target),
            attempts: config.ota_attempts,
            retry_delay: config.ota_retry_delay(),
            timeout: config.ota_timeout(),
            chunk_size: config.ota_chunk_size.max(1),
            state: OtaState::default(),
            progress: Progress {
                interval: config.ota_progress_interval(),
                last: None,
                callback: Box::new(|p| info!("Update progress: {}%", p)),
            },
        }
    }

    /// Continue from a known state, e.g. an interrupted download whose
    /// target is still open
    pub fn with_state(mut self, state: OtaState) -> Self {
        self.state = state;
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(u8) + Send + 'static) -> Self {
        self.progress.callback = Box::new(callback);
        self
    }

    pub fn state(&self) -> &OtaState {
        &self.state
    }

    /// One update procedure
    pub async fn run(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        if request.url.is_empty() {
            error!("Update requested without a URL");
            self.state.phase = OtaPhase::Failed;
            return UpdateOutcome::BadUrl;
        }
        if self.state.url != request.url {
            if self.state.started() {
                self.target.abort();
            }
            self.state = OtaState::new(request.url.as_str());
        }

        self.state.attempts_used = 0;
        while self.state.attempts_used < self.attempts {
            match self.attempt().await {
                Ok(Step::Complete) => return self.finalize(request),
                Ok(Step::NoUpdate) => {
                    info!("No update available at {}", request.url);
                    self.state.reset();
                    return UpdateOutcome::NoUpdate;
                }
                Ok(Step::Incomplete) => {
                    info!(
                        "Download interrupted at {} of {} bytes",
                        self.state.completed_length, self.state.total_length
                    );
                }
                Err(DeviceError::Storage(StorageError::NoSpace(len))) => {
                    error!("No room for a {} byte image", len);
                    self.state.reset();
                    self.state.phase = OtaPhase::Failed;
                    return UpdateOutcome::NoSpace;
                }
                Err(e) => warn!("Update attempt {} failed: {}", self.state.attempts_used + 1, e),
            }

            self.state.attempts_used += 1;
            if self.state.attempts_used < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!("Update failed after {} attempts", self.attempts);
        self.state.phase = OtaPhase::Failed;
        UpdateOutcome::Fail
    }

    async fn attempt(&mut self) -> Result<Step, DeviceError> {
        let resuming = self.state.started() && self.state.completed_length > 0;
        let range = resuming.then_some(self.state.completed_length);

        self.state.phase = if resuming { OtaPhase::Resuming } else { OtaPhase::Requesting };
        if resuming {
            info!("Resuming from byte {}", self.state.completed_length);
        }

        let resp = self.http.get(&self.state.url, range, self.timeout).await?;
        debug!("Attempt {}, HTTP status {}", self.state.attempts_used + 1, resp.status);

        if !self.state.started() {
            if resp.status == 304 || resp.status == 204 {
                return Ok(Step::NoUpdate);
            }
            if resp.status != 200 && resp.status != 206 {
                return Err(TransportError::Status(resp.status).into());
            }
            let total = match resp.content_length {
                Some(0) => return Ok(Step::NoUpdate),
                Some(n) => n,
                None => {
                    warn!("Server did not report the image size");
                    return Err(TransportError::Status(resp.status).into());
                }
            };
            self.target.begin(total).map_err(|e| {
                warn!("Flash begin failed: {}", e);
                StorageError::NoSpace(total)
            })?;
            info!("Image size {} bytes", total);
            self.state.total_length = total;
            self.state.completed_length = 0;
            self.state.phase = OtaPhase::Downloading;
        } else if resp.status != 200 && resp.status != 206 {
            return Err(TransportError::Status(resp.status).into());
        }

        // a 200 to a ranged request restarts from byte zero
        let mut skip = if resuming && resp.status == 200 { self.state.completed_length } else { 0 };

        let mut body = resp.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let mut data = chunk.as_slice();
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }

            for piece in data.chunks(self.chunk_size) {
                let remaining = self.state.total_length.saturating_sub(self.state.completed_length);
                if remaining == 0 {
                    break;
                }
                let piece = &piece[..piece.len().min(remaining as usize)];

                let written = self.target.write(piece).map_err(StorageError::Backend)?;
                // never account for more than was handed over
                self.state.completed_length += written.min(piece.len()) as u64;
                if written != piece.len() {
                    return Err(StorageError::WriteMismatch { written, expected: piece.len() }.into());
                }
                self.progress.report(self.state.percent());
            }
        }

        if self.state.completed_length >= self.state.total_length {
            Ok(Step::Complete)
        } else {
            Ok(Step::Incomplete)
        }
    }

    fn finalize(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        self.state.phase = OtaPhase::Finalizing;
        self.progress.last = None;
        self.progress.report(100);

        match self.target.finalize(request.sha256.as_ref()) {
            Ok(()) => {
                info!("Update written ({} bytes)", self.state.total_length);
                self.state.phase = OtaPhase::Succeeded;
                UpdateOutcome::UpdateOk
            }
            Err(e) => {
                error!("Image rejected: {}", e);
                self.target.abort();
                self.state.reset();
                UpdateOutcome::Fail
            }
        }
    }
}

/// Task-level retry around [`UpdateManager::run`]
///
/// The caller must already hold the update flag (`DeviceContext::begin_update`).
/// Ends with a restart request unless nothing was downloaded.
pub async fn run_update_task(ctx: Arc<DeviceContext>, mut manager: UpdateManager, request: UpdateRequest) -> UpdateOutcome {
    let tries = ctx.config().ota_task_attempts.max(1);
    let delay = ctx.config().ota_task_retry_delay();
    info!("Starting update from {}", request.url);

    let mut outcome = UpdateOutcome::Fail;
    for attempt in 1..=tries {
        outcome = manager.run(&request).await;
        info!("Update try {} of {}: {:?}", attempt, tries, outcome);

        match outcome {
            UpdateOutcome::UpdateOk => {
                ctx.request_restart(RestartReason::UpdateApplied);
                return outcome;
            }
            UpdateOutcome::NoUpdate | UpdateOutcome::BadUrl => {
                ctx.end_update();
                return outcome;
            }
            UpdateOutcome::NoSpace | UpdateOutcome::Fail => {
                if attempt < tries {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    error!("Update failed after all tries");
    ctx.request_restart(RestartReason::UpdateFailed);
    outcome
}

/// Firmware target writing to a file, for hosts
///
/// The image goes to `<path>.part` and is renamed into place on finalize.
pub struct FileFirmware {
    path: PathBuf,
    capacity: u64,
    file: Option<File>,
    hasher: Sha256,
    expected: u64,
    written: u64,
}

impl FileFirmware {
    pub fn new(path: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            path: path.into(),
            capacity,
            file: None,
            hasher: Sha256::new(),
            expected: 0,
            written: 0,
        }
    }

    fn part_path(&self) -> PathBuf {
        self.path.with_extension("part")
    }
}

impl FirmwareTarget for FileFirmware {
    type Error = StorageError;

    fn begin(&mut self, total_len: u64) -> Result<(), StorageError> {
        if total_len > self.capacity {
            return Err(StorageError::NoSpace(total_len));
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.part_path())?;
        self.file = Some(file);
        self.hasher = Sha256::new();
        self.expected = total_len;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Backend("image not started".to_string()))?;
        file.write_all(chunk)?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(chunk.len())
    }

    fn finalize(&mut self, sha256: Option<&[u8; 32]>) -> Result<(), StorageError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StorageError::Finalize("image not started".to_string()))?;
        file.flush()?;
        drop(file);

        if self.written != self.expected {
            return Err(StorageError::Finalize(format!("{} of {} bytes written", self.written, self.expected)));
        }
        let digest: [u8; 32] = std::mem::take(&mut self.hasher).finalize().into();
        if let Some(expected) = sha256 {
            if &digest != expected {
                return Err(StorageError::Finalize("sha256 mismatch".to_string()));
            }
        }
        fs::rename(self.part_path(), &self.path)?;
        Ok(())
    }

    fn abort(&mut self) {
        self.file = None;
        let _ = fs::remove_file(self.part_path());
    }
}
