//! Publish orchestrator.
//!
//! Runs one upload attempt end to end: session check, change detection,
//! delta preparation, component uploads and the completion wait. Progress
//! and the terminal outcome are reported on an event channel.

use std::sync::Arc;
use std::time::Duration;

use deltapush_protocol::{
    ComponentKind, CreateRecordRequest, CreateVersionRequest, DescriptorDigest, DescriptorStatus,
    RemoteFileRecord, Version,
};
use deltapush_remote::{RemoteFiles, Session};
use deltapush_transfer::{
    TempWorkspace, TransferError, compute_delta, file_digest, generate_signature,
    validate_local_file,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RecordCache;
use crate::cancel::{cancellable, check_cancelled};
use crate::config::PublishConfig;
use crate::error::PublishError;
use crate::mime::detect_mime_type;
use crate::poller::CompletionPoller;
use crate::progress::{ProgressReporter, format_bytes};
use crate::session::{ComponentFile, UploadSession};
use crate::tracker::{RecordTracker, can_delete_latest, find_resumable, validate_descriptor};
use crate::transport::{ComponentUpload, TransportStrategy};
use crate::types::{
    ContentChoice, PublishEvent, PublishOutcome, PublishResult, SessionKind, UploadRequest,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Terminal events wait at most this long for room in the channel.
const TERMINAL_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

// Overall progress bands.
const CONTENT_START: f64 = 0.22;
const CONTENT_END: f64 = 0.80;
const SIGNATURE_END: f64 = 0.88;
const PROCESSING: f64 = 0.90;

/// Publishes local files into records of a versioned-file service.
///
/// Cancellation is sticky: once [`cancel_token`](Self::cancel_token) fires,
/// every later call on this publisher returns [`PublishError::Cancelled`].
pub struct Publisher {
    remote: Arc<dyn RemoteFiles>,
    session: Arc<dyn Session>,
    cache: RecordCache,
    config: PublishConfig,
    events_tx: mpsc::Sender<PublishEvent>,
    events_rx: Option<mpsc::Receiver<PublishEvent>>,
    cancel: CancellationToken,
}

impl Publisher {
    pub fn new(
        remote: Arc<dyn RemoteFiles>,
        session: Arc<dyn Session>,
        config: PublishConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            remote,
            session,
            cache: RecordCache::new(),
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Shares an existing record cache instead of a private one.
    pub fn with_cache(mut self, cache: RecordCache) -> Self {
        self.cache = cache;
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<PublishEvent>> {
        self.events_rx.take()
    }

    /// Returns the cancellation token of this publisher.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Publishes `request.path` and waits until the service has processed it.
    ///
    /// Exactly one terminal event (`Completed`, `Failed` or `Cancelled`)
    /// follows the progress events of the call.
    pub async fn publish(&self, request: UploadRequest) -> Result<PublishResult, PublishError> {
        let name = friendly_name(&request);
        let progress = ProgressReporter::new(self.events_tx.clone(), format!("Publishing {name}"));

        let result = self.run(&request, &name, &progress).await;
        match &result {
            Ok(done) => {
                let version = done.outcome.version();
                progress.report(1.0, "Done", &done.message);
                info!(record = %done.record.id, version, "publish completed");
                self.emit(PublishEvent::Completed {
                    record_id: done.record.id.clone(),
                    version,
                })
                .await;
            }
            Err(e) if e.is_cancelled() => {
                info!(path = %request.path.display(), "publish cancelled");
                self.emit(PublishEvent::Cancelled).await;
            }
            Err(e) => {
                error!(path = %request.path.display(), error = %e, "publish failed");
                self.emit(PublishEvent::Failed {
                    summary: e.summary().to_string(),
                    details: e.to_string(),
                })
                .await;
            }
        }
        result
    }

    async fn emit(&self, event: PublishEvent) {
        if self
            .events_tx
            .send_timeout(event, TERMINAL_EVENT_TIMEOUT)
            .await
            .is_err()
        {
            warn!("terminal event dropped, no receiver is draining events");
        }
    }

    async fn run(
        &self,
        request: &UploadRequest,
        name: &str,
        progress: &ProgressReporter,
    ) -> Result<PublishResult, PublishError> {
        progress.report(0.0, "Checking session", "");
        self.ensure_session().await?;

        progress.report(0.02, "Validating file", &request.path.display().to_string());
        let local = validate_local_file(&request.path)?;
        check_cancelled(&self.cancel)?;

        progress.report(0.04, "Fetching record", "");
        let tracker = RecordTracker::new(self.remote.as_ref(), self.cache.clone(), &self.cancel);
        let create = CreateRecordRequest {
            name: name.to_string(),
            mime_type: request
                .mime_type
                .clone()
                .unwrap_or_else(|| detect_mime_type(&local.extension).to_string()),
            extension: local.extension.clone(),
        };
        let record = tracker
            .fetch_or_create(request.existing_id.as_deref(), &create)
            .await?;

        let workspace = TempWorkspace::create(&self.config.temp_root, &record.id)?;
        let mut session = UploadSession::new(record.id.clone(), local, workspace);
        let result = self
            .run_session(&tracker, &mut session, record, progress)
            .await;
        session.cleanup().await;
        result
    }

    async fn ensure_session(&self) -> Result<(), PublishError> {
        if self.session.is_authenticated() {
            return Ok(());
        }
        debug!("not logged in, attempting login");
        match cancellable(&self.cancel, self.session.login()).await {
            Ok(()) => {}
            Err(PublishError::Cancelled) => return Err(PublishError::Cancelled),
            Err(e) => return Err(PublishError::NotInitialized(e.to_string())),
        }
        if self.session.is_authenticated() {
            Ok(())
        } else {
            Err(PublishError::NotInitialized(
                "login finished without a session".into(),
            ))
        }
    }

    async fn run_session(
        &self,
        tracker: &RecordTracker<'_>,
        session: &mut UploadSession,
        mut record: RemoteFileRecord,
        progress: &ProgressReporter,
    ) -> Result<PublishResult, PublishError> {
        if record.is_in_error_state() {
            record = self.discard_errored_version(tracker, record).await?;
        }

        progress.report(0.08, "Computing digest", &format_bytes(session.size()));
        let digest = file_digest(session.path(), &self.cancel).await?;
        debug!(record = %record.id, digest = %digest, bytes = session.size(), "local digest computed");
        session.set_digest(digest);

        if let Some(latest) = record.latest_version() {
            let same = latest
                .descriptor(ComponentKind::Primary)
                .is_some_and(|d| d.matches(session.digest(), session.size()));
            if same && latest.is_complete() {
                let version = latest.version;
                info!(record = %record.id, version, "content already published");
                return Ok(PublishResult {
                    outcome: PublishOutcome::AlreadyUpToDate { version },
                    message: format!("Version {version} already holds this content"),
                    record,
                });
            }
        }

        let kind = match find_resumable(&record, session.digest(), session.size()) {
            Some(prior_version) => {
                info!(record = %record.id, version = prior_version, "resuming interrupted upload");
                SessionKind::Resume { prior_version }
            }
            None => SessionKind::Fresh,
        };
        session.set_kind(kind);

        let version = match kind {
            SessionKind::Fresh => {
                self.start_version(tracker, session, &mut record, progress)
                    .await?
            }
            SessionKind::Resume { prior_version } => {
                self.resume_version(session, &record, prior_version, progress)
                    .await?;
                prior_version
            }
        };
        session.set_version(version);

        let record = self
            .upload_components(tracker, session, record, progress)
            .await?;
        verify_components(&record, session)?;

        progress.report(PROCESSING, "Waiting for server processing", "");
        let record = self.wait_for_version(tracker, session).await?;

        let message = format!(
            "Uploaded version {version} ({} sent)",
            format_bytes(session.bytes_sent())
        );
        Ok(PublishResult {
            record,
            outcome: PublishOutcome::Uploaded { version },
            message,
        })
    }

    async fn discard_errored_version(
        &self,
        tracker: &RecordTracker<'_>,
        record: RemoteFileRecord,
    ) -> Result<RemoteFileRecord, PublishError> {
        let latest = record.latest_version_number();
        if !record.latest_version().is_some_and(Version::has_error) {
            warn!(record = %record.id, version = latest, "record flagged as errored, latest version is intact");
            return Ok(record);
        }
        if !can_delete_latest(&record) {
            warn!(record = %record.id, version = latest, "errored version cannot be deleted, appending a new one");
            return Ok(record);
        }
        warn!(record = %record.id, version = latest, "deleting errored version");
        tracker.delete_latest_version(&record).await
    }

    /// Prepares the signature and content, then creates the version.
    async fn start_version(
        &self,
        tracker: &RecordTracker<'_>,
        session: &mut UploadSession,
        record: &mut RemoteFileRecord,
        progress: &ProgressReporter,
    ) -> Result<u32, PublishError> {
        if record.is_waiting_for_upload() {
            let stale = record.latest_version_number();
            if can_delete_latest(record) {
                info!(record = %record.id, version = stale, "discarding stale waiting version");
                *record = tracker.delete_latest_version(record).await?;
            } else {
                warn!(record = %record.id, version = stale, "only version waits for other content, appending a new one");
            }
        }

        progress.report(0.12, "Generating signature", "");
        let signature = self.generate_signature(session).await?;

        progress.report(0.16, "Computing delta", "");
        let reference = record.latest_complete_version();
        let content = match reference {
            Some(reference) if self.config.delta_enabled => self
                .prepare_delta(session, reference)
                .await?
                .unwrap_or(ContentChoice::Full),
            Some(_) => {
                debug!(record = %record.id, "delta disabled, sending full content");
                ContentChoice::Full
            }
            None => ContentChoice::Full,
        };
        session.set_content(content);

        progress.report(0.20, "Creating version", "");
        let delta = match session.content() {
            ContentChoice::Full => None,
            ContentChoice::Delta { digest, size, .. } => Some(DescriptorDigest {
                digest: digest.clone(),
                size_in_bytes: *size,
            }),
        };
        let req = CreateVersionRequest {
            file_digest: session.digest().to_string(),
            file_size_in_bytes: session.size(),
            signature_digest: signature.digest.clone(),
            signature_size_in_bytes: signature.size,
            delta,
        };
        session.set_signature(signature);

        let (updated, version) = tracker.create_version(record, &req).await?;
        *record = updated;
        Ok(version)
    }

    /// Rebuilds the local files a waiting version still needs.
    async fn resume_version(
        &self,
        session: &mut UploadSession,
        record: &RemoteFileRecord,
        prior_version: u32,
        progress: &ProgressReporter,
    ) -> Result<(), PublishError> {
        let version = record.version(prior_version).ok_or_else(|| {
            PublishError::InvalidState(format!("record {} lost version {prior_version}", record.id))
        })?;

        if version.descriptor_status(ComponentKind::Signature) != DescriptorStatus::Complete {
            progress.report(0.12, "Generating signature", "");
            let signature = self.generate_signature(session).await?;
            session.set_signature(signature);
        }

        let Some(delta) = version.descriptor(ComponentKind::Delta) else {
            session.set_content(ContentChoice::Full);
            return Ok(());
        };
        let path = session.workspace().delta_path();
        if delta.is_complete() {
            session.set_content(ContentChoice::Delta {
                path,
                digest: delta.digest.clone(),
                size: delta.size_in_bytes,
            });
            return Ok(());
        }

        progress.report(0.16, "Computing delta", "");
        let reference = record
            .live_versions()
            .filter(|v| v.version < prior_version && v.is_complete())
            .max_by_key(|v| v.version)
            .ok_or_else(|| {
                PublishError::InvalidState(format!(
                    "version {prior_version} expects a delta but no earlier version is complete"
                ))
            })?;
        let content = self.prepare_delta(session, reference).await?.ok_or_else(|| {
            PublishError::InvalidState(format!(
                "signature of version {} is unavailable for the resumed delta",
                reference.version
            ))
        })?;
        session.set_content(content);
        Ok(())
    }

    async fn generate_signature(
        &self,
        session: &UploadSession,
    ) -> Result<ComponentFile, PublishError> {
        let path = generate_signature(
            session.path(),
            &session.workspace().signature_path(),
            self.config.block_size,
            &self.cancel,
        )
        .await?;
        let size = tokio::fs::metadata(&path).await?.len();
        let digest = file_digest(&path, &self.cancel).await?;
        debug!(record = %session.record_id(), bytes = size, "signature generated");
        Ok(ComponentFile { path, size, digest })
    }

    /// Computes a delta against `reference`.
    ///
    /// Returns `None` when the reference signature cannot be fetched or the
    /// delta is not smaller than the file itself.
    async fn prepare_delta(
        &self,
        session: &UploadSession,
        reference: &Version,
    ) -> Result<Option<ContentChoice>, PublishError> {
        let Some(signature) = reference
            .descriptor(ComponentKind::Signature)
            .filter(|d| d.is_complete() && !d.url.is_empty())
        else {
            debug!(version = reference.version, "previous version has no signature to diff against");
            return Ok(None);
        };

        let reference_path = session.workspace().reference_signature_path();
        match cancellable(
            &self.cancel,
            self.remote.download(&signature.url, &reference_path),
        )
        .await
        {
            Ok(bytes) => debug!(version = reference.version, bytes, "reference signature downloaded"),
            Err(PublishError::Cancelled) => return Err(PublishError::Cancelled),
            Err(e) => {
                warn!(version = reference.version, error = %e, "reference signature unavailable, sending full content");
                return Ok(None);
            }
        }

        let path = compute_delta(
            session.path(),
            &reference_path,
            &session.workspace().delta_path(),
            &self.cancel,
        )
        .await
        .map_err(delta_failure)?;
        let size = tokio::fs::metadata(&path).await?.len();
        if size == 0 || size >= session.size() {
            debug!(delta = size, full = session.size(), "delta not smaller, sending full content");
            return Ok(None);
        }

        let digest = file_digest(&path, &self.cancel).await?;
        info!(
            record = %session.record_id(),
            against = reference.version,
            delta = size,
            full = session.size(),
            "sending delta"
        );
        Ok(Some(ContentChoice::Delta { path, digest, size }))
    }

    /// Uploads the content component, then the signature, skipping any the
    /// server already completed.
    async fn upload_components(
        &self,
        tracker: &RecordTracker<'_>,
        session: &mut UploadSession,
        mut record: RemoteFileRecord,
        progress: &ProgressReporter,
    ) -> Result<RemoteFileRecord, PublishError> {
        let number = session_version(session)?;
        let steps = [
            (
                session.content_kind(),
                Some(session.content_payload()),
                true,
                CONTENT_START,
                CONTENT_END,
                "Uploading content",
            ),
            (
                ComponentKind::Signature,
                session.signature().cloned(),
                !session.is_resume(),
                CONTENT_END,
                SIGNATURE_END,
                "Uploading signature",
            ),
        ];

        for (kind, payload, validate, start, end, status) in steps {
            check_cancelled(&self.cancel)?;
            let version = record.version(number).ok_or_else(|| {
                PublishError::InvalidState(format!("record {} lost version {number}", record.id))
            })?;
            let descriptor = version.descriptor(kind).ok_or_else(|| PublishError::RecordMismatch {
                version: number,
                kind,
                detail: "descriptor missing".into(),
            })?;
            match descriptor.status {
                DescriptorStatus::Complete => {
                    debug!(record = %record.id, version = number, kind = %kind, "component already complete");
                    progress.report(end, status, "already on server");
                    continue;
                }
                DescriptorStatus::Error => {
                    return Err(PublishError::ServerProcessing(format!(
                        "{kind} of version {number}"
                    )));
                }
                DescriptorStatus::Waiting | DescriptorStatus::None => {}
            }

            let Some(payload) = payload else {
                return Err(PublishError::InvalidState(format!(
                    "no local file prepared for the {kind} of version {number}"
                )));
            };
            if validate {
                validate_descriptor(version, kind, &payload.digest, payload.size)?;
            } else {
                debug!(record = %record.id, version = number, kind = %kind, "resumed component not re-validated");
            }

            let strategy =
                TransportStrategy::for_category(descriptor.category, self.config.multipart_chunk_size);
            let component = ComponentUpload {
                record_id: session.record_id(),
                version: number,
                kind,
                path: &payload.path,
                size: payload.size,
                digest: &payload.digest,
            };
            let report = strategy
                .upload(
                    self.remote.as_ref(),
                    &component,
                    progress.byte_progress(start, end, status),
                    &self.cancel,
                )
                .await?;
            info!(
                record = %session.record_id(),
                version = number,
                kind = %kind,
                bytes = report.bytes_sent,
                skipped = report.parts_skipped,
                "component uploaded"
            );
            self.cache.insert(&report.record);
            session.add_bytes_sent(report.bytes_sent);
            session.record_parts(kind, report.parts);

            progress.report(end, &format!("Waiting for {kind} processing"), "");
            record = self
                .wait_for_component(tracker, session.record_id(), number, kind, payload.size)
                .await?;
        }
        Ok(record)
    }

    async fn wait_for_component(
        &self,
        tracker: &RecordTracker<'_>,
        record_id: &str,
        version: u32,
        kind: ComponentKind,
        size: u64,
    ) -> Result<RemoteFileRecord, PublishError> {
        let poller = CompletionPoller::new(&self.config.poll, &self.cancel);
        let what = format!("{kind} of version {version}");
        poller
            .wait(&what, size, move || {
                component_ready(tracker, record_id, version, kind)
            })
            .await
    }

    async fn wait_for_version(
        &self,
        tracker: &RecordTracker<'_>,
        session: &UploadSession,
    ) -> Result<RemoteFileRecord, PublishError> {
        let version = session_version(session)?;
        let record_id = session.record_id();
        let poller = CompletionPoller::new(&self.config.poll, &self.cancel);
        let what = format!("version {version}");
        poller
            .wait(&what, session.content_payload().size, move || {
                version_ready(tracker, record_id, version)
            })
            .await
    }
}

fn friendly_name(request: &UploadRequest) -> String {
    let name = request.friendly_name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    request
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.path.display().to_string())
}

/// Any failure to produce a delta, unreadable inputs included, is a
/// [`PublishError::Delta`].
fn delta_failure(e: TransferError) -> PublishError {
    match e {
        TransferError::Cancelled => PublishError::Cancelled,
        e => PublishError::Delta(e.to_string()),
    }
}

fn session_version(session: &UploadSession) -> Result<u32, PublishError> {
    session
        .version()
        .ok_or_else(|| PublishError::InvalidState("no version selected for upload".into()))
}

async fn component_ready(
    tracker: &RecordTracker<'_>,
    record_id: &str,
    version: u32,
    kind: ComponentKind,
) -> Result<Option<RemoteFileRecord>, PublishError> {
    let (record, status) = tracker.component_status(record_id, version, kind).await?;
    match status {
        DescriptorStatus::Complete => Ok(Some(record)),
        DescriptorStatus::Error => Err(PublishError::ServerProcessing(format!(
            "{kind} of version {version}"
        ))),
        DescriptorStatus::Waiting | DescriptorStatus::None => Ok(None),
    }
}

async fn version_ready(
    tracker: &RecordTracker<'_>,
    record_id: &str,
    version: u32,
) -> Result<Option<RemoteFileRecord>, PublishError> {
    let (record, status) = tracker.version_status(record_id, version).await?;
    match status {
        DescriptorStatus::Complete => Ok(Some(record)),
        DescriptorStatus::Error => Err(PublishError::ServerProcessing(format!(
            "version {version}"
        ))),
        DescriptorStatus::Waiting | DescriptorStatus::None => Ok(None),
    }
}

/// Both uploaded components must be complete. A full upload must not leave
/// a delta the server is still waiting for.
fn verify_components(record: &RemoteFileRecord, session: &UploadSession) -> Result<(), PublishError> {
    let number = session_version(session)?;
    let version = record.version(number).ok_or_else(|| {
        PublishError::InvalidState(format!("record {} lost version {number}", record.id))
    })?;
    for kind in [session.content_kind(), ComponentKind::Signature] {
        let status = version.descriptor_status(kind);
        if status != DescriptorStatus::Complete {
            return Err(PublishError::InvalidState(format!(
                "{kind} of version {number} is {status:?} after upload"
            )));
        }
    }
    if session.content_kind() == ComponentKind::Primary
        && version.descriptor_status(ComponentKind::Delta) == DescriptorStatus::Waiting
    {
        return Err(PublishError::InvalidState(format!(
            "delta of version {number} is still waiting after a full upload"
        )));
    }
    Ok(())
}
