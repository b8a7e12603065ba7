//! In-memory versioned-file service for tests.
//!
//! Models the server side of the record state machine: signed URLs,
//! digest-verified simple PUTs, ordered multipart parts with etags, delta
//! reconstruction and delayed processing. Failure injection and PUT
//! counters let tests check what went over the wire.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use deltapush_protocol::{
    ComponentKind, CreateRecordRequest, CreateVersionRequest, DescriptorStatus, FileCategory,
    FileDescriptor, FinishUploadRequest, RemoteFileRecord, UploadStatus, Version,
};
use deltapush_remote::{ByteProgress, RemoteError, RemoteFiles, RemoteFuture, Session};
use deltapush_transfer::{
    DEFAULT_BLOCK_SIZE, PartPlan, Signature, apply_delta_bytes, checksum_bytes, digest_base64,
};

type ComponentKey = (String, u32, ComponentKind);

struct Target {
    key: ComponentKey,
    part: Option<u32>,
}

#[derive(Default)]
struct PendingUpload {
    parts: Vec<Vec<u8>>,
    etags: Vec<String>,
    max_parts: u32,
    simple: Option<Vec<u8>>,
}

struct State {
    records: HashMap<String, RemoteFileRecord>,
    next_record: u32,
    next_url: u32,
    signed: HashMap<String, Target>,
    uploads: HashMap<ComponentKey, PendingUpload>,
    blobs: HashMap<ComponentKey, Vec<u8>>,
    downloads: HashMap<String, Vec<u8>>,
    processing: Vec<(ComponentKey, u32)>,
    multipart_threshold: u64,
    chunk_size: u64,
    processing_rounds: u32,
    fail_processing: bool,
    interrupt_after: Option<u32>,
    fail_downloads: bool,
    puts: u32,
    put_bytes: u64,
    create_version_calls: u32,
    delete_calls: u32,
}

pub(crate) struct MemoryRemote {
    state: Mutex<State>,
    authenticated: AtomicBool,
    allow_login: bool,
}

fn api(status: u16, body: &str) -> RemoteError {
    RemoteError::Api {
        status,
        body: body.to_string(),
    }
}

impl MemoryRemote {
    /// Logged-in service; components of 1 MiB or more go multipart in
    /// 1 MiB parts.
    pub(crate) fn new() -> Self {
        Self::with_parts(1024 * 1024, 1024 * 1024)
    }

    pub(crate) fn with_parts(multipart_threshold: u64, chunk_size: u64) -> Self {
        Self {
            state: Mutex::new(State {
                records: HashMap::new(),
                next_record: 1,
                next_url: 1,
                signed: HashMap::new(),
                uploads: HashMap::new(),
                blobs: HashMap::new(),
                downloads: HashMap::new(),
                processing: Vec::new(),
                multipart_threshold,
                chunk_size,
                processing_rounds: 0,
                fail_processing: false,
                interrupt_after: None,
                fail_downloads: false,
                puts: 0,
                put_bytes: 0,
                create_version_calls: 0,
                delete_calls: 0,
            }),
            authenticated: AtomicBool::new(true),
            allow_login: true,
        }
    }

    pub(crate) fn logged_out(allow_login: bool) -> Self {
        let remote = Self {
            allow_login,
            ..Self::new()
        };
        remote.authenticated.store(false, Ordering::Release);
        remote
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn empty_record(&self, name: &str) -> String {
        self.with(|s| {
            s.create_record(&CreateRecordRequest {
                name: name.into(),
                mime_type: "application/octet-stream".into(),
                extension: ".bin".into(),
            })
            .id
        })
    }

    pub(crate) fn record(&self, id: &str) -> Option<RemoteFileRecord> {
        self.with(|s| s.records.get(id).cloned())
    }

    /// Appends a waiting version without counting a client call.
    pub(crate) fn push_version(&self, record_id: &str, req: &CreateVersionRequest) -> u32 {
        self.with(|s| s.push_version(record_id, req))
            .unwrap()
            .latest_version_number()
    }

    /// Appends a fully processed version holding `content`, with a
    /// downloadable signature.
    pub(crate) fn seed_complete_version(&self, record_id: &str, content: &[u8]) -> u32 {
        let mut sig = Vec::new();
        Signature::from_bytes(content, DEFAULT_BLOCK_SIZE)
            .write_to(&mut sig)
            .unwrap();
        let req = CreateVersionRequest {
            file_digest: checksum_bytes(content),
            file_size_in_bytes: content.len() as u64,
            signature_digest: checksum_bytes(&sig),
            signature_size_in_bytes: sig.len() as u64,
            delta: None,
        };
        self.with(|s| {
            let version = s.push_version(record_id, &req).unwrap().latest_version_number();
            for (kind, data) in [
                (ComponentKind::Primary, content.to_vec()),
                (ComponentKind::Signature, sig),
            ] {
                let key = (record_id.to_string(), version, kind);
                s.blobs.insert(key.clone(), data);
                s.complete(&key);
            }
            version
        })
    }

    /// Marks the latest version of `record_id` as failed.
    pub(crate) fn break_latest_version(&self, record_id: &str) {
        self.with(|s| {
            let record = s.records.get_mut(record_id).unwrap();
            let version = record.versions.iter_mut().rev().find(|v| !v.deleted).unwrap();
            version.status = DescriptorStatus::Error;
            if let Some(d) = version.primary.as_mut() {
                d.status = DescriptorStatus::Error;
            }
        });
    }

    /// Fails every PUT once `n` PUTs succeeded.
    pub(crate) fn interrupt_after_puts(&self, n: Option<u32>) {
        self.with(|s| s.interrupt_after = n);
    }

    /// Number of fetches a finished component stays `Waiting`.
    pub(crate) fn set_processing_rounds(&self, rounds: u32) {
        self.with(|s| s.processing_rounds = rounds);
    }

    pub(crate) fn fail_processing(&self, fail: bool) {
        self.with(|s| s.fail_processing = fail);
    }

    pub(crate) fn fail_downloads(&self, fail: bool) {
        self.with(|s| s.fail_downloads = fail);
    }

    pub(crate) fn reset_counters(&self) {
        self.with(|s| {
            s.puts = 0;
            s.put_bytes = 0;
            s.create_version_calls = 0;
            s.delete_calls = 0;
        });
    }

    pub(crate) fn put_count(&self) -> u32 {
        self.with(|s| s.puts)
    }

    pub(crate) fn put_bytes_total(&self) -> u64 {
        self.with(|s| s.put_bytes)
    }

    pub(crate) fn create_version_calls(&self) -> u32 {
        self.with(|s| s.create_version_calls)
    }

    pub(crate) fn delete_calls(&self) -> u32 {
        self.with(|s| s.delete_calls)
    }
}

impl State {
    fn create_record(&mut self, req: &CreateRecordRequest) -> RemoteFileRecord {
        let id = format!("rec-{}", self.next_record);
        self.next_record += 1;
        let record = RemoteFileRecord {
            id: id.clone(),
            name: req.name.clone(),
            mime_type: req.mime_type.clone(),
            extension: req.extension.clone(),
            versions: Vec::new(),
            error: false,
        };
        self.records.insert(id, record.clone());
        record
    }

    fn record(&self, id: &str) -> Result<&RemoteFileRecord, RemoteError> {
        self.records.get(id).ok_or_else(|| api(404, "no such record"))
    }

    fn version_mut(&mut self, id: &str, number: u32) -> Result<&mut Version, RemoteError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| api(404, "no such record"))?
            .versions
            .iter_mut()
            .find(|v| v.version == number && !v.deleted)
            .ok_or_else(|| api(404, "no such version"))
    }

    fn descriptor_mut(&mut self, key: &ComponentKey) -> Result<&mut FileDescriptor, RemoteError> {
        let version = self.version_mut(&key.0, key.1)?;
        match key.2 {
            ComponentKind::Primary => version.primary.as_mut(),
            ComponentKind::Delta => version.delta.as_mut(),
            ComponentKind::Signature => version.signature.as_mut(),
        }
        .ok_or_else(|| api(404, "no such component"))
    }

    fn category(&self, size: u64) -> FileCategory {
        if size >= self.multipart_threshold {
            FileCategory::Multipart
        } else {
            FileCategory::Simple
        }
    }

    fn waiting(&self, digest: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            category: self.category(size),
            status: DescriptorStatus::Waiting,
            digest: digest.to_string(),
            size_in_bytes: size,
            ..FileDescriptor::default()
        }
    }

    fn push_version(
        &mut self,
        record_id: &str,
        req: &CreateVersionRequest,
    ) -> Result<RemoteFileRecord, RemoteError> {
        let primary = self.waiting(&req.file_digest, req.file_size_in_bytes);
        let signature = self.waiting(&req.signature_digest, req.signature_size_in_bytes);
        let delta = req
            .delta
            .as_ref()
            .map(|d| self.waiting(&d.digest, d.size_in_bytes));

        let record = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| api(404, "no such record"))?;
        let number = record.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        record.versions.push(Version {
            version: number,
            status: DescriptorStatus::Waiting,
            deleted: false,
            primary: Some(primary),
            delta,
            signature: Some(signature),
            created_at: String::new(),
        });
        Ok(record.clone())
    }

    fn tick_processing(&mut self) {
        let mut due = Vec::new();
        for (key, rounds) in &mut self.processing {
            *rounds = rounds.saturating_sub(1);
            if *rounds == 0 {
                due.push(key.clone());
            }
        }
        self.processing.retain(|(_, rounds)| *rounds > 0);
        for key in due {
            self.complete(&key);
        }
    }

    /// Finishes server-side processing of a component whose bytes are in
    /// `blobs`.
    fn complete(&mut self, key: &ComponentKey) {
        let (record_id, number, kind) = key.clone();
        let url = format!("mem://blob/{record_id}/{number}/{kind}");
        let data = self.blobs.get(key).cloned().unwrap_or_default();
        self.downloads.insert(url.clone(), data.clone());
        if let Ok(d) = self.descriptor_mut(key) {
            d.status = DescriptorStatus::Complete;
            d.url = url;
        }

        if kind == ComponentKind::Delta {
            self.reconstruct_primary(&record_id, number, &data);
        }

        if let Ok(version) = self.version_mut(&record_id, number) {
            let done = |d: &Option<FileDescriptor>| d.as_ref().is_some_and(|d| d.is_complete());
            if done(&version.primary) && done(&version.signature) {
                version.status = DescriptorStatus::Complete;
            }
        }
    }

    /// Applies a delta to the previous complete version and checks the
    /// result against the announced full digest.
    fn reconstruct_primary(&mut self, record_id: &str, number: u32, delta: &[u8]) {
        let reference = self.records.get(record_id).and_then(|r| {
            r.live_versions()
                .filter(|v| v.version < number && v.is_complete())
                .max_by_key(|v| v.version)
                .map(|v| v.version)
        });
        let rebuilt = reference
            .and_then(|prev| self.blobs.get(&(record_id.to_string(), prev, ComponentKind::Primary)))
            .and_then(|base| apply_delta_bytes(base, delta).ok());

        let key = (record_id.to_string(), number, ComponentKind::Primary);
        let expected = self
            .descriptor_mut(&key)
            .map(|d| (d.digest.clone(), d.size_in_bytes))
            .ok();
        match (rebuilt, expected) {
            (Some(content), Some((digest, size)))
                if content.len() as u64 == size && checksum_bytes(&content) == digest =>
            {
                self.blobs.insert(key.clone(), content);
                self.complete(&key);
            }
            _ => self.fail(&key),
        }
    }

    fn fail(&mut self, key: &ComponentKey) {
        if let Ok(d) = self.descriptor_mut(key) {
            d.status = DescriptorStatus::Error;
        }
        if let Ok(v) = self.version_mut(&key.0, key.1) {
            v.status = DescriptorStatus::Error;
        }
    }

    fn request_upload_url(
        &mut self,
        key: ComponentKey,
        part: Option<u32>,
    ) -> Result<String, RemoteError> {
        let chunk_size = self.chunk_size;
        let descriptor = self.descriptor_mut(&key)?;
        if !descriptor.is_waiting() {
            return Err(api(409, "component is not waiting for upload"));
        }
        let size = descriptor.size_in_bytes;
        if let Some(part) = part {
            let upload = self.uploads.entry(key.clone()).or_default();
            if upload.max_parts == 0 {
                upload.max_parts = PartPlan::new(size, chunk_size).count();
            }
            if part == 0 || part > upload.max_parts {
                return Err(api(400, "part number out of range"));
            }
        }
        let url = format!("mem://put/{}", self.next_url);
        self.next_url += 1;
        self.signed.insert(url.clone(), Target { key, part });
        Ok(url)
    }

    fn put(
        &mut self,
        url: &str,
        data: Vec<u8>,
        digest: Option<&str>,
    ) -> Result<Option<String>, RemoteError> {
        let target = self
            .signed
            .remove(url)
            .ok_or_else(|| api(403, "unknown or used upload url"))?;
        if self.interrupt_after.is_some_and(|n| self.puts >= n) {
            return Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }
        if let Some(expected) = digest {
            let actual = digest_base64(&checksum_bytes(&data)).unwrap_or_default();
            if actual != expected {
                return Err(api(400, "checksum mismatch"));
            }
        }

        self.puts += 1;
        self.put_bytes += data.len() as u64;
        let etag = format!("\"{}\"", &checksum_bytes(&data)[..16]);
        let upload = self.uploads.entry(target.key).or_default();
        match target.part {
            Some(part) => {
                let index = part as usize - 1;
                if index < upload.etags.len() {
                    upload.parts[index] = data;
                    upload.etags[index] = etag.clone();
                } else if index == upload.etags.len() {
                    upload.parts.push(data);
                    upload.etags.push(etag.clone());
                } else {
                    return Err(api(400, "parts must arrive in order"));
                }
            }
            None => upload.simple = Some(data),
        }
        Ok(Some(etag))
    }

    fn finish(
        &mut self,
        key: ComponentKey,
        req: &FinishUploadRequest,
    ) -> Result<RemoteFileRecord, RemoteError> {
        let (digest, size) = {
            let d = self.descriptor_mut(&key)?;
            if !d.is_waiting() {
                return Err(api(409, "component is not waiting for upload"));
            }
            (d.digest.clone(), d.size_in_bytes)
        };
        let upload = self
            .uploads
            .remove(&key)
            .ok_or_else(|| api(409, "nothing was uploaded"))?;

        let data = if req.etags.is_empty() {
            upload
                .simple
                .ok_or_else(|| api(400, "multipart upload needs etags"))?
        } else {
            if req.etags != upload.etags || upload.etags.len() as u32 != upload.max_parts {
                self.uploads.insert(key, upload);
                return Err(api(400, "etags do not match accepted parts"));
            }
            upload.parts.concat()
        };

        if self.fail_processing || data.len() as u64 != size || checksum_bytes(&data) != digest {
            self.fail(&key);
        } else {
            self.blobs.insert(key.clone(), data);
            if self.processing_rounds == 0 {
                self.complete(&key);
            } else {
                self.processing.push((key.clone(), self.processing_rounds));
            }
        }
        Ok(self.record(&key.0)?.clone())
    }

    fn upload_status(&self, key: &ComponentKey) -> Option<UploadStatus> {
        let upload = self.uploads.get(key)?;
        if upload.max_parts == 0 {
            return None;
        }
        Some(UploadStatus {
            upload_id: format!("up-{}-{}-{}", key.0, key.1, key.2),
            file_name: String::new(),
            next_part_number: upload.etags.len() as u32,
            max_parts: upload.max_parts,
            etags: upload.etags.clone(),
        })
    }
}

impl RemoteFiles for MemoryRemote {
    fn create_record<'a>(
        &'a self,
        req: &'a CreateRecordRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move { Ok(self.with(|s| s.create_record(req))) })
    }

    fn fetch_record<'a>(&'a self, record_id: &'a str) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            self.with(|s| {
                s.tick_processing();
                s.record(record_id).cloned()
            })
        })
    }

    fn create_version<'a>(
        &'a self,
        record_id: &'a str,
        req: &'a CreateVersionRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            self.with(|s| {
                s.create_version_calls += 1;
                s.push_version(record_id, req)
            })
        })
    }

    fn delete_version<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            self.with(|s| {
                let v = s.version_mut(record_id, version)?;
                if v.is_complete() {
                    return Err(api(409, "complete versions are immutable"));
                }
                v.deleted = true;
                s.delete_calls += 1;
                s.uploads.retain(|k, _| !(k.0 == record_id && k.1 == version));
                s.record(record_id).cloned()
            })
        })
    }

    fn request_upload_url<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
        part_number: Option<u32>,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            self.with(|s| s.request_upload_url((record_id.to_string(), version, kind), part_number))
        })
    }

    fn put_bytes<'a>(
        &'a self,
        url: &'a str,
        data: Vec<u8>,
        digest: Option<&'a str>,
        progress: ByteProgress,
    ) -> RemoteFuture<'a, Option<String>> {
        Box::pin(async move {
            let len = data.len() as u64;
            let etag = self.with(|s| s.put(url, data, digest))?;
            progress(len, len);
            Ok(etag)
        })
    }

    fn finish_upload<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
        req: &'a FinishUploadRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move { self.with(|s| s.finish((record_id.to_string(), version, kind), req)) })
    }

    fn get_upload_status<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
    ) -> RemoteFuture<'a, Option<UploadStatus>> {
        Box::pin(async move {
            Ok(self.with(|s| s.upload_status(&(record_id.to_string(), version, kind))))
        })
    }

    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> RemoteFuture<'a, u64> {
        Box::pin(async move {
            let data = self.with(|s| {
                if s.fail_downloads {
                    return Err(api(503, "storage unavailable"));
                }
                s.downloads.get(url).cloned().ok_or_else(|| api(404, "no such blob"))
            })?;
            tokio::fs::write(dest, &data).await?;
            Ok(data.len() as u64)
        })
    }
}

impl Session for MemoryRemote {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn login(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            if !self.allow_login {
                return Err(api(401, "login refused"));
            }
            self.authenticated.store(true, Ordering::Release);
            Ok(())
        })
    }
}

fn descriptor(status: DescriptorStatus, digest: &str, size: u64) -> FileDescriptor {
    FileDescriptor {
        status,
        digest: digest.into(),
        size_in_bytes: size,
        ..FileDescriptor::default()
    }
}

fn version_with(number: u32, status: DescriptorStatus, digest: &str, size: u64) -> Version {
    Version {
        version: number,
        status,
        primary: Some(descriptor(status, digest, size)),
        signature: Some(descriptor(status, "sig", 4)),
        ..Version::default()
    }
}

pub(crate) fn complete_version(number: u32, digest: &str, size: u64) -> Version {
    version_with(number, DescriptorStatus::Complete, digest, size)
}

pub(crate) fn waiting_version(number: u32, digest: &str, size: u64) -> Version {
    version_with(number, DescriptorStatus::Waiting, digest, size)
}

/// Deterministic incompressible test data.
pub(crate) fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}
