//! Peer transport over the peer server's HTTP API.

use super::{
    PeerTransport, ShareTarget, SourceInfo, PASSWORD_HEADER, SOURCE_SERVER_HEADER,
};
use crate::archive::{write_archive, ArchiveStats};
use crate::config::PeerConfig;
use crate::crypto::{ChunkedCipher, EncryptionKey, StreamCipher};
use crate::manifest::Manifest;
use crate::transfer::{spawn_producer, Pipe, ProgressStream};
use crate::{Result, SyncError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PhysicalFiles {
    files: Vec<String>,
}

/// reqwest-backed [`PeerTransport`].
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
    cipher: ChunkedCipher,
    compression_level: i32,
}

impl HttpPeerClient {
    pub fn new(peer: &PeerConfig, cipher: ChunkedCipher, compression_level: i32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(peer.accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            base_url: peer.url.trim_end_matches('/').to_string(),
            secret: peer.secret.clone().filter(|s| !s.is_empty()),
            cipher,
            compression_level,
        })
    }

    fn request(&self, method: Method, path: &str, target: &ShareTarget) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .query(&[
                ("user_id", target.owner_id.to_string()),
                ("share_name", target.share_name.clone()),
                ("source_server", target.origin_server.clone()),
            ])
            .header(SOURCE_SERVER_HEADER, &target.origin_server);
        match &self.secret {
            Some(secret) => request.header(PASSWORD_HEADER, secret),
            None => request,
        }
    }

    /// Send a streamed multipart request, racing it against `cancel`, and
    /// always join the producer feeding it.
    async fn send_streamed<T: Send + 'static>(
        &self,
        request: RequestBuilder,
        pipe: Pipe<T>,
        form: impl FnOnce(Part) -> Form + Send,
        file_name: String,
        cancel: &CancellationToken,
    ) -> Result<(T, u64)> {
        let sent = Arc::new(AtomicU64::new(0));
        let body = reqwest::Body::wrap_stream(ProgressStream::new(pipe.stream, Arc::clone(&sent)));
        let part = Part::stream(body)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;

        let outcome = tokio::select! {
            response = request.multipart(form(part)).send() => Some(response),
            _ = cancel.cancelled() => None,
        };
        let produced = Pipe::join(pipe.producer).await;

        match outcome {
            None => Err(SyncError::Cancelled),
            Some(Err(e)) => match produced {
                // A broken pipe only echoes the failed request.
                Err(p) if !is_broken_pipe(&p) => Err(p),
                _ => Err(SyncError::Http(e)),
            },
            Some(Ok(response)) => {
                check(response).await?;
                let out = produced?;
                Ok((out, sent.load(Ordering::Relaxed)))
            }
        }
    }
}

fn is_broken_pipe(e: &SyncError) -> bool {
    matches!(e, SyncError::Io(io) if io.kind() == io::ErrorKind::BrokenPipe)
}

/// Turn a non-success response into [`SyncError::PeerStatus`], keeping the body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::PeerStatus {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

#[async_trait]
impl PeerTransport for HttpPeerClient {
    async fn fetch_manifest(&self, target: &ShareTarget, key: &EncryptionKey) -> Result<Option<Manifest>> {
        let response = self
            .request(Method::GET, "/api/sync/manifest", target)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let sealed = check(response).await?.bytes().await?;
        let plain = self.cipher.decrypt_bytes(key, &sealed)?;
        Ok(Some(Manifest::from_json(&plain)?))
    }

    async fn push_manifest(&self, target: &ShareTarget, manifest: &Manifest, key: &EncryptionKey) -> Result<()> {
        let sealed = self.cipher.encrypt_bytes(key, &manifest.to_json()?)?;
        let response = self
            .request(Method::PUT, "/api/sync/manifest", target)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(sealed)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        target: &ShareTarget,
        local_path: &Path,
        remote_name: &str,
        key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let cipher = self.cipher;
        let key = key.clone();
        let path = local_path.to_path_buf();
        let pipe = spawn_producer(move |writer| {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut encrypting = cipher.writer(&key, writer);
            let read = io::copy(&mut reader, &mut encrypting)?;
            encrypting.finish()?;
            Ok(read)
        });

        let owner_id = target.owner_id.to_string();
        let share_name = target.share_name.clone();
        let relative_path = remote_name.to_string();
        let file_name = remote_name.rsplit('/').next().unwrap_or(remote_name).to_string();
        let request = self.request(Method::POST, "/api/sync/file", target);

        let (read, sent) = self
            .send_streamed(
                request,
                pipe,
                move |part| {
                    Form::new()
                        .text("user_id", owner_id)
                        .text("share_name", share_name)
                        .text("relative_path", relative_path)
                        .part("file", part)
                },
                file_name,
                cancel,
            )
            .await?;
        debug!("Uploaded {} ({} plaintext bytes, {} sent)", remote_name, read, sent);
        Ok(sent)
    }

    async fn delete_remote_file(&self, target: &ShareTarget, remote_name: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, "/api/sync/file", target)
            .query(&[("path", remote_name)])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list_remote_physical_files(&self, target: &ShareTarget) -> Result<HashSet<String>> {
        let response = self
            .request(Method::GET, "/api/sync/list-physical-files", target)
            .send()
            .await?;
        let listing: PhysicalFiles = check(response).await?.json().await?;
        Ok(listing.files.into_iter().collect())
    }

    async fn put_source_info(&self, target: &ShareTarget, info: &SourceInfo) -> Result<()> {
        let response = self
            .request(Method::PUT, "/api/sync/source-info", target)
            .json(info)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn upload_archive(
        &self,
        target: &ShareTarget,
        source_dir: &Path,
        key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> Result<ArchiveStats> {
        let cipher = self.cipher;
        let key = key.clone();
        let source = source_dir.to_path_buf();
        let level = self.compression_level;
        let pipe = spawn_producer(move |writer| {
            let (stats, encrypting) = write_archive(&source, cipher.writer(&key, writer), level)?;
            encrypting.finish()?;
            Ok(stats)
        });

        let owner_id = target.owner_id.to_string();
        let share_name = target.share_name.clone();
        let request = self.request(Method::POST, "/api/sync/receive", target);

        let (stats, sent) = self
            .send_streamed(
                request,
                pipe,
                move |part| {
                    Form::new()
                        .text("user_id", owner_id)
                        .text("share_name", share_name)
                        .text("encrypted", "true")
                        .part("archive", part)
                },
                "archive.tar.zst.enc".to_string(),
                cancel,
            )
            .await?;
        debug!("Uploaded archive: {} files, {} bytes sent", stats.files, sent);
        Ok(stats)
    }
}
