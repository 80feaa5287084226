use std::{
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
};

use rand::RngCore;
use reqwest::multipart;
use saveshare_core::{
    TransferEvent, TransferOutcome, UPLOAD_ENDPOINT, UPLOAD_EXPIRES_HOURS, UPLOAD_USER_AGENT,
    UploadResponse, download_file_name, download_progress_percent, extract_archive,
    validate_download_url,
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

/// One running transfer: the event receiver the UI polls plus the worker
/// task itself. Dropping the handle aborts the worker, so closing the
/// progress surface actually cancels in-flight network I/O.
pub struct TransferHandle {
    pub events: Receiver<TransferEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl TransferHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_upload(runtime: &tokio::runtime::Runtime, archive_path: PathBuf) -> TransferHandle {
    let (events_tx, events_rx) = mpsc::channel();
    let task = runtime.spawn(async move {
        let event = match upload_archive(&archive_path, UPLOAD_ENDPOINT).await {
            Ok(response) => TransferEvent::Complete(TransferOutcome::Upload(response)),
            Err(message) => TransferEvent::Failed(message),
        };
        let _ = events_tx.send(event);
    });
    TransferHandle {
        events: events_rx,
        task,
    }
}

pub fn spawn_download(
    runtime: &tokio::runtime::Runtime,
    raw_url: String,
    dest_dir: PathBuf,
) -> TransferHandle {
    let (events_tx, events_rx) = mpsc::channel();
    let task = runtime.spawn(async move {
        let event = match download_and_extract(&raw_url, &dest_dir, &events_tx).await {
            Ok(()) => TransferEvent::Complete(TransferOutcome::Download { dest_dir }),
            Err(message) => TransferEvent::Failed(message),
        };
        let _ = events_tx.send(event);
    });
    TransferHandle {
        events: events_rx,
        task,
    }
}

/// Single multipart POST against the file host. The response is returned
/// raw; deciding between success and failure is the monitor's job.
pub async fn upload_archive(archive_path: &Path, endpoint: &str) -> Result<UploadResponse, String> {
    let file_name = archive_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("save.zip")
        .to_owned();

    let file = tokio::fs::File::open(archive_path)
        .await
        .map_err(|err| format!("failed to open archive: {err}"))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| format!("failed to read archive metadata: {err}"))?
        .len();

    info!(archive = %archive_path.display(), size, "starting upload");

    // Stream the archive instead of buffering up to 512 MiB in memory.
    let part = multipart::Part::stream_with_length(reqwest::Body::from(file), size)
        .file_name(file_name);
    let form = multipart::Form::new()
        .part("file", part)
        .text("secret", management_token())
        .text("expires", UPLOAD_EXPIRES_HOURS.to_string());

    let client = reqwest::Client::builder()
        .user_agent(UPLOAD_USER_AGENT)
        .build()
        .map_err(|err| format!("failed to build HTTP client: {err}"))?;

    let response = client
        .post(endpoint)
        .multipart(form)
        .send()
        .await
        .map_err(|err| format!("upload request failed: {err}"))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|err| format!("failed to read upload response: {err}"))?;

    info!(status, "upload finished");
    Ok(UploadResponse { status, body })
}

/// Validate the URL host, then stream, extract and clean up.
pub async fn download_and_extract(
    raw_url: &str,
    dest_dir: &Path,
    events: &Sender<TransferEvent>,
) -> Result<(), String> {
    let url = validate_download_url(raw_url).map_err(|err| err.to_string())?;
    fetch_and_extract(url, dest_dir, events).await
}

/// Streaming GET of an already-validated URL. Byte progress covers 0-50;
/// the extraction phase posts a status message and the UI advances the bar
/// heuristically from there.
pub async fn fetch_and_extract(
    url: Url,
    dest_dir: &Path,
    events: &Sender<TransferEvent>,
) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .user_agent(UPLOAD_USER_AGENT)
        .build()
        .map_err(|err| format!("failed to build HTTP client: {err}"))?;

    info!(url = %url, "starting download");

    let mut response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| format!("download request failed: {err}"))?;

    if !response.status().is_success() {
        return Err(format!(
            "download failed: HTTP {}",
            response.status().as_u16()
        ));
    }

    let disposition = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let file_name = download_file_name(&url, disposition.as_deref());
    let total = response.content_length().unwrap_or(0);

    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|err| format!("failed to create {}: {err}", dest_dir.display()))?;

    let archive_path = dest_dir.join(file_name);
    let mut out = tokio::fs::File::create(&archive_path)
        .await
        .map_err(|err| format!("failed to create {}: {err}", archive_path.display()))?;
    let _cleanup = DownloadedFileGuard {
        path: archive_path.clone(),
    };

    let mut received: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| format!("download stream failed: {err}"))?
    {
        out.write_all(&chunk)
            .await
            .map_err(|err| format!("failed to write {}: {err}", archive_path.display()))?;
        received += chunk.len() as u64;
        if total > 0 {
            let _ = events.send(TransferEvent::Progress(download_progress_percent(
                received, total,
            )));
        }
    }
    out.flush()
        .await
        .map_err(|err| format!("failed to flush {}: {err}", archive_path.display()))?;
    drop(out);

    let _ = events.send(TransferEvent::Status("Extracting files...".to_owned()));

    let archive_for_extract = archive_path.clone();
    let dest_for_extract = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive(&archive_for_extract, &dest_for_extract))
        .await
        .map_err(|err| format!("extract task failed: {err}"))?
        .map_err(|err| format!("extract failed: {err}"))?;

    info!(dest = %dest_dir.display(), bytes = received, "download finished");
    Ok(())
}

/// Removes the intermediate archive when the download future is dropped.
/// That covers the normal exit, error returns, and a cancelled task, whose
/// future is dropped at an await point leaving a partially written file.
struct DownloadedFileGuard {
    path: PathBuf,
}

impl Drop for DownloadedFileGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "failed to remove downloaded archive {}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

/// Delete the local archive only after a successful upload when the user did
/// not ask to keep it. Failed uploads always leave the archive behind.
pub fn apply_retention(archive_path: &Path, keep_local_copy: bool, upload_succeeded: bool) {
    if !upload_succeeded || keep_local_copy {
        return;
    }
    if let Err(err) = std::fs::remove_file(archive_path) {
        warn!(
            "failed to remove local archive {}: {err}",
            archive_path.display()
        );
    }
}

/// The file host echoes a management token back in the `X-Token` header of a
/// successful upload. The original tool sent the local file path here; a
/// random token avoids leaking it.
fn management_token() -> String {
    let mut bytes = [0_u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
