use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use thiserror::Error;
use url::Url;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

pub const MAX_BUNDLE_BYTES: u64 = 512 * 1024 * 1024;
pub const UPLOAD_ENDPOINT: &str = "https://0x0.st";
pub const UPLOAD_HOST: &str = "0x0.st";
pub const UPLOAD_USER_AGENT: &str = "ValheimSaveShareTool/1.0";
pub const UPLOAD_EXPIRES_HOURS: u32 = 72;
pub const DEFAULT_FILE_TAG: &str = "save";

/// Streamed download bytes map onto the lower half of the progress bar; the
/// extraction phase owns the rest and is advanced heuristically by the UI.
pub const DOWNLOAD_PROGRESS_CEILING: u8 = 50;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("both the .db and .fwl files must be selected")]
    MissingInput,
    #[error("cannot access {}: {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("combined save size of {total_bytes} bytes exceeds the 512 MiB limit")]
    BundleTooLarge { total_bytes: u64 },
    #[error("path {} has no usable file name", .0.display())]
    BadFileName(PathBuf),
    #[error("invalid download URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("URL host {0:?} is not {UPLOAD_HOST}")]
    UnexpectedHost(String),
    #[error("archive entry {0:?} escapes the destination directory")]
    UnsafeArchiveEntry(String),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Validated inputs for one share operation. Replaces positional access into
/// raw form values: both paths are checked for existence up front and the tag
/// falls back to [`DEFAULT_FILE_TAG`] when left empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRequest {
    pub db_path: PathBuf,
    pub fwl_path: PathBuf,
    pub tag: String,
    pub keep_local_copy: bool,
}

impl ShareRequest {
    pub fn new(
        db_path: &str,
        fwl_path: &str,
        tag: &str,
        keep_local_copy: bool,
    ) -> Result<Self, ShareError> {
        let db_path = db_path.trim();
        let fwl_path = fwl_path.trim();
        if db_path.is_empty() || fwl_path.is_empty() {
            return Err(ShareError::MissingInput);
        }

        let db_path = PathBuf::from(db_path);
        let fwl_path = PathBuf::from(fwl_path);
        file_size(&db_path)?;
        file_size(&fwl_path)?;

        let tag = tag.trim();
        let tag = if tag.is_empty() {
            DEFAULT_FILE_TAG.to_owned()
        } else {
            tag.to_owned()
        };

        Ok(Self {
            db_path,
            fwl_path,
            tag,
            keep_local_copy,
        })
    }

    /// Combined size of both files, rejected before any archive or network
    /// work when it exceeds [`MAX_BUNDLE_BYTES`].
    pub fn checked_size(&self) -> Result<u64, ShareError> {
        let db = file_size(&self.db_path)?;
        let fwl = file_size(&self.fwl_path)?;
        ensure_within_limit(db + fwl)
    }
}

pub fn ensure_within_limit(total_bytes: u64) -> Result<u64, ShareError> {
    if total_bytes > MAX_BUNDLE_BYTES {
        return Err(ShareError::BundleTooLarge { total_bytes });
    }
    Ok(total_bytes)
}

fn file_size(path: &Path) -> Result<u64, ShareError> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|source| ShareError::FileAccess {
            path: path.to_path_buf(),
            source,
        })
}

/// Messages posted by a transfer worker. `Complete` and `Failed` are
/// terminal: exactly one of them ends every transfer and nothing follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress(u8),
    Status(String),
    Complete(TransferOutcome),
    Failed(String),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Complete(_) | TransferEvent::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Upload(UploadResponse),
    Download { dest_dir: PathBuf },
}

/// Raw HTTP response from the upload endpoint. The file host replies to a
/// successful POST with the shareable URL as the plain-text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

impl UploadResponse {
    pub fn success(&self) -> bool {
        self.status == 200
    }

    pub fn shared_url(&self) -> Option<&str> {
        self.success().then(|| self.body.trim())
    }

    pub fn failure_message(&self) -> String {
        format!(
            "Savefile share created but upload failed.\nStatus code: {}",
            self.status
        )
    }
}

pub fn archive_file_name(tag: &str, now: DateTime<Local>) -> String {
    format!("{}_{}.zip", tag, now.format("%Y%m%d_%H%M"))
}

/// Write both save files into a deflate-compressed zip at `dest`. Entries
/// are stored under their base file names with no directory prefixes.
pub fn build_archive(db_path: &Path, fwl_path: &Path, dest: &Path) -> Result<(), ShareError> {
    let out = File::create(dest).map_err(|source| ShareError::FileAccess {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut writer = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for source_path in [db_path, fwl_path] {
        writer.start_file(base_name(source_path)?, options)?;
        let mut input = File::open(source_path).map_err(|source| ShareError::FileAccess {
            path: source_path.to_path_buf(),
            source,
        })?;
        io::copy(&mut input, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}

/// Unpack every entry of `archive_path` into `dest_dir`, rejecting entries
/// whose names would resolve outside of it.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<(), ShareError> {
    let input = File::open(archive_path).map_err(|source| ShareError::FileAccess {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = ZipArchive::new(input)?;
    fs::create_dir_all(dest_dir)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ShareError::UnsafeArchiveEntry(entry.name().to_owned()));
        };
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path).map_err(|source| ShareError::FileAccess {
            path: out_path.clone(),
            source,
        })?;
        io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

fn base_name(path: &Path) -> Result<String, ShareError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| ShareError::BadFileName(path.to_path_buf()))
}

/// Downloads are only accepted from the known file host; anything else fails
/// before a request is issued.
pub fn validate_download_url(raw: &str) -> Result<Url, ShareError> {
    let url = Url::parse(raw.trim())?;
    match url.host_str() {
        Some(host) if host.eq_ignore_ascii_case(UPLOAD_HOST) => Ok(url),
        other => Err(ShareError::UnexpectedHost(
            other.unwrap_or_default().to_owned(),
        )),
    }
}

/// Output file name for a download: `Content-Disposition` wins, then the
/// URL's last path segment, always forced to a `.zip` extension. Both
/// sources are reduced to a bare file name first.
pub fn download_file_name(url: &Url, content_disposition: Option<&str>) -> String {
    let name = content_disposition
        .and_then(filename_from_content_disposition)
        .or_else(|| {
            url.path_segments()
                .and_then(|segments| segments.last())
                .and_then(sanitize_file_name)
        })
        .unwrap_or_else(|| "download".to_owned());
    force_zip_extension(&name)
}

fn filename_from_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let trimmed = rest.trim().trim_matches('"');
            if let Some(name) = sanitize_file_name(trimmed) {
                return Some(name);
            }
        }
    }
    None
}

/// The name comes from the remote side, so it is stripped to its final
/// path component before it is ever joined onto the destination
/// directory.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_owned())
}

fn force_zip_extension(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".zip") {
        name.to_owned()
    } else {
        format!("{name}.zip")
    }
}

pub fn download_progress_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let capped = received.min(total);
    ((capped * u64::from(DOWNLOAD_PROGRESS_CEILING)) / total) as u8
}

pub const UPLOAD_STEPS: [(u8, &str); 5] = [
    (0, "Creating ZIP file..."),
    (30, "Preparing upload..."),
    (50, "Uploading files..."),
    (80, "Finalizing upload..."),
    (95, "Almost done..."),
];

/// Cosmetic upload progress. The transport exposes no upload callback, so
/// the progress bar walks [`UPLOAD_STEPS`] one percent per tick, pausing at
/// each step target, and tops out at the final target until a terminal
/// event arrives.
#[derive(Debug, Default)]
pub struct UploadAnimation {
    percent: u8,
    step: usize,
}

impl UploadAnimation {
    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn label(&self) -> &'static str {
        let index = self.step.min(UPLOAD_STEPS.len() - 1);
        UPLOAD_STEPS[index].1
    }

    pub fn tick(&mut self) -> u8 {
        if self.step >= UPLOAD_STEPS.len() {
            return self.percent;
        }
        let (target, _) = UPLOAD_STEPS[self.step];
        if self.percent < target {
            self.percent += 1;
        } else {
            self.step += 1;
        }
        self.percent
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn archive_holds_two_base_named_entries_with_identical_contents() {
        let dir = tempfile::tempdir().unwrap();
        let db = write_file(dir.path(), "world.db", b"db-bytes-0123456789");
        let fwl = write_file(dir.path(), "world.fwl", b"fwl-bytes");
        let dest = dir.path().join("bundle.zip");

        build_archive(&db, &fwl, &dest).unwrap();

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);

        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["world.db".to_owned(), "world.fwl".to_owned()]);

        let mut db_contents = Vec::new();
        archive
            .by_name("world.db")
            .unwrap()
            .read_to_end(&mut db_contents)
            .unwrap();
        assert_eq!(db_contents, b"db-bytes-0123456789");
    }

    #[test]
    fn extract_reproduces_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let db = write_file(dir.path(), "world.db", &[7_u8; 4096]);
        let fwl = write_file(dir.path(), "world.fwl", b"meta");
        let dest = dir.path().join("bundle.zip");
        build_archive(&db, &fwl, &dest).unwrap();

        let out_dir = dir.path().join("restored");
        extract_archive(&dest, &out_dir).unwrap();

        assert_eq!(fs::read(out_dir.join("world.db")).unwrap(), vec![7_u8; 4096]);
        assert_eq!(fs::read(out_dir.join("world.fwl")).unwrap(), b"meta");
    }

    #[test]
    fn extract_rejects_escaping_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.zip");

        let mut writer = ZipWriter::new(File::create(&archive_path).unwrap());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer.start_file("../evil.txt", options).unwrap();
        writer.write_all(b"nope").unwrap();
        writer.start_file("safe.txt", options).unwrap();
        writer.write_all(b"ok").unwrap();
        writer.finish().unwrap();

        let out_dir = dir.path().join("out");
        let err = extract_archive(&archive_path, &out_dir).unwrap_err();
        assert!(matches!(err, ShareError::UnsafeArchiveEntry(_)));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn build_archive_fails_on_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("missing.db");
        let fwl = write_file(dir.path(), "world.fwl", b"meta");
        let dest = dir.path().join("bundle.zip");

        let err = build_archive(&db, &fwl, &dest).unwrap_err();
        assert!(matches!(err, ShareError::FileAccess { .. }));
    }

    #[test]
    fn share_request_requires_both_paths() {
        let err = ShareRequest::new("", "/tmp/world.fwl", "run1", true).unwrap_err();
        assert!(matches!(err, ShareError::MissingInput));

        let err = ShareRequest::new("  ", "", "run1", true).unwrap_err();
        assert!(matches!(err, ShareError::MissingInput));
    }

    #[test]
    fn share_request_rejects_nonexistent_path() {
        let dir = tempfile::tempdir().unwrap();
        let fwl = write_file(dir.path(), "world.fwl", b"meta");
        let missing = dir.path().join("nope.db");

        let err = ShareRequest::new(
            missing.to_str().unwrap(),
            fwl.to_str().unwrap(),
            "run1",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ShareError::FileAccess { .. }));
    }

    #[test]
    fn empty_tag_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = write_file(dir.path(), "world.db", b"db");
        let fwl = write_file(dir.path(), "world.fwl", b"fwl");

        let request = ShareRequest::new(
            db.to_str().unwrap(),
            fwl.to_str().unwrap(),
            "   ",
            true,
        )
        .unwrap();
        assert_eq!(request.tag, DEFAULT_FILE_TAG);
    }

    #[test]
    fn size_limit_is_enforced_at_the_boundary() {
        assert_eq!(ensure_within_limit(MAX_BUNDLE_BYTES).unwrap(), MAX_BUNDLE_BYTES);
        let err = ensure_within_limit(MAX_BUNDLE_BYTES + 1).unwrap_err();
        assert!(matches!(err, ShareError::BundleTooLarge { .. }));
    }

    #[test]
    fn archive_file_name_uses_tag_and_minute_timestamp() {
        use chrono::TimeZone;

        let now = Local.with_ymd_and_hms(2024, 5, 3, 14, 7, 59).unwrap();
        assert_eq!(archive_file_name("run1", now), "run1_20240503_1407.zip");
    }

    #[test]
    fn download_url_host_is_validated() {
        assert!(validate_download_url("https://0x0.st/abc.zip").is_ok());
        assert!(validate_download_url("  https://0X0.ST/abc.zip ").is_ok());

        let err = validate_download_url("https://evil.example/abc.zip").unwrap_err();
        assert!(matches!(err, ShareError::UnexpectedHost(_)));

        let err = validate_download_url("not a url").unwrap_err();
        assert!(matches!(err, ShareError::InvalidUrl(_)));
    }

    #[test]
    fn download_file_name_prefers_content_disposition() {
        let url = Url::parse("https://0x0.st/xyz").unwrap();
        assert_eq!(
            download_file_name(&url, Some("attachment; filename=\"world.zip\"")),
            "world.zip"
        );
        assert_eq!(
            download_file_name(&url, Some("attachment; filename=world")),
            "world.zip"
        );
    }

    #[test]
    fn download_file_name_strips_directory_components() {
        let url = Url::parse("https://0x0.st/xyz").unwrap();
        assert_eq!(
            download_file_name(&url, Some("attachment; filename=\"../evil.zip\"")),
            "evil.zip"
        );
        assert_eq!(
            download_file_name(&url, Some("attachment; filename=\"..\\..\\evil.zip\"")),
            "evil.zip"
        );
        assert_eq!(
            download_file_name(&url, Some("attachment; filename=\"/tmp/evil\"")),
            "evil.zip"
        );
        // A header that reduces to nothing falls back to the URL segment.
        assert_eq!(
            download_file_name(&url, Some("attachment; filename=\"..\"")),
            "xyz.zip"
        );
    }

    #[test]
    fn download_file_name_falls_back_to_url_segment_and_forces_zip() {
        let url = Url::parse("https://0x0.st/abc").unwrap();
        assert_eq!(download_file_name(&url, None), "abc.zip");

        let url = Url::parse("https://0x0.st/abc.ZIP").unwrap();
        assert_eq!(download_file_name(&url, None), "abc.ZIP");

        let url = Url::parse("https://0x0.st/").unwrap();
        assert_eq!(download_file_name(&url, None), "download.zip");
    }

    #[test]
    fn download_progress_maps_into_lower_half() {
        assert_eq!(download_progress_percent(0, 100), 0);
        assert_eq!(download_progress_percent(50, 100), 25);
        assert_eq!(download_progress_percent(100, 100), 50);
        assert_eq!(download_progress_percent(200, 100), 50);
        assert_eq!(download_progress_percent(10, 0), 0);
    }

    #[test]
    fn upload_animation_walks_steps_and_tops_out() {
        let mut animation = UploadAnimation::default();
        assert_eq!(animation.label(), "Creating ZIP file...");

        let mut last = 0;
        for _ in 0..500 {
            let next = animation.tick();
            assert!(next >= last, "animation went backwards");
            last = next;
        }
        assert_eq!(animation.percent(), 95);
        assert_eq!(animation.label(), "Almost done...");
    }

    #[test]
    fn upload_response_success_and_failure_shapes() {
        let ok = UploadResponse {
            status: 200,
            body: " https://0x0.st/abc.zip\n".to_owned(),
        };
        assert_eq!(ok.shared_url(), Some("https://0x0.st/abc.zip"));

        let failed = UploadResponse {
            status: 500,
            body: "internal error".to_owned(),
        };
        assert_eq!(failed.shared_url(), None);
        assert!(failed.failure_message().contains("500"));
    }

    #[test]
    fn terminal_events_are_flagged() {
        assert!(TransferEvent::Failed("x".to_owned()).is_terminal());
        assert!(
            TransferEvent::Complete(TransferOutcome::Download {
                dest_dir: PathBuf::from("/tmp")
            })
            .is_terminal()
        );
        assert!(!TransferEvent::Progress(10).is_terminal());
        assert!(!TransferEvent::Status("x".to_owned()).is_terminal());
    }
}
