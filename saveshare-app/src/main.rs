#![cfg_attr(target_os = "windows", windows_subsystem = "windows")]

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::mpsc::TryRecvError,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Local;
use eframe::egui;
use saveshare_app::{config, transfer};
use saveshare_core::{
    ShareRequest, TransferEvent, TransferOutcome, UPLOAD_STEPS, UploadAnimation,
    archive_file_name, build_archive,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> eframe::Result {
    init_logging();
    info!("starting Valheim Save Share");

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([620.0, 420.0])
            .with_min_inner_size([480.0, 360.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Valheim Save Sharing",
        options,
        Box::new(|_cc| Ok(Box::new(SaveShareApp::new()?))),
    )
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let log_path = log_file_path();
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .init();
}

fn log_file_path() -> PathBuf {
    let base = std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let dir = base.join("ValheimSaveShare").join("logs");
    let _ = std::fs::create_dir_all(&dir);
    dir.join("saveshare.log")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tab {
    Share,
    Download,
}

#[derive(Debug, Clone)]
enum View {
    Form,
    UploadSuccess { url: String, copied: bool },
    DownloadSuccess { dest_dir: PathBuf },
    Failure { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Upload,
    Download,
}

struct ActiveTransfer {
    handle: transfer::TransferHandle,
    kind: TransferKind,
    percent: u8,
    status_line: String,
    animation: Option<UploadAnimation>,
    last_tick: Instant,
    archive_path: Option<PathBuf>,
    keep_local_copy: bool,
}

struct SaveShareApp {
    runtime: tokio::runtime::Runtime,
    tab: Tab,
    view: View,
    db_path: String,
    fwl_path: String,
    file_tag: String,
    save_local_copy: bool,
    download_url: String,
    download_dir: String,
    active: Option<ActiveTransfer>,
}

impl SaveShareApp {
    fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Runtime::new()?;
        let config = config::load_config();

        Ok(Self {
            runtime,
            tab: Tab::Share,
            view: View::Form,
            db_path: config.db_path,
            fwl_path: config.fwl_path,
            file_tag: config.file_tag,
            save_local_copy: config.save_local_copy,
            download_url: String::new(),
            download_dir: config.download_dir,
            active: None,
        })
    }

    fn persist_config(&self) {
        config::save_config(&config::AppConfig {
            db_path: self.db_path.trim().to_owned(),
            fwl_path: self.fwl_path.trim().to_owned(),
            file_tag: self.file_tag.trim().to_owned(),
            save_local_copy: self.save_local_copy,
            download_dir: self.download_dir.trim().to_owned(),
        });
    }

    fn start_share(&mut self) {
        self.persist_config();

        let request = match ShareRequest::new(
            &self.db_path,
            &self.fwl_path,
            &self.file_tag,
            self.save_local_copy,
        ) {
            Ok(request) => request,
            Err(err) => {
                self.view = View::Failure {
                    message: err.to_string(),
                };
                return;
            }
        };

        // The size gate runs before the archive exists and before any
        // network activity.
        if let Err(err) = request.checked_size() {
            self.view = View::Failure {
                message: err.to_string(),
            };
            return;
        }

        let archive_path = PathBuf::from(archive_file_name(&request.tag, Local::now()));
        if let Err(err) = build_archive(&request.db_path, &request.fwl_path, &archive_path) {
            error!("archive build failed: {err}");
            self.view = View::Failure {
                message: err.to_string(),
            };
            return;
        }

        info!(archive = %archive_path.display(), "share started");
        let handle = transfer::spawn_upload(&self.runtime, archive_path.clone());
        self.active = Some(ActiveTransfer {
            handle,
            kind: TransferKind::Upload,
            percent: 0,
            status_line: UPLOAD_STEPS[0].1.to_owned(),
            animation: Some(UploadAnimation::default()),
            last_tick: Instant::now(),
            archive_path: Some(archive_path),
            keep_local_copy: request.keep_local_copy,
        });
    }

    fn start_download(&mut self) {
        self.persist_config();

        let raw_url = self.download_url.trim().to_owned();
        if raw_url.is_empty() {
            self.view = View::Failure {
                message: "Please paste a share URL first.".to_owned(),
            };
            return;
        }
        let dest_dir = self.download_dir.trim();
        if dest_dir.is_empty() {
            self.view = View::Failure {
                message: "Please choose a destination folder.".to_owned(),
            };
            return;
        }

        info!(url = %raw_url, "download started");
        let handle = transfer::spawn_download(&self.runtime, raw_url, PathBuf::from(dest_dir));
        self.active = Some(ActiveTransfer {
            handle,
            kind: TransferKind::Download,
            percent: 0,
            status_line: "Downloading savefile...".to_owned(),
            animation: None,
            last_tick: Instant::now(),
            archive_path: None,
            keep_local_copy: true,
        });
    }

    fn poll_transfer(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if let Some(animation) = active.animation.as_mut() {
            if active.last_tick.elapsed() >= POLL_INTERVAL {
                active.percent = animation.tick();
                active.status_line = animation.label().to_owned();
                active.last_tick = Instant::now();
            }
        }

        let mut terminal: Option<Result<TransferOutcome, String>> = None;
        loop {
            match active.handle.events.try_recv() {
                Ok(TransferEvent::Progress(percent)) => active.percent = percent,
                Ok(TransferEvent::Status(text)) => {
                    active.status_line = text;
                    if active.kind == TransferKind::Download {
                        // extraction exposes no byte-level progress
                        active.percent = active.percent.max(75);
                    }
                }
                Ok(TransferEvent::Complete(outcome)) => {
                    terminal = Some(Ok(outcome));
                    break;
                }
                Ok(TransferEvent::Failed(message)) => {
                    terminal = Some(Err(message));
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    terminal = Some(Err("transfer stopped unexpectedly".to_owned()));
                    break;
                }
            }
        }

        if let Some(result) = terminal {
            self.finish_transfer(result);
        }
    }

    fn finish_transfer(&mut self, result: Result<TransferOutcome, String>) {
        let Some(active) = self.active.take() else {
            return;
        };

        match result {
            Ok(TransferOutcome::Upload(response)) => {
                if let Some(archive_path) = active.archive_path.as_deref() {
                    transfer::apply_retention(
                        archive_path,
                        active.keep_local_copy,
                        response.success(),
                    );
                }
                match response.shared_url() {
                    Some(url) => {
                        info!(%url, "upload succeeded");
                        self.view = View::UploadSuccess {
                            url: url.to_owned(),
                            copied: false,
                        };
                    }
                    None => {
                        warn!(status = response.status, "upload rejected by file host");
                        self.view = View::Failure {
                            message: response.failure_message(),
                        };
                    }
                }
            }
            Ok(TransferOutcome::Download { dest_dir }) => {
                info!(dest = %dest_dir.display(), "download succeeded");
                self.view = View::DownloadSuccess { dest_dir };
            }
            Err(message) => {
                error!("transfer failed: {message}");
                self.view = View::Failure { message };
            }
        }
    }

    fn cancel_transfer(&mut self) {
        // Dropping the handle aborts the worker task, so the in-flight
        // request stops instead of running on unobserved.
        if self.active.take().is_some() {
            info!("transfer cancelled by user");
            self.view = View::Form;
        }
    }

    fn form_ui(&mut self, ui: &mut egui::Ui) {
        ui.heading("Valheim Save Sharing Tool");
        ui.add_space(8.0);
        ui.horizontal(|ui| {
            ui.selectable_value(&mut self.tab, Tab::Share, "Share");
            ui.selectable_value(&mut self.tab, Tab::Download, "Download");
        });
        ui.separator();
        match self.tab {
            Tab::Share => self.share_form_ui(ui),
            Tab::Download => self.download_form_ui(ui),
        }
    }

    fn share_form_ui(&mut self, ui: &mut egui::Ui) {
        egui::Grid::new("share_form")
            .num_columns(3)
            .spacing([8.0, 8.0])
            .show(ui, |ui| {
                ui.label(".db file:");
                ui.add(egui::TextEdit::singleline(&mut self.db_path).desired_width(320.0));
                if ui.button("Browse...").clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .add_filter("DB File", &["db"])
                        .pick_file()
                    {
                        self.db_path = path.display().to_string();
                    }
                }
                ui.end_row();

                ui.label(".fwl file:");
                ui.add(egui::TextEdit::singleline(&mut self.fwl_path).desired_width(320.0));
                if ui.button("Browse...").clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .add_filter("FWL File", &["fwl"])
                        .pick_file()
                    {
                        self.fwl_path = path.display().to_string();
                    }
                }
                ui.end_row();

                ui.label("File tag (Optional)");
                ui.add(egui::TextEdit::singleline(&mut self.file_tag).desired_width(320.0));
                ui.end_row();
            });

        ui.add_space(4.0);
        ui.checkbox(&mut self.save_local_copy, "Retain local copy of .zip");
        ui.add_space(4.0);
        ui.label("Note: Files will be uploaded to the 0x0.st file hosting service. Limited to 512MB.");
        ui.add_space(8.0);
        if ui.button("Share savefile").clicked() {
            self.start_share();
        }
    }

    fn download_form_ui(&mut self, ui: &mut egui::Ui) {
        egui::Grid::new("download_form")
            .num_columns(3)
            .spacing([8.0, 8.0])
            .show(ui, |ui| {
                ui.label("Share URL:");
                ui.add(egui::TextEdit::singleline(&mut self.download_url).desired_width(320.0));
                ui.end_row();

                ui.label("Extract to:");
                ui.add(egui::TextEdit::singleline(&mut self.download_dir).desired_width(320.0));
                if ui.button("Browse...").clicked() {
                    if let Some(path) = rfd::FileDialog::new().pick_folder() {
                        self.download_dir = path.display().to_string();
                    }
                }
                ui.end_row();
            });

        ui.add_space(4.0);
        ui.label("Paste a 0x0.st share link; the savefile will be downloaded and extracted.");
        ui.add_space(8.0);
        if ui.button("Download savefile").clicked() {
            self.start_download();
        }
    }

    fn progress_ui(&mut self, ui: &mut egui::Ui) {
        let (status_line, percent, kind) = match &self.active {
            Some(active) => (active.status_line.clone(), active.percent, active.kind),
            None => return,
        };

        let title = match kind {
            TransferKind::Upload => "Creating and uploading savefile share...",
            TransferKind::Download => "Downloading savefile share...",
        };
        ui.heading(title);
        ui.add_space(8.0);
        ui.label(status_line);
        ui.add_space(4.0);
        ui.add(egui::ProgressBar::new(f32::from(percent) / 100.0).show_percentage());
        ui.add_space(8.0);
        if ui.button("Cancel").clicked() {
            self.cancel_transfer();
        }
    }

    fn upload_success_ui(&mut self, ui: &mut egui::Ui, url: &str, copied: bool) {
        ui.heading("Savefile zip created and uploaded!");
        ui.add_space(8.0);
        ui.horizontal(|ui| {
            ui.label("URL:");
            ui.monospace(url);
        });
        ui.add_space(4.0);
        ui.horizontal(|ui| {
            if ui.button("Copy URL").clicked() {
                let copy_result = arboard::Clipboard::new()
                    .and_then(|mut clipboard| clipboard.set_text(url.to_owned()));
                match copy_result {
                    Ok(()) => {
                        self.view = View::UploadSuccess {
                            url: url.to_owned(),
                            copied: true,
                        };
                    }
                    Err(err) => warn!("clipboard copy failed: {err}"),
                }
            }
            if copied {
                ui.label("URL copied to clipboard!");
            }
        });
        ui.add_space(8.0);
        if ui.button("OK").clicked() {
            self.view = View::Form;
        }
    }

    fn download_success_ui(&mut self, ui: &mut egui::Ui, dest_dir: &Path) {
        ui.heading("Savefile downloaded and extracted!");
        ui.add_space(8.0);
        ui.label(format!("Files extracted to {}", dest_dir.display()));
        ui.add_space(8.0);
        if ui.button("OK").clicked() {
            self.view = View::Form;
        }
    }

    fn failure_ui(&mut self, ui: &mut egui::Ui, message: &str) {
        ui.heading("Something went wrong");
        ui.add_space(8.0);
        ui.label(message);
        ui.add_space(8.0);
        if ui.button("OK").clicked() {
            self.view = View::Form;
        }
    }
}

impl eframe::App for SaveShareApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if self.active.is_some() {
            self.poll_transfer();
            ctx.request_repaint_after(POLL_INTERVAL);
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.active.is_some() {
                self.progress_ui(ui);
                return;
            }
            match self.view.clone() {
                View::Form => self.form_ui(ui),
                View::UploadSuccess { url, copied } => self.upload_success_ui(ui, &url, copied),
                View::DownloadSuccess { dest_dir } => self.download_success_ui(ui, &dest_dir),
                View::Failure { message } => self.failure_ui(ui, &message),
            }
        });
    }
}
