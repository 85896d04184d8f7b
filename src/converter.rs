//! Wrapper around the external `iso2god` executable.
//!
//! The converter is treated as an opaque subprocess: arguments go in, free-form
//! progress text comes out on stdout/stderr, and container parts appear in the
//! output directory. A process that stays silent for longer than the idle
//! timeout is considered frozen and killed.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::error::MyrigetError;
use crate::events::{self, ProgressSink};
use crate::fs_util::{contains_suffix_recursive, files_with_suffix};

pub const PROGRAM_NAME: &str = "iso2god";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Stderr lines kept for the failure message.
const STDERR_TAIL: usize = 5;

/// File name endings that mark a GOD container part.
pub const GOD_PART_MARKERS: [&str; 2] = [".000", "data0000"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    pub game_title: Option<String>,
    pub num_threads: usize,
    pub trim: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            game_title: None,
            num_threads: default_thread_count(),
            trim: true,
        }
    }
}

/// One fewer than the logical CPUs, but never below two.
pub fn default_thread_count() -> usize {
    let cpus = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    cpus.saturating_sub(1).max(2)
}

pub fn build_args(iso_path: &Path, output_dir: &Path, options: &ConvertOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(title) = options.game_title.as_deref().filter(|t| !t.trim().is_empty()) {
        args.push("--game-title".into());
        args.push(title.into());
    }
    if options.trim {
        args.push("--trim".into());
    }
    if options.num_threads > 1 {
        args.push("-j".into());
        args.push(options.num_threads.to_string().into());
    }
    args.push(iso_path.as_os_str().to_owned());
    args.push(output_dir.as_os_str().to_owned());
    args
}

/// Why a conversion produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionFailure {
    IsoMissing(PathBuf),
    Spawn(String),
    Frozen(Duration),
    Exit { code: Option<i32>, detail: String },
    NoOutput,
    Stopped,
}

impl std::fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionFailure::IsoMissing(path) => write!(f, "ISO file not found: {}", path.display()),
            ConversionFailure::Spawn(err) => write!(f, "failed to start converter: {err}"),
            ConversionFailure::Frozen(idle) => {
                write!(f, "frozen process: no output for {}s", idle.as_secs())
            }
            ConversionFailure::Exit { code, detail } => match code {
                Some(code) => write!(f, "converter exited with code {code}: {detail}"),
                None => write!(f, "converter terminated by signal: {detail}"),
            },
            ConversionFailure::NoOutput => write!(f, "no GOD files found"),
            ConversionFailure::Stopped => write!(f, "conversion stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Both streams reached end of file.
    Drained,
    /// Nothing arrived within the idle timeout.
    Frozen,
}

/// Consumes output lines until both producers hang up or the stream goes
/// quiet for `idle_timeout`. Every received line restarts the deadline.
pub fn watch_output(
    rx: &Receiver<StreamLine>,
    idle_timeout: Duration,
    mut on_line: impl FnMut(StreamLine),
) -> WatchOutcome {
    loop {
        match rx.recv_timeout(idle_timeout) {
            Ok(line) => on_line(line),
            Err(RecvTimeoutError::Timeout) => return WatchOutcome::Frozen,
            Err(RecvTimeoutError::Disconnected) => return WatchOutcome::Drained,
        }
    }
}

fn spawn_reader<R, F>(stream: R, tx: Sender<StreamLine>, wrap: F) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(String) -> StreamLine + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    })
}

fn percent_in(line: &str) -> Option<f32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("static regex"));
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .filter(|value| *value <= 100.0)
}

pub struct Converter {
    program: PathBuf,
    idle_timeout: Duration,
    current: Mutex<Option<Child>>,
    stop_requested: AtomicBool,
}

impl Converter {
    /// Finds the executable in the usual places. Fails immediately when none
    /// of the candidates can be executed.
    pub fn locate(extra_dirs: &[PathBuf]) -> Result<Self, MyrigetError> {
        let candidates = candidate_paths(extra_dirs);
        match candidates.iter().find(|path| is_executable(path)) {
            Some(program) => {
                tracing::info!(program = %program.display(), "found GOD converter");
                Ok(Self::from_program(program.clone()))
            }
            None => Err(MyrigetError::ConverterUnavailable(format!(
                "{PROGRAM_NAME} not found (checked {} locations)",
                candidates.len()
            ))),
        }
    }

    /// Uses an explicit executable path.
    pub fn with_program(program: impl Into<PathBuf>) -> Result<Self, MyrigetError> {
        let program = program.into();
        if !is_executable(&program) {
            return Err(MyrigetError::ConverterUnavailable(format!(
                "{} is not an executable file",
                program.display()
            )));
        }
        Ok(Self::from_program(program))
    }

    fn from_program(program: PathBuf) -> Self {
        Self {
            program,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            current: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Kills the running conversion, if any.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.current.lock() {
            if let Some(child) = guard.as_mut() {
                if let Err(err) = child.kill() {
                    tracing::debug!("kill failed: {err}");
                }
            }
        }
    }

    /// Converts one ISO. Returns the GOD output directory, or `None` after
    /// reporting why it failed.
    pub fn convert(
        &self,
        iso_path: &Path,
        output_dir: &Path,
        options: &ConvertOptions,
        sink: &dyn ProgressSink,
    ) -> Option<PathBuf> {
        self.run(iso_path, output_dir, options, sink).ok()
    }

    /// Same as [`Converter::convert`] but hands the failure back to the caller.
    /// Every failure has already been reported through `sink`.
    pub fn run(
        &self,
        iso_path: &Path,
        output_dir: &Path,
        options: &ConvertOptions,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, ConversionFailure> {
        let iso_name = iso_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| iso_path.display().to_string());
        let result = self.run_inner(iso_path, output_dir, options, &iso_name, sink);
        match &result {
            Ok(_) => events::status(sink, format!("Successfully converted {iso_name}")),
            Err(failure) => events::warn(sink, format!("Error converting {iso_name}: {failure}")),
        }
        result
    }

    fn run_inner(
        &self,
        iso_path: &Path,
        output_dir: &Path,
        options: &ConvertOptions,
        iso_name: &str,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, ConversionFailure> {
        if !iso_path.exists() {
            return Err(ConversionFailure::IsoMissing(iso_path.to_path_buf()));
        }
        fs::create_dir_all(output_dir).map_err(|err| ConversionFailure::Spawn(err.to_string()))?;
        self.stop_requested.store(false, Ordering::SeqCst);

        let args = build_args(iso_path, output_dir, options);
        tracing::debug!(program = %self.program.display(), ?args, "spawning converter");
        events::status(sink, format!("Converting {iso_name} to GOD format..."));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ConversionFailure::Spawn(err.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), StreamLine::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone(), StreamLine::Stderr));
        }
        drop(tx);
        if let Ok(mut guard) = self.current.lock() {
            *guard = Some(child);
        }

        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL + 1);
        let outcome = watch_output(&rx, self.idle_timeout, |line| match line {
            StreamLine::Stdout(text) => {
                if let Some(percent) = percent_in(&text) {
                    events::progress(sink, percent);
                }
                sink.event(events::ProgressEvent::Status(format!("[{PROGRAM_NAME}] {text}")));
            }
            StreamLine::Stderr(text) => {
                sink.event(events::ProgressEvent::Status(format!(
                    "[{PROGRAM_NAME}:stderr] {text}"
                )));
                stderr_tail.push_back(text);
                if stderr_tail.len() > STDERR_TAIL {
                    stderr_tail.pop_front();
                }
            }
        });

        let child = self.current.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut child) = child else {
            return Err(ConversionFailure::Spawn("converter handle lost".to_string()));
        };

        if outcome == WatchOutcome::Frozen {
            tracing::warn!(iso = iso_name, "converter frozen, killing");
            let _ = child.kill();
            let _ = child.wait();
            // Readers finish on their own once every holder of the pipes exits.
            drop(readers);
            return Err(ConversionFailure::Frozen(self.idle_timeout));
        }

        let status = child
            .wait()
            .map_err(|err| ConversionFailure::Spawn(err.to_string()))?;
        join_readers(readers);

        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(ConversionFailure::Stopped);
        }
        if !status.success() {
            return Err(ConversionFailure::Exit {
                code: status.code(),
                detail: Vec::from(stderr_tail).join(" | "),
            });
        }
        if !has_god_parts(output_dir) {
            return Err(ConversionFailure::NoOutput);
        }
        Ok(output_dir.to_path_buf())
    }

    /// Converts every `*.iso` in `iso_dir` into `output_dir/<stem>`, in
    /// batches of `batch_size`.
    pub fn convert_directory(
        &self,
        iso_dir: &Path,
        output_dir: &Path,
        batch_size: usize,
        base: &ConvertOptions,
        sink: &dyn ProgressSink,
    ) -> DirectoryReport {
        let isos = files_with_suffix(iso_dir, ".iso");
        let mut report = DirectoryReport::default();
        if isos.is_empty() {
            events::status(sink, "No ISO files found in directory");
            return report;
        }
        events::status(sink, format!("Found {} ISO files to convert", isos.len()));

        let batch_size = batch_size.max(1);
        let total_batches = isos.len().div_ceil(batch_size);
        for (batch_idx, batch) in isos.chunks(batch_size).enumerate() {
            events::status(
                sink,
                format!(
                    "Processing batch {} of {total_batches} ({} files)...",
                    batch_idx + 1,
                    batch.len()
                ),
            );
            for iso in batch {
                let stem = iso
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let options = ConvertOptions {
                    game_title: Some(stem.replace('_', " ")),
                    ..base.clone()
                };
                match self.run(iso, &output_dir.join(&stem), &options, sink) {
                    Ok(_) => report.converted += 1,
                    Err(_) => report.failed.push(iso.clone()),
                }
                let done = report.converted + report.failed.len();
                events::progress(sink, done as f32 / isos.len() as f32 * 100.0);
            }
            let done = report.converted + report.failed.len();
            events::status(
                sink,
                format!(
                    "Completed batch {} of {total_batches}. Progress: {:.1}%",
                    batch_idx + 1,
                    done as f32 / isos.len() as f32 * 100.0
                ),
            );
        }
        events::status(
            sink,
            format!(
                "All conversions finished: {} converted, {} failed",
                report.converted,
                report.failed.len()
            ),
        );
        report
    }
}

fn join_readers(readers: Vec<thread::JoinHandle<()>>) {
    for reader in readers {
        let _ = reader.join();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryReport {
    pub converted: usize,
    pub failed: Vec<PathBuf>,
}

pub fn has_god_parts(dir: &Path) -> bool {
    GOD_PART_MARKERS
        .iter()
        .any(|marker| contains_suffix_recursive(dir, marker))
}

/// Converted game folders found under an output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GodStatus {
    pub name: String,
    pub converted: bool,
    pub file_count: usize,
    pub path: PathBuf,
}

pub fn conversion_status(output_dir: &Path) -> Vec<GodStatus> {
    let Ok(entries) = fs::read_dir(output_dir) else {
        return Vec::new();
    };
    let mut statuses: Vec<GodStatus> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .map(|path| {
            let file_count = walkdir::WalkDir::new(&path)
                .into_iter()
                .flatten()
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| {
                    let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
                    GOD_PART_MARKERS.iter().any(|marker| name.ends_with(marker))
                })
                .count();
            GodStatus {
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                converted: file_count > 0,
                file_count,
                path,
            }
        })
        .collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    statuses
}

fn executable_names() -> Vec<String> {
    if cfg!(windows) {
        vec![format!("{PROGRAM_NAME}.exe"), PROGRAM_NAME.to_string()]
    } else {
        vec![PROGRAM_NAME.to_string()]
    }
}

/// `tools/` next to the running binary, `tools/` in the working directory,
/// any caller-supplied directories, then every `PATH` entry.
pub fn candidate_paths(extra_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("tools"));
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd.join("tools"));
    }
    dirs.extend(extra_dirs.iter().cloned());
    if let Some(path_var) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path_var));
    }

    let names = executable_names();
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
