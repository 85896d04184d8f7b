#![cfg(unix)]

use std::fs;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use assert_matches::assert_matches;

use myriget::converter::{ConversionFailure, ConvertOptions, Converter, conversion_status};
use myriget::domain::{BatchPolicy, EntryFilter, LinkType};
use myriget::error::MyrigetError;
use myriget::events::{CancelToken, NullSink, RecordingSink};
use myriget::manifest::{self, ManifestEntry};
use myriget::scheduler::{ConvertRequest, RunRequest, Scheduler};
use myriget::transfer::{HttpSource, RemoteBody, Transfer};

/// Writes a converter stand-in. The last argument is the output directory.
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\nfor out; do :; done\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const WRITES_PARTS: &str = r#"mkdir -p "$out"
echo "$@" > "$out/args.txt"
echo "progress 50%"
printf data > "$out/Game.000"
echo "progress 100%""#;

fn options() -> ConvertOptions {
    ConvertOptions {
        game_title: Some("Halo 3".to_string()),
        num_threads: 2,
        trim: true,
    }
}

/// Retries spawns that race with another test thread still holding a freshly
/// written script open.
fn run(
    converter: &Converter,
    iso: &Path,
    out: &Path,
    sink: &RecordingSink,
) -> Result<PathBuf, ConversionFailure> {
    for _ in 0..5 {
        match converter.run(iso, out, &options(), sink) {
            Err(ConversionFailure::Spawn(msg)) if msg.contains("busy") => {
                std::thread::sleep(Duration::from_millis(50));
            }
            other => return other,
        }
    }
    converter.run(iso, out, &options(), sink)
}

fn iso_in(dir: &Path) -> PathBuf {
    let iso = dir.join("Halo 3.iso");
    fs::write(&iso, b"iso").unwrap();
    iso
}

#[test]
fn successful_conversion_reports_progress_and_output() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", WRITES_PARTS);
    let converter = Converter::with_program(program).unwrap();
    let iso = iso_in(temp.path());
    let out = temp.path().join("god").join("Halo 3");
    let sink = RecordingSink::default();

    let result = run(&converter, &iso, &out, &sink).unwrap();
    assert_eq!(result, out);
    assert!(out.join("Game.000").is_file());

    let args = fs::read_to_string(out.join("args.txt")).unwrap();
    assert!(args.starts_with("--game-title Halo 3 --trim -j 2"));
    let statuses = sink.statuses();
    assert!(statuses.iter().any(|s| s == "[iso2god] progress 50%"));
    assert!(statuses.iter().any(|s| s.starts_with("Successfully converted")));
}

#[test]
fn exit_zero_without_parts_is_no_output() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", "echo done");
    let converter = Converter::with_program(program).unwrap();
    let iso = iso_in(temp.path());
    let sink = RecordingSink::default();

    let result = run(&converter, &iso, &temp.path().join("out"), &sink);
    assert_matches!(result, Err(ConversionFailure::NoOutput));
}

#[test]
fn non_zero_exit_carries_stderr() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", "echo boom >&2\nexit 3");
    let converter = Converter::with_program(program).unwrap();
    let iso = iso_in(temp.path());
    let sink = RecordingSink::default();

    let result = run(&converter, &iso, &temp.path().join("out"), &sink);
    assert_matches!(result, Err(ConversionFailure::Exit { code: Some(3), ref detail }) if detail.contains("boom"));
    assert!(sink.statuses().iter().any(|s| s == "[iso2god:stderr] boom"));
}

#[test]
fn exit_detail_keeps_only_the_last_stderr_lines() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(
        temp.path(),
        "iso2god",
        "for n in 1 2 3 4 5 6 7; do echo \"line$n\" >&2; done\nexit 1",
    );
    let converter = Converter::with_program(program).unwrap();
    let iso = iso_in(temp.path());
    let sink = RecordingSink::default();

    let result = run(&converter, &iso, &temp.path().join("out"), &sink);
    assert_matches!(
        result,
        Err(ConversionFailure::Exit { ref detail, .. })
            if detail == "line3 | line4 | line5 | line6 | line7"
    );
}

#[test]
fn silent_converter_is_killed() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", "exec sleep 5");
    let converter = Converter::with_program(program)
        .unwrap()
        .with_idle_timeout(Duration::from_millis(300));
    let iso = iso_in(temp.path());
    let sink = RecordingSink::default();

    let started = std::time::Instant::now();
    let result = run(&converter, &iso, &temp.path().join("out"), &sink);
    assert_matches!(result, Err(ConversionFailure::Frozen(_)));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn missing_iso_fails_before_spawning() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", WRITES_PARTS);
    let converter = Converter::with_program(program).unwrap();
    let sink = RecordingSink::default();

    let result = run(
        &converter,
        &temp.path().join("nope.iso"),
        &temp.path().join("out"),
        &sink,
    );
    assert_matches!(result, Err(ConversionFailure::IsoMissing(_)));
}

#[test]
fn directory_conversion_and_status_scan() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", WRITES_PARTS);
    let converter = Converter::with_program(program).unwrap();
    let isos = temp.path().join("isos");
    fs::create_dir_all(&isos).unwrap();
    fs::write(isos.join("Gears_of_War.iso"), b"a").unwrap();
    fs::write(isos.join("Fable_2.iso"), b"b").unwrap();
    fs::write(isos.join("notes.txt"), b"c").unwrap();
    let out = temp.path().join("god");

    let report = converter.convert_directory(&isos, &out, 1, &options(), &NullSink);
    assert_eq!(report.converted, 2);
    assert!(report.failed.is_empty());
    let args = fs::read_to_string(out.join("Gears_of_War").join("args.txt")).unwrap();
    assert!(args.contains("--game-title Gears of War"));

    let statuses = conversion_status(&out);
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Fable_2", "Gears_of_War"]);
    assert!(statuses.iter().all(|s| s.converted && s.file_count == 1));
}

struct OneArchive {
    body: Vec<u8>,
}

impl HttpSource for OneArchive {
    fn open(&self, _url: &str) -> Result<RemoteBody, MyrigetError> {
        Ok(RemoteBody {
            content_length: self.body.len() as u64,
            reader: Box::new(Cursor::new(self.body.clone())),
        })
    }

    fn content_length(&self, _url: &str) -> Result<Option<u64>, MyrigetError> {
        Ok(Some(self.body.len() as u64))
    }
}

fn iso_zip() -> Vec<u8> {
    use std::io::Write;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("Halo 3.iso", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"iso-bytes").unwrap();
    writer.finish().unwrap().into_inner()
}

fn request(root: &Path) -> RunRequest {
    RunRequest {
        manifest_path: root.join("links.json"),
        temp_dir: root.join("tempDownload"),
        extract_dir: root.join("tempExtract"),
        output_dir: root.join("output"),
        policy: BatchPolicy::ByCount {
            batch_size: 10,
            max_items: None,
        },
        filter: EntryFilter::All,
        convert: ConvertRequest {
            enabled: true,
            god_output_dir: root.join("output").join("god_converted"),
            options: ConvertOptions {
                game_title: None,
                num_threads: 2,
                trim: true,
            },
        },
        keep_downloads: false,
    }
}

#[test]
fn run_converts_published_iso() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", WRITES_PARTS);
    let scheduler = Scheduler::new(Transfer::new(OneArchive { body: iso_zip() }))
        .with_converter(Converter::with_program(program).unwrap());
    let request = request(temp.path());
    manifest::save(
        &request.manifest_path,
        &[ManifestEntry::new("http://host/Halo%203.zip", LinkType::Iso)],
    )
    .unwrap();

    let summary = scheduler
        .run(&request, &NullSink, &CancelToken::new())
        .unwrap();
    assert_eq!(summary.completed, 1);

    // A spawn race shows up as a recorded error; everything else must succeed.
    let entry = &manifest::load(&request.manifest_path).unwrap()[0];
    if entry.god_conversion_error.as_deref().is_some_and(|e| e.contains("busy")) {
        return;
    }
    assert_eq!(summary.converted, 1);
    assert!(entry.god_converted && entry.god_conversion_completed);
    assert_eq!(entry.god_conversion_progress, 100);
    assert!(entry.god_conversion_date.is_some());
    let god_dir = request.convert.god_output_dir.join("Halo 3");
    assert_eq!(entry.god_output_path.as_deref(), god_dir.to_str());
    let args = fs::read_to_string(god_dir.join("args.txt")).unwrap();
    assert!(args.contains("--game-title Halo 3"));
}

#[test]
fn library_isos_are_converted_without_downloading() {
    let temp = tempfile::tempdir().unwrap();
    let program = script(temp.path(), "iso2god", "exit 1");
    let scheduler = Scheduler::new(Transfer::new(OneArchive { body: Vec::new() }))
        .with_converter(Converter::with_program(program).unwrap());
    let mut request = request(temp.path());
    request.filter = EntryFilter::Incomplete;

    fs::create_dir_all(&request.output_dir).unwrap();
    let iso = request.output_dir.join("Halo 3.iso");
    fs::write(&iso, b"iso").unwrap();
    let mut entry = ManifestEntry::new("http://host/Halo%203.zip", LinkType::Iso);
    entry.downloaded = true;
    entry.extracted = true;
    entry.copied = true;
    entry.output_path = Some(iso.display().to_string());
    manifest::save(&request.manifest_path, &[entry]).unwrap();

    let summary = scheduler
        .run(&request, &NullSink, &CancelToken::new())
        .unwrap();
    assert_eq!(summary.total, 0);
    assert_eq!(summary.conversion_failures, 1);

    let entry = &manifest::load(&request.manifest_path).unwrap()[0];
    assert!(!entry.god_converted);
    assert!(entry.god_conversion_error.is_some());
    assert!(entry.is_complete());
}

#[test]
fn conversion_without_converter_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(Transfer::new(OneArchive { body: Vec::new() }));
    let request = request(temp.path());
    manifest::save(&request.manifest_path, &[]).unwrap();

    let result = scheduler.run(&request, &NullSink, &CancelToken::new());
    assert_matches!(result, Err(MyrigetError::ConverterUnavailable(_)));
}
