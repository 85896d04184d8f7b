use std::collections::HashSet;
use std::fs;
use std::io::Cursor;

use assert_matches::assert_matches;
use serde_json::{Value, json};

use myriget::domain::{ImportMode, LinkType};
use myriget::error::MyrigetError;
use myriget::events::{NullSink, RecordingSink};
use myriget::library::{library_sizes, probe_missing_sizes};
use myriget::manifest::{self, CanonicalSchema, ManifestEntry};
use myriget::transfer::{HttpSource, RemoteBody, Transfer};

struct JsonSource {
    body: Value,
}

impl HttpSource for JsonSource {
    fn open(&self, _url: &str) -> Result<RemoteBody, MyrigetError> {
        let bytes = serde_json::to_vec(&self.body).unwrap();
        Ok(RemoteBody {
            content_length: bytes.len() as u64,
            reader: Box::new(Cursor::new(bytes)),
        })
    }

    fn content_length(&self, url: &str) -> Result<Option<u64>, MyrigetError> {
        if url.contains("unknown") {
            return Ok(None);
        }
        Ok(Some(1234))
    }
}

fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|url| url.to_string()).collect()
}

#[test]
fn merge_backs_up_primary_and_unions_by_url() {
    let temp = tempfile::tempdir().unwrap();
    let primary = temp.path().join("links.json");
    let secondary = temp.path().join("other.json");
    let mut a = ManifestEntry::new("http://x/a.zip", LinkType::Iso);
    a.copied = true;
    manifest::save(&primary, &[a, ManifestEntry::new("http://x/b.zip", LinkType::Iso)]).unwrap();
    let mut sized = ManifestEntry::new("http://x/b.zip", LinkType::Iso);
    sized.size_bytes = 500;
    manifest::save(
        &secondary,
        &[sized, ManifestEntry::new("http://x/c.zip", LinkType::Xbla)],
    )
    .unwrap();
    let original = fs::read(&primary).unwrap();

    let report = manifest::merge(&primary, &secondary).unwrap();
    assert_eq!((report.added, report.duplicates, report.size_updates, report.total), (1, 1, 1, 3));
    assert_eq!(fs::read(manifest::backup_path(&primary)).unwrap(), original);

    let merged = manifest::load(&primary).unwrap();
    let urls: Vec<&str> = merged.iter().map(|e| e.url.as_str()).collect();
    assert_eq!(urls, vec!["http://x/a.zip", "http://x/b.zip", "http://x/c.zip"]);
    assert!(merged[0].copied);
    assert_eq!(merged[1].size_bytes, 500);
}

#[test]
fn merge_requires_both_inputs() {
    let temp = tempfile::tempdir().unwrap();
    let primary = temp.path().join("links.json");
    manifest::save(&primary, &[]).unwrap();
    let result = manifest::merge(&primary, &temp.path().join("missing.json"));
    assert_matches!(result, Err(MyrigetError::MergeInputMissing(_)));
}

#[test]
fn fix_is_idempotent_and_only_backs_up_on_change() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("links.json");
    fs::write(
        &path,
        serde_json::to_string(&json!([
            {"url": "http://x/Halo_3.zip", "link_type": "ISO"},
            {"url": "http://x/arcade.zip", "link_type": "XBLA", "custom": 1}
        ]))
        .unwrap(),
    )
    .unwrap();
    let schema = CanonicalSchema::default();

    assert!(manifest::fix_missing_fields_file(&path, &schema).unwrap());
    let fixed = fs::read(&path).unwrap();
    let backup = manifest::backup_path(&path);
    assert!(backup.is_file());
    fs::remove_file(&backup).unwrap();

    assert!(!manifest::fix_missing_fields_file(&path, &schema).unwrap());
    assert_eq!(fs::read(&path).unwrap(), fixed);
    assert!(!backup.exists());

    let value: Value = serde_json::from_slice(&fixed).unwrap();
    assert_eq!(value[0]["name"], json!("Halo 3"));
    assert_eq!(value[0]["god_conversion_progress"], json!(0));
    assert_eq!(value[1]["custom"], json!(1));
    assert!(value[1].get("god_converted").is_none());
}

#[test]
fn process_urls_appends_only_unseen_urls() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("links.json");
    manifest::process_urls(
        &path,
        &urls(&["http://x/a.zip", "http://x/b.zip"]),
        ImportMode::Append,
        LinkType::Iso,
        &NullSink,
    )
    .unwrap();

    let report = manifest::process_urls(
        &path,
        &urls(&["  http://x/b.zip ", "", "http://x/c.zip", "http://x/c.zip"]),
        ImportMode::Append,
        LinkType::Xbla,
        &NullSink,
    )
    .unwrap();
    assert_eq!((report.added, report.skipped, report.total), (1, 2, 3));

    let entries = manifest::load(&path).unwrap();
    let unique: HashSet<&str> = entries.iter().map(|e| e.url.as_str()).collect();
    assert_eq!(unique.len(), entries.len());
    assert_eq!(entries[2].link_type, LinkType::Xbla);
    assert_eq!(entries[2].size_bytes, 0);
}

#[test]
fn process_urls_replace_discards_existing() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("links.json");
    manifest::save(&path, &[ManifestEntry::new("http://x/old.zip", LinkType::Iso)]).unwrap();

    let sink = RecordingSink::default();
    manifest::process_urls(
        &path,
        &urls(&["http://x/new.zip"]),
        ImportMode::Replace,
        LinkType::Iso,
        &sink,
    )
    .unwrap();
    let entries = manifest::load(&path).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].url, "http://x/new.zip");
    assert!(sink.statuses().iter().any(|s| s.contains("saved successfully")));
}

#[test]
fn process_urls_recovers_from_corrupt_manifest() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("links.json");
    fs::write(&path, "{ not json").unwrap();

    let report = manifest::process_urls(
        &path,
        &urls(&["http://x/a.zip"]),
        ImportMode::Append,
        LinkType::Iso,
        &NullSink,
    )
    .unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(manifest::load(&path).unwrap().len(), 1);
}

#[test]
fn import_appends_and_replaces() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("links.json");
    manifest::save(&path, &[ManifestEntry::new("http://x/a.zip", LinkType::Iso)]).unwrap();
    let source = JsonSource {
        body: json!([
            {"url": "http://x/a.zip", "link_type": "ISO"},
            {"url": "http://x/b.zip", "link_type": "XBLA"},
            {"url": "http://x/b.zip", "link_type": "XBLA"}
        ]),
    };

    let count = manifest::import_from_url(
        &source,
        "http://remote/links.json",
        &path,
        ImportMode::Append,
        &NullSink,
    )
    .unwrap();
    assert_eq!(count, 2);

    manifest::save(&path, &[ManifestEntry::new("http://x/z.zip", LinkType::Iso)]).unwrap();
    let count = manifest::import_from_url(
        &source,
        "http://remote/links.json",
        &path,
        ImportMode::Replace,
        &NullSink,
    )
    .unwrap();
    assert_eq!(count, 2);
    assert!(manifest::load(&path).unwrap().iter().all(|e| e.url != "http://x/z.zip"));
}

#[test]
fn import_rejects_non_list_payload() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("links.json");
    let source = JsonSource {
        body: json!({"links": []}),
    };
    let sink = RecordingSink::default();
    let result = manifest::import_from_url(
        &source,
        "http://remote/links.json",
        &path,
        ImportMode::Replace,
        &sink,
    );
    assert!(result.is_err());
    assert!(!path.exists());
    assert!(sink.statuses()[0].starts_with("Error importing links"));
}

#[test]
fn sizes_are_summarized_and_probed() {
    let mut known = ManifestEntry::new("http://x/a.zip", LinkType::Iso);
    known.size_bytes = 1000;
    let mut entries = vec![
        known,
        ManifestEntry::new("http://x/b.zip", LinkType::Iso),
        ManifestEntry::new("http://x/unknown.zip", LinkType::XblaAddons),
    ];
    let before = library_sizes(&entries);
    assert_eq!(before.get(LinkType::Iso).unwrap().missing_size, 1);

    let transfer = Transfer::new(JsonSource { body: json!([]) });
    let updated = probe_missing_sizes(&mut entries, &transfer, &NullSink);
    assert_eq!(updated, 1);
    assert_eq!(entries[1].size_bytes, 1234);
    assert_eq!(entries[2].size_bytes, 0);

    let after = library_sizes(&entries);
    assert_eq!(after.get(LinkType::Iso).unwrap().total_bytes, 2234);
    assert_eq!(after.get(LinkType::XblaAddons).unwrap().missing_size, 1);
    assert_eq!(after.recommended_free_bytes, (2234.0 * 1.2) as u64);
}

#[test]
fn reset_god_status_clears_conversion_fields() {
    let mut entry = ManifestEntry::new("http://x/a.zip", LinkType::Iso);
    entry.god_converted = true;
    entry.god_conversion_progress = 100;
    entry.god_conversion_error = Some("frozen".to_string());
    let mut entries = vec![entry, ManifestEntry::new("http://x/b.zip", LinkType::Iso)];

    assert_eq!(manifest::reset_god_status(&mut entries), 1);
    assert!(!entries[0].god_converted);
    assert_eq!(entries[0].god_conversion_progress, 0);
    assert!(entries[0].god_conversion_error.is_none());
}
