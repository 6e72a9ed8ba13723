use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use rand::prelude::*;
use small_store::{Database, Options};

static INIT: Once = Once::new();

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    INIT.call_once(init_log);
}

fn init_log() {
    use std::io::Write;

    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .is_test(true)
        .try_init()
        .ok();
}

/// A base-file path inside a fresh temp directory. The directory is
/// leaked for the duration of the test process, which keeps the store
/// files inspectable when a test fails.
pub fn temp_base(name: &str) -> PathBuf {
    let dir = tempfile::Builder::new()
        .prefix(&format!("small-store-{}-", name))
        .tempdir()
        .unwrap();
    let base = dir.path().join("store");
    std::mem::forget(dir);
    base
}

/// Options tuned for tests: small cache, no surprise automatic
/// checkpoints.
pub fn quiet_options() -> Options {
    Options::new()
        .max_cache_size(256 * 4096)
        .checkpoint_rate(Duration::from_secs(3600))
        .checkpoint_size_threshold(u64::MAX)
        .checkpoint_delay_threshold(Duration::from_secs(3600))
}

pub fn new_mem_db() -> Database {
    setup();
    Database::open(quiet_options()).unwrap()
}

pub fn new_file_db(name: &str) -> (Database, PathBuf) {
    setup();
    let base = temp_base(name);
    let db = Database::open(quiet_options().base_file(base.clone())).unwrap();
    (db, base)
}

/// Random byte strings for property-ish tests.
pub fn random_pairs(count: usize, value_len: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = rand::thread_rng();
    let mut pairs = Vec::with_capacity(count);
    for i in 0..count {
        let key = format!("key-{:08}-{:04}", rng.gen_range(0, 1_000_000u32), i);
        let value: Vec<u8> = (0..value_len).map(|_| rng.gen()).collect();
        pairs.push((key.into_bytes(), value));
    }
    pairs.sort();
    pairs.dedup_by(|a, b| a.0 == b.0);
    pairs
}

/// Copy the store files (data + redo segments) to a fresh directory,
/// simulating the on-disk state a crash would leave behind. The source
/// engine keeps running; only what already hit the file system is seen,
/// which is exactly the point.
pub fn crash_copy(base: &PathBuf, name: &str) -> PathBuf {
    let target_base = temp_base(name);
    let dir = base.parent().unwrap();
    let prefix = base.file_name().unwrap().to_string_lossy().to_string();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with(&prefix) {
            let suffix = file_name.strip_prefix(&prefix).unwrap();
            let mut target_name = target_base.file_name().unwrap().to_os_string();
            target_name.push(suffix);
            std::fs::copy(entry.path(), target_base.with_file_name(target_name)).unwrap();
        }
    }
    target_base
}
