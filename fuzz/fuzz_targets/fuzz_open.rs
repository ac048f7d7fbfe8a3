#![no_main]
use libfuzzer_sys::fuzz_target;
use zfile_rs::{ZFile, ZFileOptions};

// Arbitrary bytes must either parse or fail with an error, never panic
fuzz_target!(|data: &[u8]| {
    let path = std::env::temp_dir().join(format!("fuzz-open-{}.zip", std::process::id()));
    if std::fs::write(&path, data).is_err() {
        return;
    }

    if let Ok(zfile) = ZFile::open(&path, ZFileOptions::default()) {
        let names: Vec<String> = zfile.entries().map(|e| e.name().to_string()).collect();
        for name in names {
            let _ = zfile.read(&name);
        }
    }

    std::fs::remove_file(&path).ok();
});
