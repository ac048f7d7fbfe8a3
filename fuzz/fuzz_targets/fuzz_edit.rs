#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;
use zfile_rs::{CompressionMethod, ZFile, ZFileOptions};

#[derive(Debug, Arbitrary)]
enum Op {
    Put { name: u8, data: Vec<u8>, stored: bool },
    Remove { name: u8 },
    Update,
    Compact,
}

fuzz_target!(|ops: Vec<Op>| {
    let path = std::env::temp_dir().join(format!("fuzz-edit-{}.zip", std::process::id()));
    std::fs::remove_file(&path).ok();

    let mut model = BTreeMap::new();
    let mut zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();

    for op in ops {
        match op {
            Op::Put { name, data, stored } => {
                let name = format!("f/{}", name % 16);
                let method = stored.then_some(CompressionMethod::Stored);
                zfile.put(&name, &data, method).unwrap();
                model.insert(name, data);
            }
            Op::Remove { name } => {
                let name = format!("f/{}", name % 16);
                assert_eq!(zfile.remove(&name).unwrap(), model.remove(&name).is_some());
            }
            Op::Update => zfile.update().unwrap(),
            Op::Compact => zfile.compact().unwrap(),
        }
    }
    zfile.close().unwrap();

    let zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    assert_eq!(zfile.len(), model.len());
    for (name, data) in &model {
        assert_eq!(&zfile.read(name).unwrap(), data);
    }

    std::fs::remove_file(&path).ok();
});
