//! Fuzz target for the content-addressed path transform.

#![no_main]

use hoard_storage::{cas_path_transform, SEGMENT_WIDTH};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|key: &str| {
    let path_key = cas_path_transform(key);

    assert_eq!(path_key.file_name.len(), 40);
    assert!(path_key.directory.iter().all(|s| s.len() == SEGMENT_WIDTH));
    assert_eq!(path_key.directory.concat(), path_key.file_name);
    assert_eq!(path_key, cas_path_transform(key));
});
