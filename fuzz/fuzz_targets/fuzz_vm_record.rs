//! Fuzz target: decoding of persisted VM records.
//!
//! State files are read back from disk; a corrupt one must fail to decode,
//! never panic, and a decodable one must survive a re-encode.

#![no_main]

use husk_core::VmRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = serde_json::from_slice::<VmRecord>(data) else {
        return;
    };
    let json = serde_json::to_vec(&record).expect("VmRecord serialization must not fail");
    let again: VmRecord = serde_json::from_slice(&json).expect("re-encoded VmRecord must decode");
    assert_eq!(again, record);
});
