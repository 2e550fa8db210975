//! Fuzz target: `POST /v1/vms` body decoding and validation.
//!
//! Arbitrary JSON must either be rejected or yield options within bounds.

#![no_main]

use husk_gateway::routes::CreateVmBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice::<CreateVmBody>(data) else {
        return;
    };
    if let Ok(options) = body.into_options() {
        assert!((1..=32).contains(&options.vcpus));
        assert!((128..=32_768).contains(&options.mem_mib));
        assert!(options.published_ports.iter().all(|p| *p >= 1));
        assert!(options.rules.normalized().is_ok(), "normalized rules stay normalized");
    }
});
