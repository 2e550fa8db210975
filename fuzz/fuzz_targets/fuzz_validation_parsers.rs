//! Fuzz target: user-input parsers.
//!
//! Every parser must reject or accept arbitrary text without panicking, and
//! anything accepted must respect the documented bounds.

#![no_main]

use husk_core::validation::{
    parse_bandwidth, parse_cidr_list, parse_disk_size_gb, parse_domains, parse_duration, parse_memory_mib,
    parse_published_ports, parse_vcpu_count,
};
use husk_core::Cidr;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(v) = parse_vcpu_count(Some(input)) {
        assert!((1..=32).contains(&v));
    }
    if let Ok(m) = parse_memory_mib(Some(input)) {
        assert!((128..=32_768).contains(&m));
    }
    if let Ok(gb) = parse_disk_size_gb(Some(input)) {
        assert!((1..=1024).contains(&gb));
    }
    if let Ok(Some(mbit)) = parse_bandwidth(Some(input)) {
        assert!((1..=1000).contains(&mbit));
    }
    if let Ok(ports) = parse_published_ports(Some(input)) {
        assert!(ports.iter().all(|p| *p >= 1));
    }
    if let Ok(domains) = parse_domains(Some(input)) {
        assert!(domains.iter().all(|d| d.len() <= 253));
    }
    if let Ok(cidrs) = parse_cidr_list(Some(input)) {
        for cidr in cidrs {
            // Display must re-parse to the same network.
            let again: Cidr = cidr.to_string().parse().expect("displayed CIDR must parse");
            assert_eq!(again, cidr);
        }
    }
    let _ = parse_duration(input);
});
