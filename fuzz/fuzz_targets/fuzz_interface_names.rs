//! Fuzz target: slot recovery from host interface names.
//!
//! Slot allocation scans live interface names; any name must map to at
//! most one slot, and that slot's own devices must map back to it.

#![no_main]

use husk_core::Slot;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(slot) = Slot::from_interface_name(name) {
        assert_eq!(Slot::from_interface_name(&slot.tap_device()), Some(slot));
        assert_eq!(Slot::from_interface_name(&slot.veth_host()), Some(slot));
        assert_eq!(Slot::from_host_ip(slot.host_ip()).ok(), Some(slot));
    }
});
