//! Fuzz testing for the credential and address parsers.
//!
//! Everything here is fed straight from request headers, so none of it may
//! panic on any input.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_credentials -- -max_total_time=60
//! ```
//!
//! # What This Tests
//!
//! - `parse_context_str`: `X-Parse-Cloud-Context` values
//! - `parse_basic_credentials`: the payload of `Authorization: Basic`
//! - `ClientSdk::parse`: `X-Parse-Client-Version` values
//! - `IpPolicy`: CIDR lists and client addresses

#![no_main]

use libfuzzer_sys::fuzz_target;
use parse_gate::credentials::{ClientSdk, parse_basic_credentials, parse_context_str};
use parse_gate::ip_policy::IpPolicy;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = parse_context_str(s);
    let _ = parse_basic_credentials(s);
    let _ = ClientSdk::parse(s);

    // First line is the allow list, the rest is the address
    let (ranges, address) = s.split_once('\n').unwrap_or((s, s));
    let policy = IpPolicy::new(ranges.split(',').map(str::to_string).collect());
    let first = policy.is_allowed(address);
    assert_eq!(first, policy.is_allowed(address));
});
