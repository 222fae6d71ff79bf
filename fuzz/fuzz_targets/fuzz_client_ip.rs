//! Fuzz testing for client IP extraction.
//!
//! Header values come straight from the network, so extraction must never
//! panic and must only ever return a parsed IP address or `"unknown"`.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_client_ip -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use axum::body::Body;
use axum::http::Request;
use edge_gateway::middleware::ip::{extract_client_ip, parse_ip};
use edge_gateway::middleware::UNKNOWN_IP;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    header: u8,
    value: &'a [u8],
}

const HEADERS: [&str; 4] = [
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "x-forwarded-for",
];

fuzz_target!(|input: Input<'_>| {
    if let Ok(s) = std::str::from_utf8(input.value) {
        let _ = parse_ip(s);
    }

    let name = HEADERS[usize::from(input.header) % HEADERS.len()];
    let Ok(req) = Request::builder()
        .header(name, input.value)
        .body(Body::empty())
    else {
        return;
    };

    let ip = extract_client_ip(&req);
    assert!(ip == UNKNOWN_IP || parse_ip(&ip).is_some());
});
