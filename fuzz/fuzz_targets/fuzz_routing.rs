//! Fuzz testing for prefix matching and path rewriting.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_routing -- -max_total_time=60
//! ```
//!
//! # What This Tests
//!
//! - `rewrite_path` never panics and always yields a path starting with `/`
//! - `RouteTable::resolve` never panics, and a match always targets the
//!   configured base URL

#![no_main]

use arbitrary::Arbitrary;
use edge_gateway::proxy::{ProxyRoute, RouteTable, rewrite_path};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    prefix: &'a str,
    path: &'a str,
    query: Option<&'a str>,
}

fuzz_target!(|input: Input<'_>| {
    if let Some(rewritten) = rewrite_path(input.prefix, input.path) {
        assert!(rewritten.starts_with('/'));
    }

    let Ok(table) = RouteTable::new(vec![
        ProxyRoute::new(input.prefix, "http://backend.internal:8080"),
        ProxyRoute::new("/", "http://fallback.internal"),
    ]) else {
        return;
    };

    if let Some(found) = table.resolve(input.path, input.query) {
        assert!(
            found.target.starts_with("http://backend.internal:8080/")
                || found.target.starts_with("http://fallback.internal/")
        );
    }
});
