//! Reverse proxy: prefix route table and the forwarding service.

pub mod forwarder;
pub mod route;

pub use forwarder::{ProxyService, UpstreamConfig, outbound_headers};
pub use route::{ProxyRoute, RouteMatch, RouteTable, rewrite_path};
