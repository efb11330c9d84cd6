//! Helpers shared between the crate's tests: well-known endpoints and an in-memory
//!  storage backend. This is a regular module rather than a test-only one so downstream
//!  crates can reuse the backend in their own tests.

pub mod memory_backend;

use crate::link::Endpoint;

pub const CLIENT_ENDPOINT: Endpoint = Endpoint::new(1, 1);
pub const SERVER_ENDPOINT: Endpoint = Endpoint::new(13, 13);
