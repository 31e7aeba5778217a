//! Integration tests for the session manager
//! These tests drive the real HTTP stack against a local mock server

pub mod test_harness;

pub mod http_authority_test;
pub mod session_lifecycle_test;
