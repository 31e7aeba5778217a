//! Unit tests for the session manager
//!
//! Scenario tests drive a complete `AuthService` against the scripted
//! authority in `test_helpers`.


mod session_scenarios_test;
