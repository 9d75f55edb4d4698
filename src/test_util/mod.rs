//! Utilities for testing code that uses dispatchers. They are used by this crate's own tests, and
//!  they are exported for application tests.

pub mod loopback;
