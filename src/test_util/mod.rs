//! Utilities for testing code that talks to the gateway's peers. They are used for testing the
//!  gateway itself, but they are also exported for testing applications built on top of it.

pub mod message;
pub mod peer;
pub mod stream;
