//! Portable request descriptions
//!
//! Converts completed requests into Postman collection items, the format the
//! webhook receives.

mod postman;

pub use postman::*;
