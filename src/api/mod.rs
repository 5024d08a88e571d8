//! ReqMapper API
//!
//! Entry points for hosts embedding the relay core.

pub mod relay_api;
