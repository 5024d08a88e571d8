//! Data models for the ReqMapper relay
//!
//! Provider wire events, the correlator's request records and the settings
//! snapshot.

pub mod events;
pub mod request;
pub mod settings;

pub use events::*;
pub use request::*;
pub use settings::*;
