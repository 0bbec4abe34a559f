//! HTTP handlers.
//!
//! `survey` serves participants and the survey application; `internal`
//! serves signed calls from peer instances.

pub mod internal;
pub mod survey;
