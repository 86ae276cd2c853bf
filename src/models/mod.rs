//! Data models for captured operations

pub mod operation;

pub use operation::*;
