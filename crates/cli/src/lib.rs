//! Output helpers shared by the `snapdex` binary.
pub mod report;
