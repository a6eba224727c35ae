#![forbid(unsafe_code)]

pub mod detect_cli;
