#![forbid(unsafe_code)]

pub mod client;
pub mod detector;
pub mod event_sink;
