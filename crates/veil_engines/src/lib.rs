#![forbid(unsafe_code)]

pub mod fhe_backend;
pub mod rules;
pub mod sim_fhe;
