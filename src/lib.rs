#![allow(
    clippy::len_zero,
    clippy::needless_lifetimes,
    clippy::enum_variant_names,
    clippy::too_many_arguments
)]

#[macro_use]
mod macros;

pub mod allocator;
pub mod cli;
pub mod config;
pub mod kms;
pub mod logger;
pub mod utils;
pub mod video;
