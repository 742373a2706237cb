#[macro_use]
extern crate tracing;

pub(crate) mod client;
pub mod compression;
pub mod element;
pub mod error;
pub mod filter;
pub mod models;
pub mod pipeline;
pub mod rootfs;
pub mod sink;
pub mod source;
pub mod tarformat;

#[cfg(test)]
pub(crate) mod testutil;

pub type Result<T> = std::result::Result<T, error::Error>;
