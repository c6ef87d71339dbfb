//! Pluggable resource sources and the resource manager (spec §4.2, §4.3).

pub mod cpu;
pub mod hugepages;
pub mod manager;
#[cfg(feature = "sgx")]
pub mod sgx;
pub mod source;

pub use manager::{ClassStatus, NumaScheduler, ResourceManager};
pub use source::ResourceSource;

pub mod memory;
