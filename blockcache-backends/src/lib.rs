//! Network object-store backends for the `blockcache` crate. Kept in a
//! satellite crate, the way `infinitree-backends` sits beside
//! `infinitree`, so the core cache crate stays free of an async runtime
//! and HTTP stack.

mod region;
mod s3;

pub use region::Region;
pub use s3::S3;
pub use rusty_s3::Credentials;
