//! Config - policy configuration
//!
//! - `policy.rs` - command allow-list, directory and environment rules

mod policy;

pub use policy::{
    CommandPolicy, DirectoryRestriction, SecurityPolicy, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
