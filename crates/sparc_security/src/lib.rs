//! Sparc filesystem security
//!
//! Provides:
//! - **Path Guard**: project slug validation and containment of every
//!   user-supplied path inside its project root
//! - **Layout**: the fixed per-project directory structure
//! - **Signing**: streaming SHA-256 content digests

pub mod layout;
pub mod path_guard;
pub mod signing;

pub use layout::ProjectLayout;
pub use path_guard::{GuardError, ProjectManager};
pub use signing::{sha256, sha256_file};
