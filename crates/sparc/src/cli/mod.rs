//! CLI module for Sparc
//!
//! Every command prints JSON on stdout. Logs go to the rolling file under the
//! log directory and, with `-v`, to stderr.

pub mod config;
pub mod error;
pub mod output;

pub mod project;
pub mod status;
pub mod submit;
pub mod worker;
