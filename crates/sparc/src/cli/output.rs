use serde::Serialize;

use crate::cli::error::{CliError, CliResult, EXIT_INVALID};

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::new(format!("Failed to encode output: {err}"), EXIT_INVALID))?;
    println!("{text}");
    Ok(())
}
