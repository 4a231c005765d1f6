/// Longest accepted project slug.
pub const MAX_PROJECT_SLUG_LEN: usize = 128;

/// Returns true if `slug` is a valid project slug (`[a-z0-9][a-z0-9_-]*`).
pub fn is_valid_project_slug(slug: &str) -> bool {
    if slug.len() > MAX_PROJECT_SLUG_LEN {
        return false;
    }
    let mut chars = slug.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Slug used in snapshot manifest file names.
///
/// Runs of characters outside `[A-Za-z0-9_-]` collapse to a single `-`, the
/// result is trimmed of `-` and lower-cased. An empty result becomes `run`.
pub fn snapshot_slug(run_name: &str) -> String {
    let mut slug = String::with_capacity(run_name.len());
    let mut in_run = false;
    for ch in run_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            in_run = false;
            slug.push(ch.to_ascii_lowercase());
        } else if !in_run {
            in_run = true;
            slug.push('-');
        }
    }

    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug.to_string()
    }
}

/// Trim an output name and replace spaces with underscores.
///
/// Returns `None` when nothing is left.
pub fn sanitize_output_name(name: &str) -> Option<String> {
    let sanitized = name.trim().replace(' ', "_");
    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}
