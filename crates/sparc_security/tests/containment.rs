//! Property tests: resolved paths never leave the project root.

use proptest::prelude::*;
use sparc_security::{GuardError, ProjectManager};
use std::path::PathBuf;
use tempfile::TempDir;

fn segment() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("..".to_string()),
        Just(".".to_string()),
        Just("imagery".to_string()),
        Just("masks".to_string()),
        "[a-z]{1,6}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn resolve_stays_inside_root(segments in prop::collection::vec(segment(), 1..8)) {
        let tmp = TempDir::new().unwrap();
        let manager = ProjectManager::new(tmp.path().join("projects")).unwrap();
        let layout = manager.initialize("demo").unwrap();

        let relative: PathBuf = segments.iter().collect();
        match manager.resolve("demo", &relative) {
            Ok(resolved) => prop_assert!(resolved.starts_with(&layout.root)),
            Err(GuardError::PathEscape { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn escaping_prefix_always_rejected(depth in 2usize..6, tail in "[a-z]{1,8}") {
        let tmp = TempDir::new().unwrap();
        let manager = ProjectManager::new(tmp.path().join("projects")).unwrap();
        manager.initialize("demo").unwrap();

        let mut relative = PathBuf::new();
        for _ in 0..depth {
            relative.push("..");
        }
        relative.push(tail);
        let result = manager.resolve("demo", &relative);
        let is_path_escape = matches!(result, Err(GuardError::PathEscape { .. }));
        prop_assert!(is_path_escape);
    }
}
