// src/utils/path.rs
use std::path::Path;

/// True when `name` is a single, plain path component (no separators, no `..`).
pub fn is_plain_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && Path::new(name).components().count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_components() {
        assert!(is_plain_component("20250101_000000_Alex_Chen"));
        assert!(!is_plain_component("../x"));
        assert!(!is_plain_component("a/b"));
        assert!(!is_plain_component(".."));
        assert!(!is_plain_component(""));
    }
}
