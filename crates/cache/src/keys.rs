//! Mapping from cache keys to object-store names

/// Replace characters that are unsafe in object names and guard against a
/// leading dot
///
/// One-way but collision-free on the instance grammar, since the replaced
/// characters are not part of it.
#[must_use]
pub fn sanitize_instance(instance: &str) -> String {
    let mut sanitized: String = instance
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect();

    if sanitized.starts_with('.') {
        sanitized.insert_str(0, "cache_");
    }

    sanitized
}

/// Canonical object name for a content entry
#[must_use]
pub fn object_name(instance: &str, hash: &str) -> String {
    format!("cache/{}/{}", sanitize_instance(instance), hash)
}

/// Canonical object name for an action-result entry
#[must_use]
pub fn action_result_name(instance: &str, hash: &str) -> String {
    format!("cache/{}/action_result/{}", sanitize_instance(instance), hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize_instance("ci/linux"), "ci_linux");
        assert_eq!(sanitize_instance("a\\b:c"), "a_b_c");
    }

    #[test]
    fn test_sanitize_guards_leading_dot() {
        assert_eq!(sanitize_instance(".hidden"), "cache_.hidden");
    }

    #[test]
    fn test_sanitize_passes_plain_names() {
        assert_eq!(sanitize_instance("teamA-1_x"), "teamA-1_x");
    }

    #[test]
    fn test_object_name_is_deterministic() {
        let hash = "a".repeat(64);
        let first = object_name("teamA", &hash);
        let second = object_name("teamA", &hash);
        assert_eq!(first, second);
        assert_eq!(first, format!("cache/teamA/{hash}"));
    }

    #[test]
    fn test_action_result_name_uses_sub_prefix() {
        let hash = "b".repeat(64);
        assert_eq!(
            action_result_name("teamA", &hash),
            format!("cache/teamA/action_result/{hash}")
        );
    }

    #[test]
    fn test_distinct_hashes_never_collide() {
        assert_ne!(
            object_name("teamA", &"c".repeat(64)),
            object_name("teamA", &"d".repeat(64))
        );
        assert_ne!(
            object_name("a-b", &"c".repeat(64)),
            object_name("a_b", &"c".repeat(64))
        );
    }
}
