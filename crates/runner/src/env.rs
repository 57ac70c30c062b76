//! Child environment construction.
//!
//! The agent child sees nothing from the host process environment except
//! an explicit whitelist; the env store record and the per-request extras
//! are layered on top, extras winning.

use std::collections::HashMap;

/// Host variables the child is allowed to inherit
const HOST_WHITELIST: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "TMPDIR", "LANG", "LC_ALL",
];

/// Compose the full child environment. Precedence, lowest first:
/// whitelisted host vars, then the store record, then `extra`.
pub fn build_child_env(
    store: &HashMap<String, String>,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for key in HOST_WHITELIST {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }

    for (key, value) in store {
        env.insert(key.clone(), value.clone());
    }

    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_shadows_host_and_extra_shadows_store() {
        std::env::set_var("AGENTDECK_TEST_HOSTVAR", "host");

        let mut store = HashMap::new();
        store.insert("ANTHROPIC_TOKEN".to_string(), "store".to_string());
        store.insert("LAYERED".to_string(), "store".to_string());

        let mut extra = HashMap::new();
        extra.insert("LAYERED".to_string(), "extra".to_string());

        let env = build_child_env(&store, &extra);

        // Host vars outside the whitelist never leak through
        assert!(!env.contains_key("AGENTDECK_TEST_HOSTVAR"));
        assert_eq!(env.get("ANTHROPIC_TOKEN").map(String::as_str), Some("store"));
        assert_eq!(env.get("LAYERED").map(String::as_str), Some("extra"));
    }

    #[test]
    fn removing_a_store_key_removes_it_from_the_child() {
        // Simulates the host exporting a secret the store does not carry:
        // since it is not whitelisted, the child must not see it at all.
        std::env::set_var("ANTHROPIC_TOKEN", "host");
        let env = build_child_env(&HashMap::new(), &HashMap::new());
        assert!(!env.contains_key("ANTHROPIC_TOKEN"));
        std::env::remove_var("ANTHROPIC_TOKEN");
    }

    #[test]
    fn whitelist_passes_through_when_set() {
        std::env::set_var("LANG", "en_US.UTF-8");
        let env = build_child_env(&HashMap::new(), &HashMap::new());
        assert_eq!(env.get("LANG").map(String::as_str), Some("en_US.UTF-8"));
    }
}
