//! Prefixed ID generation.
//!
//! Guest and capture names use a `prefix_` followed by a UUIDv7
//! (time-ordered). IDs are unique without any shared mutable counter, so
//! two managers in one process can never collide.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a guest (emulated VM) ID: `guest_<uuid7>`
pub fn guest_id() -> String {
    prefixed_id("guest")
}

/// Generate a packet-capture ID: `cap_<uuid7>`
pub fn capture_id() -> String {
    prefixed_id("cap")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(guest_id().starts_with("guest_"));
        assert!(capture_id().starts_with("cap_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = guest_id();
        let b = guest_id();
        assert_ne!(a, b);
    }
}
