use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root) and tools (`ip`)
/// available to create network namespaces. Returns `false` if the test
/// environment cannot support namespace-based topology tests.
pub fn check_privileges() -> bool {
    let listable = match Command::new("ip").arg("netns").output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    };
    if !listable {
        return false;
    }
    // Listing can succeed unprivileged; probe an actual add/del cycle.
    let probe = format!("nbp_{:x}", std::process::id() % 0xFFFF);
    let added = Command::new("ip")
        .args(["netns", "add", &probe])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if added {
        let _ = Command::new("ip").args(["netns", "del", &probe]).output();
    }
    added
}

/// Generates a unique resource name with the given prefix.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel. Names are truncated to 15
/// characters to respect the Linux interface name limit.
pub fn unique_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}_{:x}_{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}
