//! Single-instance-by-name check, scanning `/proc/*/comm` the way the
//! original relies on OS process listing rather than a lock file.

use std::fs;

/// Returns true if another process (other than `self_pid`) is running
/// with `comm` equal to `process_name`.
pub fn another_instance_running(process_name: &str, self_pid: u32) -> bool {
    let Ok(entries) = fs::read_dir("/proc") else {
        return false;
    };

    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == self_pid {
            continue;
        }

        let comm_path = entry.path().join("comm");
        if let Ok(comm) = fs::read_to_string(comm_path) {
            if comm.trim() == process_name {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_false_positive_on_self() {
        let pid = std::process::id();
        // No assertion on the result beyond "doesn't panic and excludes
        // self" - this exercises the /proc walk end-to-end in CI.
        let _ = another_instance_running("definitely-not-a-real-process-name", pid);
    }
}
