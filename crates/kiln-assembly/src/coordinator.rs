//! Multi-Instance Coordinator (spec component H): forks `instances - 1`
//! peer workers, all sharing the same filesystem state. The fork returning
//! `0` is the lead; every other index runs as a peer.

use kiln_core::{Error, Result};

/// Forks `instances - 1` additional processes. Returns this process's fork
/// index: `0` for the lead (either the original process when `instances`
/// is 1, or the first child never to recurse further), `1..instances` for
/// peers. Each process gets exactly one index; nobody forks twice.
pub fn fork_peers(instances: u32) -> Result<u32> {
    if instances <= 1 {
        return Ok(0);
    }

    for index in 1..instances {
        // SAFETY: fork(2) is async-signal-safe here; the child immediately
        // breaks out to its own index without touching non-reentrant state.
        #[expect(unsafe_code, reason = "fork(2) has no safe std wrapper")]
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                return Err(Error::io(
                    std::io::Error::last_os_error(),
                    "forking peer instance",
                    None,
                ));
            }
            0 => return Ok(index),
            _ => continue,
        }
    }
    Ok(0)
}
