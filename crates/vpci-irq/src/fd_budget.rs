use libc::{getrlimit, rlimit, setrlimit, RLIMIT_NOFILE};
use log::warn;

/// Raises the process's soft `RLIMIT_NOFILE` if it is below `128 + needed`,
/// where `needed` is the sum of every capability's `nr_entries`. Best-effort:
/// the fd budget is not on a fatal path, so a failed raise only means MSI-X
/// enable may fail later with a warning.
pub fn reserve_fd_budget(needed: u64) {
    const BASE: u64 = 128;
    let want = BASE + needed;

    // SAFETY: `limit` is fully initialized by `getrlimit` before being read.
    unsafe {
        let mut limit: rlimit = std::mem::zeroed();
        if getrlimit(RLIMIT_NOFILE, &mut limit) != 0 {
            warn!("getrlimit(RLIMIT_NOFILE) failed: {}", std::io::Error::last_os_error());
            return;
        }
        if limit.rlim_cur as u64 >= want {
            return;
        }
        let new_cur = want.min(limit.rlim_max as u64);
        if new_cur < want {
            warn!(
                "RLIMIT_NOFILE hard limit {} is below the {} fds this device may need; proceeding anyway",
                limit.rlim_max, want
            );
        }
        limit.rlim_cur = new_cur as libc::rlim_t;
        if setrlimit(RLIMIT_NOFILE, &limit) != 0 {
            warn!("setrlimit(RLIMIT_NOFILE, {}) failed: {}", new_cur, std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_panic_on_a_tiny_request() {
        reserve_fd_budget(0);
    }
}
