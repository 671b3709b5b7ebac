//! Virtual memory cap of the adapter process.
//!
//! Summarizing a corrupted value may ask the engine for absurd allocations, the cap turns those
//! into allocation failures instead of an exhausted host.

use nix::sys::resource::{getrlimit, setrlimit, Resource};

pub const MEMORY_LIMIT: u64 = 16 << 30;

/// Soft limit to request, never above the hard limit.
fn soft_limit(requested: u64, hard: u64) -> u64 {
    requested.min(hard)
}

/// Cap RLIMIT_AS at `limit` bytes (or the hard limit if lower).
pub fn set_memory_limit(limit: u64) -> nix::Result<()> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_AS)?;
    let new_soft = soft_limit(limit, hard);
    if new_soft < soft {
        setrlimit(Resource::RLIMIT_AS, new_soft, hard)?;
        log::debug!(target: "dap", "address space limit set to {new_soft} bytes");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_soft_limit() {
        assert_eq!(soft_limit(MEMORY_LIMIT, u64::MAX), 16 * 1024 * 1024 * 1024);
        assert_eq!(soft_limit(MEMORY_LIMIT, 1 << 30), 1 << 30);
    }

    #[test]
    fn test_current_limits_readable() {
        let (soft, hard) = getrlimit(Resource::RLIMIT_AS).unwrap();
        assert!(soft <= hard);
    }
}
