//! Named fault-injection points for crash and error-path testing.
//!
//! A crash point in engine code calls `maybe_fail("wal.commit.x")` and
//! gets an error back when that point is armed. Unit tests arm a point
//! for the current thread through an RAII guard, so the point disarms
//! when the test scope ends even on panic:
//!
//! ```ignore
//! let _fp = failpoint::arm("txn.commit.after_wal");
//! assert!(tm.commit(txn).is_err());
//! ```
//!
//! Integration tests that crash a child engine list points in the
//! `RHEA_FAILPOINTS` environment variable (comma-separated); that set is
//! parsed once per process.

use std::cell::RefCell;
use std::io;
use std::sync::OnceLock;

thread_local! {
    /// Points armed on this thread; a name may be armed more than once
    /// by nested guards.
    static ARMED: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

fn env_points() -> &'static [String] {
    static POINTS: OnceLock<Vec<String>> = OnceLock::new();
    POINTS.get_or_init(|| {
        std::env::var("RHEA_FAILPOINTS")
            .map(|raw| {
                raw.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    })
}

/// Arms `name` on the current thread until the returned guard drops.
#[must_use = "the failpoint disarms as soon as the guard drops"]
pub fn arm(name: &'static str) -> Armed {
    ARMED.with(|points| points.borrow_mut().push(name));
    Armed { name }
}

/// Keeps one failpoint armed; disarms on drop.
pub struct Armed {
    name: &'static str,
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|points| {
            let mut points = points.borrow_mut();
            if let Some(pos) = points.iter().rposition(|armed| *armed == self.name) {
                points.remove(pos);
            }
        });
    }
}

/// Whether `name` is armed, via a guard on this thread or the process
/// environment.
pub fn triggered(name: &str) -> bool {
    let thread_armed = ARMED.with(|points| points.borrow().iter().any(|armed| *armed == name));
    thread_armed || env_points().iter().any(|point| point == name)
}

/// The crash-point hook: errors out when `name` is armed.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if triggered(name) {
        Err(io::Error::other(format!("failpoint {name} hit")))
    } else {
        Ok(())
    }
}
