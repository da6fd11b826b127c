//! Best-effort process title, `resque-<version>: <status>`.
//!
//! The full title is kept in-process (readable for tests and debugging); on
//! Linux the first bytes are additionally pushed to the kernel with
//! `PR_SET_NAME` so `ps` shows what the worker is doing.

use std::sync::RwLock;

use once_cell::sync::Lazy;

static CURRENT: Lazy<RwLock<String>> = Lazy::new(|| RwLock::new(String::new()));

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn set(status: &str) {
    let new_title = format!("resque-{VERSION}: {status}");
    os_set(&new_title);
    if let Ok(mut current) = CURRENT.write() {
        *current = new_title;
    }
}

pub fn current() -> String {
    CURRENT.read().map(|title| title.clone()).unwrap_or_default()
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn os_set(new_title: &str) {
    use std::ffi::CString;

    // PR_SET_NAME keeps at most 15 bytes plus the terminator.
    let truncated = &new_title.as_bytes()[..new_title.len().min(15)];
    let Ok(name) = CString::new(truncated.to_vec()) else {
        return;
    };
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
fn os_set(_new_title: &str) {}
