
use {std::time::Duration, uapi::c};

/// Converts a timeout to the millisecond argument of `poll`.
///
/// Partial milliseconds are rounded up so that a short wait never turns into
/// a non-blocking poll. `None` blocks indefinitely.
pub fn poll_timeout(timeout: Option<Duration>) -> c::c_int {
    let Some(t) = timeout else {
        return -1;
    };
    let ms = t.as_micros().div_ceil(1000);
    ms.min(c::c_int::MAX as u128) as c::c_int
}
