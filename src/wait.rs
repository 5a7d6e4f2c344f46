//! Bounded polling for cluster-assigned state
//!
//! The platform has no synchronous "ready" callback for service addresses or
//! pod termination, so readiness is discovered by repeated reads. The delay
//! is a fixed constant per call site, not exponential backoff: callers pick
//! `(delay, max_tries)` pairs matching the expected convergence time (address
//! assignment is quick, pod termination is slow).

use std::time::Duration;

use tracing::info;

use crate::error::Error;
use crate::Result;

/// Repeatedly invoke `probe` until it returns a value or the try budget is
/// exhausted.
///
/// A `Some` return on try k ≤ `max_tries` ends the wait successfully with
/// that value. Probe errors propagate immediately; probes that merely mean
/// "not ready yet" (e.g. a status query against a resource that does not
/// exist yet) must map that condition to `Ok(None)` themselves.
///
/// After `max_tries` unsuccessful calls, fails with [`Error::PollTimeout`]
/// carrying the attempt count and interval.
pub fn wait_for<T, F>(what: &str, delay: Duration, max_tries: u32, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    for attempt in 1..=max_tries {
        if let Some(value) = probe()? {
            return Ok(value);
        }
        if attempt < max_tries {
            info!(
                what = %what,
                attempt = attempt,
                max_tries = max_tries,
                delay_s = delay.as_secs(),
                "waiting"
            );
            std::thread::sleep(delay);
        }
    }
    Err(Error::PollTimeout {
        what: what.to_string(),
        tries: max_tries,
        delay,
    })
}
