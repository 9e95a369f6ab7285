// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the first call in this process. All scheduler
/// deadlines and session liveness stamps are expressed on this clock.
pub fn timer_now() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_micros() as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = timer_now();
        let b = timer_now();
        assert!(b >= a);
    }
}
