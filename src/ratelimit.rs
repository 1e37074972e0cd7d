// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! Token-bucket bandwidth limiting for storage transfers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A token bucket refilled continuously at a fixed rate with a burst capacity
/// of at most one second's worth of tokens. A rate of zero disables limiting.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    rate: u64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64) -> TokenBucket {
        TokenBucket {
            state: Mutex::new(State {
                rate,
                tokens: rate as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Consume `tokens` tokens and return how long the caller must sleep to
    /// honor the configured rate. Returns zero when unlimited.
    pub fn consume(&self, tokens: u64) -> Duration {
        let mut state = self.state.lock().unwrap();
        if state.rate == 0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let lapse = now.duration_since(state.last).as_secs_f64();
        state.last = now;
        state.tokens += lapse * state.rate as f64;
        if state.tokens > state.rate as f64 {
            state.tokens = state.rate as f64;
        }
        state.tokens -= tokens as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / state.rate as f64)
        }
    }

    /// Consume and immediately sleep for the computed delay.
    pub fn throttle(&self, tokens: u64) {
        let delay = self.consume(tokens);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_delays() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.consume(u64::MAX), Duration::ZERO);
    }

    #[test]
    fn burst_then_delay() {
        let bucket = TokenBucket::new(1000);
        // The initial burst is covered by a full bucket.
        assert_eq!(bucket.consume(1000), Duration::ZERO);
        // The next request must wait roughly a second.
        let delay = bucket.consume(1000);
        assert!(delay > Duration::from_millis(900));
        assert!(delay <= Duration::from_secs(2));
    }
}
