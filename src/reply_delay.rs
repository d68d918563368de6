use core::cell::Cell;

use critical_section::Mutex;

use crate::delay::{DelaySource, MAX_CRITICAL_DELAY_US};
use crate::MAX_FRAME_SIZE;

/// Preamble and sync word bytes the radio sends ahead of every frame. They
/// count toward the on-air time of a maximum-size frame and therefore toward
/// the reply-delay scalar.
const PHY_PREAMBLE_SYNC_BYTES: u32 = 8;

/// Milliseconds added to the computed on-air time: processing time on the
/// peer, receive-path lag on our side, and round trips lost to CCA retries.
const PLATFORM_FUDGE_FACTOR_MS: u16 = 2;

/// The delay loop sleeps in chunks of this size and checks the kill flag
/// after each full quantum.
const REPLY_DELAY_QUANTUM_US: u32 = 1000;

/// Bounds how long a node keeps its receiver powered waiting for a reply
/// after a transmit.
///
/// The wait runs on the mainline; the kill flag may be posted from the
/// receive-complete callback in interrupt context, so both flags live behind
/// critical sections. This is a cooperative single-consumer cancellation
/// token, not a general semaphore: posting while no wait is active is a
/// no-op.
pub(crate) struct ReplyDelayTimer {
    scalar_ms: u16,
    active: Mutex<Cell<bool>>,
    kill: Mutex<Cell<bool>>,
}

impl ReplyDelayTimer {
    pub const fn new() -> Self {
        ReplyDelayTimer {
            scalar_ms: 0,
            active: Mutex::new(Cell::new(false)),
            kill: Mutex::new(Cell::new(false)),
        }
    }

    /// Worst-case milliseconds to transmit (or receive) a maximum-size frame
    /// at the radio's data rate, rounded up, plus the platform fudge factor.
    /// The extra factor of ten in the bit count lets us add five and divide
    /// by ten afterwards, rounding up to the next millisecond; for fast
    /// radios we would rather leave the receiver on slightly too long than
    /// shut it down before the reply lands.
    pub fn compute_scalar(data_rate_bps: u32) -> u16 {
        let bits = (PHY_PREAMBLE_SYNC_BYTES + MAX_FRAME_SIZE as u32) * 8 * 10_000;
        PLATFORM_FUDGE_FACTOR_MS + (((bits / data_rate_bps) + 5) / 10) as u16
    }

    pub fn set_scalar(&mut self, scalar_ms: u16) {
        self.scalar_ms = scalar_ms;
    }

    pub fn scalar_ms(&self) -> u16 {
        self.scalar_ms
    }

    /// Request an early end to an in-progress wait. Only takes effect while
    /// the delay loop is actually running; posted from the receive-complete
    /// path when the awaited reply has arrived.
    pub fn post_kill_sem(&self) {
        critical_section::with(|cs| {
            if self.active.borrow(cs).get() {
                self.kill.borrow(cs).set(true);
            }
        });
    }

    /// Wait for the precomputed reply delay, checking the kill flag between
    /// sleep chunks. Clears both flags on the way out regardless of how the
    /// wait ended.
    pub fn run<D: DelaySource>(&self, delay: &mut D) {
        critical_section::with(|cs| self.active.borrow(cs).set(true));

        let mut milliseconds = self.scalar_ms;
        'delay: while milliseconds > 0 {
            let chunks = REPLY_DELAY_QUANTUM_US / MAX_CRITICAL_DELAY_US + 1;
            for _ in 0..chunks {
                critical_section::with(|_| delay.delay_us(MAX_CRITICAL_DELAY_US));
                if critical_section::with(|cs| self.kill.borrow(cs).get()) {
                    break 'delay;
                }
            }
            milliseconds -= 1;
        }

        critical_section::with(|cs| {
            self.kill.borrow(cs).set(false);
            self.active.borrow(cs).set(false);
        });
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    const CHUNKS_PER_MS: u32 = REPLY_DELAY_QUANTUM_US / MAX_CRITICAL_DELAY_US + 1;

    struct CountingDelay {
        calls: u32,
    }

    impl DelaySource for CountingDelay {
        fn delay_us(&mut self, _us: u32) {
            self.calls += 1;
        }
    }

    /// Posts the kill semaphore from inside the delay callback after a set
    /// number of calls, standing in for a receive-complete callback firing
    /// mid-wait.
    struct KillingDelay<'a> {
        timer: &'a ReplyDelayTimer,
        calls: u32,
        post_at: u32,
    }

    impl DelaySource for KillingDelay<'_> {
        fn delay_us(&mut self, _us: u32) {
            self.calls += 1;
            if self.calls == self.post_at {
                self.timer.post_kill_sem();
            }
        }
    }

    #[test]
    fn scalar_rounds_up_and_includes_fudge_factor() {
        // (8 + 44) * 8 bits = 416 bits at 250 kbps is 1.664 ms on air,
        // rounded up to 2 ms, plus the 2 ms platform factor.
        assert_eq!(ReplyDelayTimer::compute_scalar(250_000), 4);
        // A much slower radio dominates the fudge factor.
        assert_eq!(ReplyDelayTimer::compute_scalar(2_000), PLATFORM_FUDGE_FACTOR_MS + 208);
    }

    #[test]
    fn full_wait_runs_every_quantum() {
        let mut timer = ReplyDelayTimer::new();
        timer.set_scalar(3);
        let mut delay = CountingDelay { calls: 0 };
        timer.run(&mut delay);
        assert_eq!(delay.calls, 3 * CHUNKS_PER_MS);
    }

    #[test]
    fn kill_posted_while_active_ends_the_wait_within_one_chunk() {
        let mut timer = ReplyDelayTimer::new();
        timer.set_scalar(1000);
        let mut delay = KillingDelay {
            timer: &timer,
            calls: 0,
            post_at: 5,
        };
        timer.run(&mut delay);
        // The wait must stop at the first kill check after the post, not run
        // out the remaining ~1000 ms.
        assert_eq!(delay.calls, 5);
    }

    #[test]
    fn kill_posted_while_inactive_does_not_shorten_the_next_wait() {
        let mut timer = ReplyDelayTimer::new();
        timer.set_scalar(2);
        timer.post_kill_sem();
        let mut delay = CountingDelay { calls: 0 };
        timer.run(&mut delay);
        assert_eq!(delay.calls, 2 * CHUNKS_PER_MS);
    }

    #[test]
    fn flags_are_clear_after_a_killed_wait() {
        let mut timer = ReplyDelayTimer::new();
        timer.set_scalar(1000);
        let mut delay = KillingDelay {
            timer: &timer,
            calls: 0,
            post_at: 1,
        };
        timer.run(&mut delay);

        // A second wait must run to completion: the kill flag was consumed.
        let mut counting = CountingDelay { calls: 0 };
        timer.set_scalar(1);
        timer.run(&mut counting);
        assert_eq!(counting.calls, CHUNKS_PER_MS);
    }
}
