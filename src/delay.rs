use embassy_time::Duration;

/// Longest stretch we allow interrupts to stay masked inside the delay
/// helpers. Longer requested delays are broken into chunks of this size, each
/// executed in its own critical section, so a long delay never holds
/// interrupts off for an unbounded time.
pub(crate) const MAX_CRITICAL_DELAY_US: u32 = 16;

/// Platform time source for the busy-wait delays in the link layer.
///
/// Implementations must be callable from inside a critical section for
/// delays up to [`MAX_CRITICAL_DELAY_US`]; the link layer never asks for more
/// than that in one call.
pub trait DelaySource {
    fn delay_us(&mut self, us: u32);
}

/// Delay source backed by the embassy time driver.
pub struct EmbassyDelay;

impl DelaySource for EmbassyDelay {
    fn delay_us(&mut self, us: u32) {
        embassy_time::block_for(Duration::from_micros(us as u64));
    }
}

/// Delay for approximately `us` microseconds, chunked so interrupts are only
/// masked for [`MAX_CRITICAL_DELAY_US`] at a time. The chunking overhead
/// makes the delay err on the side of being too long, never too short.
pub(crate) fn delay_us_chunked<D: DelaySource>(delay: &mut D, us: u32) {
    if us == 0 {
        return;
    }
    let chunks = us / MAX_CRITICAL_DELAY_US + 1;
    for _ in 0..chunks {
        critical_section::with(|_| delay.delay_us(MAX_CRITICAL_DELAY_US));
    }
}
