//! # Radio Device Simulator - Software Radio for Tests
//!
//! An in-memory stand-in for a physical transceiver. It models exactly the
//! observable register-level behavior the link layer depends on:
//!
//! - a byte-oriented receive FIFO with frame boundaries, so the FIFOP
//!   (complete frame pending) and FIFO (any bytes present) lines behave like
//!   the real part, including the overflow signature of FIFOP high with
//!   FIFO low
//! - a transmit FIFO captured on every transmit strobe
//! - a scriptable clear-channel assessment: the channel can be made to look
//!   busy for the next N transmit attempts
//! - analog noise bits from a seeded `WyRand` stream for the init-time
//!   random seed
//!
//! Every register write and strobe is also counted, which is what the unit
//! tests assert against: flush strobes (two per flush), interrupt
//! enable/disable balance, CCA attempt counts, and the frequency and power
//! register values.

use rand_core::RngCore;
use rand_core::SeedableRng;
use rand_wyrand::WyRand;

use super::RadioRegisters;

/// Byte capacity of the simulated receive FIFO.
const RX_FIFO_CAPACITY: usize = 512;

/// Most complete frames the simulated FIFO tracks at once.
const MAX_PENDING_FRAMES: usize = 8;

/// Transmit FIFO capacity, matching the smallest supported part.
const TX_FIFO_CAPACITY: usize = 128;

/// Frequency register value for physical channel 11; consecutive channels
/// are 5 register steps apart.
const FREQ_CHANNEL_11_VALUE: u8 = 0x0B;
const FREQ_STEP_PER_CHANNEL: u8 = 5;

pub struct RadioDevice {
    powered: bool,
    receiver_on: bool,
    rx_interrupt_enabled: bool,

    freq_reg: u8,
    power_reg: u8,
    seed_reg: u16,
    rssi_raw_value: u8,
    part_number_value: u8,
    version_value: u8,

    filter_addr: [u8; 4],
    filter_enabled: bool,

    rx_fifo: [u8; RX_FIFO_CAPACITY],
    rx_head: usize,
    rx_tail: usize,
    frame_lens: [usize; MAX_PENDING_FRAMES],
    frame_count: usize,
    first_frame_read: usize,
    overflow: bool,

    tx_fifo: [u8; TX_FIFO_CAPACITY],
    tx_fifo_len: usize,
    last_tx: [u8; TX_FIFO_CAPACITY],
    last_tx_len: usize,
    tx_done_flag: bool,
    sampled_cca_flag: bool,
    busy_attempts_remaining: u8,

    noise: WyRand,
    noise_stuck_low: bool,

    transmit_count: u32,
    cca_attempt_count: u32,
    rx_flush_strobes: u32,
    tx_flush_count: u32,
    rx_interrupt_enables: u32,
    rx_interrupt_disables: u32,
    frame_flag_clears: u32,
    all_flag_clears: u32,
}

impl RadioDevice {
    pub fn new(noise_seed: u64) -> Self {
        RadioDevice {
            powered: false,
            receiver_on: false,
            rx_interrupt_enabled: false,
            freq_reg: 0,
            power_reg: 0,
            seed_reg: 0,
            rssi_raw_value: 0,
            part_number_value: Self::PART_NUMBER,
            version_value: Self::MIN_VERSION,
            filter_addr: [0; 4],
            filter_enabled: false,
            rx_fifo: [0; RX_FIFO_CAPACITY],
            rx_head: 0,
            rx_tail: 0,
            frame_lens: [0; MAX_PENDING_FRAMES],
            frame_count: 0,
            first_frame_read: 0,
            overflow: false,
            tx_fifo: [0; TX_FIFO_CAPACITY],
            tx_fifo_len: 0,
            last_tx: [0; TX_FIFO_CAPACITY],
            last_tx_len: 0,
            tx_done_flag: false,
            sampled_cca_flag: false,
            busy_attempts_remaining: 0,
            noise: WyRand::seed_from_u64(noise_seed),
            noise_stuck_low: false,
            transmit_count: 0,
            cca_attempt_count: 0,
            rx_flush_strobes: 0,
            tx_flush_count: 0,
            rx_interrupt_enables: 0,
            rx_interrupt_disables: 0,
            frame_flag_clears: 0,
            all_flag_clears: 0,
        }
    }

    /// Queue raw over-the-air bytes as one received frame. The first byte is
    /// the hardware length field and must match `bytes.len() - 1`, exactly
    /// as the real FIFO would deliver it.
    pub fn inject_raw(&mut self, bytes: &[u8]) {
        assert!(self.frame_count < MAX_PENDING_FRAMES, "too many pending frames in simulator");
        for &byte in bytes {
            let next_tail = (self.rx_tail + 1) % RX_FIFO_CAPACITY;
            assert!(next_tail != self.rx_head, "simulated receive FIFO overrun");
            self.rx_fifo[self.rx_tail] = byte;
            self.rx_tail = next_tail;
        }
        self.frame_lens[self.frame_count] = bytes.len();
        self.frame_count += 1;
    }

    /// Make the channel look busy for the next `attempts` transmit-on-CCA
    /// strobes.
    pub fn set_channel_busy_for(&mut self, attempts: u8) {
        self.busy_attempts_remaining = attempts;
    }

    /// Put the FIFO into the overflow signature: frame pending asserted with
    /// no readable data. Cleared only by a receive FIFO flush.
    pub fn force_overflow(&mut self) {
        self.overflow = true;
    }

    pub fn set_rssi_raw(&mut self, raw: u8) {
        self.rssi_raw_value = raw;
    }

    /// Report a different part number, for exercising the init identity
    /// check.
    pub fn set_part_number(&mut self, part: u8) {
        self.part_number_value = part;
    }

    /// Force every noise bit to zero, for exercising the non-zero seed
    /// guarantee.
    pub fn set_noise_stuck_low(&mut self, stuck: bool) {
        self.noise_stuck_low = stuck;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn is_receiver_on(&self) -> bool {
        self.receiver_on
    }

    pub fn is_rx_interrupt_enabled(&self) -> bool {
        self.rx_interrupt_enabled
    }

    pub fn frequency_register(&self) -> u8 {
        self.freq_reg
    }

    pub fn power_register(&self) -> u8 {
        self.power_reg
    }

    pub fn seed_register(&self) -> u16 {
        self.seed_reg
    }

    pub fn address_filter(&self) -> [u8; 4] {
        self.filter_addr
    }

    pub fn is_address_filter_enabled(&self) -> bool {
        self.filter_enabled
    }

    /// The frame captured by the most recent transmit strobe, as written to
    /// the hardware: length byte first.
    pub fn last_transmitted(&self) -> &[u8] {
        &self.last_tx[..self.last_tx_len]
    }

    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }

    pub fn cca_attempt_count(&self) -> u32 {
        self.cca_attempt_count
    }

    pub fn rx_flush_strobe_count(&self) -> u32 {
        self.rx_flush_strobes
    }

    pub fn tx_flush_count(&self) -> u32 {
        self.tx_flush_count
    }

    pub fn rx_interrupt_enable_count(&self) -> u32 {
        self.rx_interrupt_enables
    }

    pub fn rx_interrupt_disable_count(&self) -> u32 {
        self.rx_interrupt_disables
    }

    pub fn all_flag_clear_count(&self) -> u32 {
        self.all_flag_clears
    }

    fn rx_fifo_is_empty(&self) -> bool {
        self.rx_head == self.rx_tail
    }

    fn capture_transmission(&mut self) {
        self.last_tx = self.tx_fifo;
        self.last_tx_len = self.tx_fifo_len;
        self.transmit_count += 1;
        self.tx_done_flag = true;
    }
}

impl RadioRegisters for RadioDevice {
    const PART_NUMBER: u8 = 0x84;
    const MIN_VERSION: u8 = 0x00;
    const RSSI_OFFSET_DB: i16 = 76;
    const RSSI_VALID_DELAY_US: u32 = 320;
    const DATA_RATE_BPS: u32 = 250_000;

    fn power_on(&mut self) {
        // The simulated part is ready the moment power is applied; there is
        // no oscillator to wait for.
        self.powered = true;
    }

    fn power_off(&mut self) {
        self.powered = false;
        self.receiver_on = false;
        // Configuration registers do not survive the power-down; whoever
        // wakes the chip has to restore them.
        self.freq_reg = 0;
        self.power_reg = 0;
        self.filter_addr = [0; 4];
        self.filter_enabled = false;
    }

    fn part_number(&mut self) -> u8 {
        self.part_number_value
    }

    fn version(&mut self) -> u8 {
        self.version_value
    }

    fn set_channel(&mut self, phy_channel: u8) {
        self.freq_reg = FREQ_CHANNEL_11_VALUE + FREQ_STEP_PER_CHANNEL * (phy_channel - 11);
    }

    fn set_tx_power(&mut self, register_value: u8) {
        self.power_reg = register_value;
    }

    fn strobe_rx_on(&mut self) {
        self.receiver_on = true;
    }

    fn strobe_rf_off(&mut self) {
        self.receiver_on = false;
    }

    fn flush_rx_fifo(&mut self) {
        // Two strobes per flush; counting them separately lets tests verify
        // the double-flush requirement is honored.
        self.rx_flush_strobes += 2;
        self.rx_head = 0;
        self.rx_tail = 0;
        self.frame_count = 0;
        self.first_frame_read = 0;
        self.overflow = false;
    }

    fn flush_tx_fifo(&mut self) {
        self.tx_flush_count += 1;
        self.tx_fifo_len = 0;
    }

    fn write_tx_fifo(&mut self, bytes: &[u8]) {
        assert!(self.tx_fifo_len + bytes.len() <= TX_FIFO_CAPACITY, "simulated transmit FIFO overrun");
        self.tx_fifo[self.tx_fifo_len..self.tx_fifo_len + bytes.len()].copy_from_slice(bytes);
        self.tx_fifo_len += bytes.len();
    }

    fn strobe_tx(&mut self) {
        self.capture_transmission();
    }

    fn strobe_tx_on_cca(&mut self) {
        self.cca_attempt_count += 1;
        if self.busy_attempts_remaining > 0 {
            self.busy_attempts_remaining -= 1;
            self.sampled_cca_flag = false;
        } else {
            self.sampled_cca_flag = true;
            self.capture_transmission();
        }
    }

    fn sampled_cca(&mut self) -> bool {
        self.sampled_cca_flag
    }

    fn tx_done(&mut self) -> bool {
        self.tx_done_flag
    }

    fn clear_tx_done(&mut self) {
        self.tx_done_flag = false;
    }

    fn rssi_valid(&mut self) -> bool {
        self.receiver_on
    }

    fn rssi_raw(&mut self) -> u8 {
        self.rssi_raw_value
    }

    fn random_noise_bit(&mut self) -> u8 {
        if self.noise_stuck_low {
            0
        } else {
            (self.noise.next_u32() & 0x01) as u8
        }
    }

    fn seed_random(&mut self, seed: u16) {
        // Models the two-write load: the low byte lands first, the second
        // write shifts it into the companion register.
        self.seed_reg = seed;
    }

    fn frame_pending(&mut self) -> bool {
        self.overflow || self.frame_count > 0
    }

    fn fifo_has_data(&mut self) -> bool {
        !self.overflow && !self.rx_fifo_is_empty()
    }

    fn read_rx_fifo_byte(&mut self) -> u8 {
        if self.rx_fifo_is_empty() {
            return 0;
        }
        let byte = self.rx_fifo[self.rx_head];
        self.rx_head = (self.rx_head + 1) % RX_FIFO_CAPACITY;
        if self.frame_count > 0 {
            self.first_frame_read += 1;
            if self.first_frame_read == self.frame_lens[0] {
                // Finished draining the first frame; shift the rest down.
                for i in 1..self.frame_count {
                    self.frame_lens[i - 1] = self.frame_lens[i];
                }
                self.frame_count -= 1;
                self.first_frame_read = 0;
            }
        }
        byte
    }

    fn clear_frame_pending_flag(&mut self) {
        self.frame_flag_clears += 1;
    }

    fn clear_all_radio_flags(&mut self) {
        self.all_flag_clears += 1;
    }

    fn enable_rx_interrupt(&mut self) {
        self.rx_interrupt_enabled = true;
        self.rx_interrupt_enables += 1;
    }

    fn disable_rx_interrupt(&mut self) {
        self.rx_interrupt_enabled = false;
        self.rx_interrupt_disables += 1;
    }

    fn set_address_filter(&mut self, addr: [u8; 4]) {
        self.filter_addr = addr;
    }

    fn set_address_filter_enabled(&mut self, enabled: bool) {
        self.filter_enabled = enabled;
    }
}
