//! # Radio Link State Machine
//!
//! Owns the logical radio state and sequences every register-level operation
//! on a [`RadioRegisters`] implementation: bring-up, clear-channel-assessed
//! transmit with randomized backoff, the receive FIFO drain routine, channel
//! and power management, and the reply-delay wait.
//!
//! ## States
//!
//! `Off -> Idle -> Rx`, with the reverse transitions `Rx -> Idle` and
//! `Idle -> Off`. `Off` is the only state in which the receive interrupt is
//! guaranteed disabled. The state variable is mutated exclusively on the
//! mainline; the receive service routine only reads it for a sanity check.
//!
//! ## Concurrency contract
//!
//! There are no threads here, only the mainline and the receive interrupt.
//! The transmit and channel/power paths keep the receive interrupt disabled
//! while they own the radio. The one sequence that must not be split by any
//! interrupt, strobing transmit-on-CCA and then sampling whether the
//! transmission started, runs inside a critical section. The staged incoming
//! packet is a
//! single-slot mailbox: the receive service routine is its only writer and
//! [`RadioLink::receive`] its only reader. A second frame arriving before
//! the callback has copied the first one out overwrites it, so the
//! receive-complete callback must drain the slot synchronously (the frame
//! queue hand-off in [`RadioLink::run`] does exactly that).

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};
use log::{log, Level};

use crate::delay::{delay_us_chunked, DelaySource};
use crate::frame::{
    RadioPacket, DSN_OFS, FCF_BYTE_0, FCF_BYTE_1, FCF_OFS, LENGTH_FIELD_OFS, RX_METRICS_CRC_LQI_OFS, RX_METRICS_CRC_OK_MASK, RX_METRICS_LQI_MASK,
    RX_METRICS_RSSI_OFS,
};
use crate::frame_queue::FrameQueueManager;
use crate::radio_devices::{RadioRegisters, LOGICAL_CHANNEL_TABLE, NUM_LOGICAL_CHANNELS, NUM_POWER_SETTINGS, RF_POWER_TABLE};
use crate::reply_delay::ReplyDelayTimer;
use crate::{MAX_FRAME_SIZE, MIN_FRAME_SIZE, RX_METRICS_SIZE};

/// High bit of the hardware length field is reserved by the PHY framing.
const PHY_PACKET_SIZE_MASK: u8 = 0x7F;

/// One backoff period. Contended transmits wait a random 1 to 16 of these.
const BACKOFF_PERIOD_US: u32 = 250;

/// Poll step while waiting for the RSSI reading to become valid.
const RSSI_POLL_STEP_US: u32 = 64;

const MILLISECOND_US: u32 = 1000;

/// Linear congruential generator parameters for [`RadioLink::random_byte`].
const RANDOM_MULTIPLIER: u8 = 109;
const RANDOM_OFFSET: u8 = 67;

/// How often the service loop polls for pending receive frames when it is
/// bridging the receive interrupt instead of being driven by one.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Logical state of the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Off,
    Idle,
    Rx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitMode {
    /// Transmit unconditionally, without checking the channel.
    Forced,
    /// Transmit only on a clear channel, retrying with randomized backoff.
    Cca,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Every clear-channel attempt found the channel busy. The only failure
    /// this layer reports; callers are expected to handle it routinely.
    CcaFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// The requested filter address uses a reserved PAN ID or short address.
    ReservedAddress,
}

/// Link bring-up parameters.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub logical_channel: u8,
    pub power_index: u8,
    /// Retries after the first clear-channel attempt, so a CCA transmit
    /// makes at most `cca_retries + 1` attempts.
    pub cca_retries: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            logical_channel: 0,
            power_index: (NUM_POWER_SETTINGS - 1) as u8,
            cca_retries: 4,
        }
    }
}

/// The radio link layer. One instance per physical radio.
pub struct RadioLink<R: RadioRegisters, D: DelaySource> {
    radio: R,
    delay: D,
    config: LinkConfig,
    state: RadioState,
    incoming: RadioPacket,
    dsn: u8,
    rnd_state: u8,
    current_channel: u8,
    current_power: u8,
    filter_addr: [u8; 4],
    filter_set: bool,
    filter_enabled: bool,
    reply_delay: ReplyDelayTimer,
}

impl<R: RadioRegisters, D: DelaySource> RadioLink<R, D> {
    pub fn new(radio: R, delay: D, config: LinkConfig) -> Self {
        RadioLink {
            radio,
            delay,
            config,
            state: RadioState::Off,
            incoming: RadioPacket::new(),
            dsn: 0,
            rnd_state: 0,
            current_channel: config.logical_channel,
            current_power: config.power_index,
            filter_addr: [0; 4],
            filter_set: false,
            filter_enabled: false,
            reply_delay: ReplyDelayTimer::new(),
        }
    }

    /// Bring the radio up once, seed the random generator from analog noise,
    /// configure the default channel and power, and leave the radio powered
    /// off. Panics if the wrong or an obsolete radio part is installed.
    pub fn init(&mut self) {
        self.incoming = RadioPacket::new();

        self.radio.power_on();

        assert!(self.radio.part_number() == R::PART_NUMBER, "unexpected radio part number");
        assert!(self.radio.version() >= R::MIN_VERSION, "obsolete radio silicon revision");

        // Receiver on just long enough to harvest noise for the seed; the
        // RSSI has to settle before its low bit is worth anything.
        self.radio.strobe_rx_on();
        self.rssi_valid_wait();

        let mut seed: u16 = 0;
        for _ in 0..16 {
            seed = (seed << 1) | (self.radio.random_noise_bit() & 0x01) as u16;
        }
        // A zero seed would pin the pseudo random sequence at zero forever.
        seed |= 0x0080;
        self.radio.seed_random(seed);
        self.rnd_state = (seed & 0x00FF) as u8;

        self.rx_mode_off();
        self.radio.power_off();
        self.state = RadioState::Off;

        self.reply_delay.set_scalar(ReplyDelayTimer::compute_scalar(R::DATA_RATE_BPS));

        self.apply_logical_channel(self.config.logical_channel);
        self.apply_power(self.config.power_index);

        // Devices sharing a power source come up together; without this they
        // would collide on their first transmissions in lockstep.
        self.random_backoff_delay();

        log!(Level::Info, "radio link initialized, reply delay {} ms", self.reply_delay.scalar_ms());
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    /// Transmit a frame. Stamps the sequence number and frame control field,
    /// then either forces the transmission out or gates it on clear-channel
    /// assessment with bounded, randomly backed-off retries.
    ///
    /// The receiver is off for the duration; if the link was in receive
    /// state it is restored before returning.
    pub fn transmit(&mut self, packet: &mut RadioPacket, mode: TransmitMode) -> Result<(), TxError> {
        assert!(self.state != RadioState::Off, "radio must be awake to transmit");
        assert!(!self.radio.tx_done(), "transmit-done flag set before transmit");

        // Incoming frames are ignored and dropped while we transmit.
        self.rx_mode_off();
        self.radio.clear_tx_done();

        packet.frame[DSN_OFS] = self.dsn;
        self.dsn = self.dsn.wrapping_add(1);
        packet.frame[FCF_OFS] = FCF_BYTE_0;
        packet.frame[FCF_OFS + 1] = FCF_BYTE_1;

        // Clear out anything a previous aborted transmit left behind.
        self.radio.flush_tx_fifo();

        let frame_len = packet.frame[LENGTH_FIELD_OFS] as usize;
        // The radio appends the receive metrics itself; the length byte on
        // the air must account for them.
        let air_len = (frame_len + RX_METRICS_SIZE) as u8;
        self.radio.write_tx_fifo(&[air_len]);
        self.radio.write_tx_fifo(&packet.frame[1..=frame_len]);

        let mut result = Ok(());
        match mode {
            TransmitMode::Forced => {
                self.radio.strobe_tx();
                while !self.radio.tx_done() {}
                self.radio.clear_tx_done();
            }
            TransmitMode::Cca => {
                let mut cca_retries = self.config.cca_retries;
                loop {
                    // Receiver on for the assessment, deliberately not via
                    // rx_mode_on: the receive interrupt must stay masked.
                    self.radio.strobe_rx_on();
                    self.rssi_valid_wait();

                    // The strobe and the did-it-start sample must not be
                    // separated by an interrupt.
                    let tx_started = critical_section::with(|_| {
                        self.radio.strobe_tx_on_cca();
                        self.radio.sampled_cca()
                    });

                    if tx_started {
                        while !self.radio.tx_done() {}
                        self.radio.clear_tx_done();
                        break;
                    }

                    if cca_retries == 0 {
                        result = Err(TxError::CcaFailed);
                        break;
                    }

                    // Receiver off to conserve power during the backoff.
                    self.rx_mode_off();
                    self.random_backoff_delay();
                    cca_retries -= 1;
                }
            }
        }

        // Put the radio in a known state, then restore receive if that is
        // where we started.
        self.rx_mode_off();
        if self.state == RadioState::Rx {
            self.rx_mode_on();
        }

        result
    }

    /// Copy the staged incoming packet out. Call once per receive-complete
    /// signal, promptly: the next validated frame overwrites the slot.
    pub fn receive(&self, dest: &mut RadioPacket) {
        *dest = self.incoming;
    }

    /// Turn the receiver on. No harm if it already is.
    pub fn rx_on(&mut self) {
        assert!(self.state != RadioState::Off, "radio must be awake to enter receive state");
        if self.state != RadioState::Rx {
            self.state = RadioState::Rx;
            self.rx_mode_on();
        }
    }

    /// Put the radio in idle (receiver off). No harm if it already is.
    pub fn rx_idle(&mut self) {
        assert!(self.state != RadioState::Off, "radio must be awake to leave receive state");
        if self.state == RadioState::Rx {
            self.rx_mode_off();
            self.state = RadioState::Idle;
        }
    }

    /// Power the radio up from off and restore every setting the power-down
    /// lost: channel, power level and the address filter.
    pub fn wake_up(&mut self) {
        if self.state != RadioState::Off {
            return;
        }
        self.state = RadioState::Idle;
        self.radio.power_on();

        if self.filter_set {
            self.radio.set_address_filter(self.filter_addr);
        }
        self.radio.set_address_filter_enabled(self.filter_enabled);
        self.radio.set_tx_power(RF_POWER_TABLE[self.current_power as usize]);
        self.apply_logical_channel(self.current_channel);
    }

    /// Power the radio down. Goes through idle first so the receiver is off
    /// before the power is.
    pub fn sleep(&mut self) {
        if self.state == RadioState::Off {
            return;
        }
        self.rx_idle();
        self.radio.power_off();
        self.state = RadioState::Off;
    }

    /// Select a logical channel. The receiver is taken off the air for the
    /// register write and restored afterwards if it was on.
    pub fn set_logical_channel(&mut self, channel: u8) {
        assert!(self.state != RadioState::Off, "radio must be awake to change channels");
        self.apply_logical_channel(channel);
    }

    /// Select an output power level from the power table.
    pub fn set_power(&mut self, index: u8) {
        assert!(self.state != RadioState::Off, "radio must be awake to change power");
        self.apply_power(index);
    }

    /// Live RSSI reading in dBm. Only meaningful in receive state.
    pub fn rssi(&mut self) -> i8 {
        assert!(self.state == RadioState::Rx, "RSSI reading requires receive state");

        // Receiver on is not enough; it has to have been in receive mode
        // long enough for the measurement to settle.
        self.rssi_valid_wait();
        let raw = self.radio.rssi_raw();
        calculate_rssi::<R>(raw)
    }

    /// Next byte of the pseudo random sequence seeded at init. Repeats every
    /// 256 values.
    pub fn random_byte(&mut self) -> u8 {
        self.rnd_state = self.rnd_state.wrapping_mul(RANDOM_MULTIPLIER).wrapping_add(RANDOM_OFFSET);
        self.rnd_state
    }

    /// Set the receive address filter. Reserved addresses are rejected: PAN
    /// IDs `0xFFFF` and `0xFFFE`, and the short address `0xFFFF`, can never
    /// be a node's own address.
    pub fn set_rx_address_filter(&mut self, addr: [u8; 4]) -> Result<(), FilterError> {
        let pan_id = u16::from_le_bytes([addr[0], addr[1]]);
        let short_addr = u16::from_le_bytes([addr[2], addr[3]]);
        let pan_id_reserved = pan_id == 0xFFFF || pan_id == 0xFFFE;
        let short_addr_reserved = short_addr == 0xFFFF;
        if pan_id_reserved || short_addr_reserved {
            return Err(FilterError::ReservedAddress);
        }

        // The hardware registers are only reachable with power applied; the
        // shadow copy is re-applied on wake-up either way.
        if self.state != RadioState::Off {
            self.radio.set_address_filter(addr);
        }
        self.filter_addr = addr;
        self.filter_set = true;
        Ok(())
    }

    pub fn enable_rx_address_filter(&mut self) {
        assert!(self.filter_set, "address filter enabled before an address was set");
        self.filter_enabled = true;
        if self.state != RadioState::Off {
            self.radio.set_address_filter_enabled(true);
        }
    }

    pub fn disable_rx_address_filter(&mut self) {
        self.filter_enabled = false;
        if self.state != RadioState::Off {
            self.radio.set_address_filter_enabled(false);
        }
    }

    /// Delay the given number of milliseconds, never holding interrupts
    /// masked for more than one chunk at a time.
    pub fn delay_ms(&mut self, milliseconds: u16) {
        for _ in 0..milliseconds {
            delay_us_chunked(&mut self.delay, MILLISECOND_US);
        }
    }

    /// Wait long enough for a reply to the frame just sent, or until
    /// [`RadioLink::post_kill_sem`] cancels the wait early.
    pub fn reply_delay(&mut self) {
        let RadioLink { reply_delay, delay, .. } = self;
        reply_delay.run(delay);
    }

    /// Cancel an in-progress reply delay. Callable from the receive-complete
    /// callback; a post while no delay is running has no effect.
    pub fn post_kill_sem(&self) {
        self.reply_delay.post_kill_sem();
    }

    /// A complete frame is waiting to be serviced.
    pub fn frame_pending(&mut self) -> bool {
        self.radio.frame_pending()
    }

    /// Drain every complete frame out of the receive FIFO. Runs in interrupt
    /// context on real hardware (wired to the frame-pending interrupt) and
    /// from the polling service loop otherwise.
    ///
    /// `on_receive_complete` fires once per frame that passes the length
    /// bounds, the hardware CRC and the frame control field check, after the
    /// frame has been staged in the incoming packet slot. It runs with
    /// interrupts effectively owned by this routine and must only copy the
    /// staged packet somewhere and return.
    pub fn service_rx<F: FnMut(&RadioPacket)>(&mut self, mut on_receive_complete: F) {
        // The frame-pending line can glitch low for two fast clock cycles;
        // a reading that does not stay high is a false alarm.
        if !self.radio.frame_pending() {
            return;
        }
        if !self.radio.frame_pending() {
            return;
        }

        // CCA turns the receiver on with the interrupt masked, so a frame
        // service outside receive state is a state logic error.
        assert!(self.state == RadioState::Rx, "receive service outside receive state");

        loop {
            // The FIFO may hold the first bytes of a frame still on the air.
            while !self.radio.frame_pending() {}

            // Frame pending with an empty FIFO is the overflow signature.
            // Recovery may cost a valid frame; accepted.
            if self.radio.frame_pending() && !self.radio.fifo_has_data() {
                self.radio.flush_rx_fifo();
                break;
            }

            let air_len = (self.radio.read_rx_fifo_byte() & PHY_PACKET_SIZE_MASK) as usize;

            if air_len < MIN_FRAME_SIZE || air_len + 1 - RX_METRICS_SIZE > MAX_FRAME_SIZE {
                // Cannot possibly be a valid frame; drain it from the FIFO
                // without storing a byte of it.
                for _ in 0..air_len {
                    let _ = self.radio.read_rx_fifo_byte();
                }
            } else {
                // Stale bytes must not survive under a shorter frame.
                self.incoming = RadioPacket::new();

                let stored_len = air_len - RX_METRICS_SIZE;
                self.incoming.frame[LENGTH_FIELD_OFS] = stored_len as u8;
                for i in 0..stored_len {
                    self.incoming.frame[1 + i] = self.radio.read_rx_fifo_byte();
                }

                let rssi_raw = self.radio.read_rx_fifo_byte();
                self.incoming.rx_metrics[RX_METRICS_RSSI_OFS] = calculate_rssi::<R>(rssi_raw) as u8;

                // Second metrics byte: CRC pass bit plus 7 bits of
                // correlation. Only the correlation is stored.
                let crc_corr = self.radio.read_rx_fifo_byte();
                self.incoming.rx_metrics[RX_METRICS_CRC_LQI_OFS] = crc_corr & RX_METRICS_LQI_MASK;

                // A frame of plausible size can still be corrupted junk that
                // squeaked past the CRC; the frame control field is the
                // second gate.
                if crc_corr & RX_METRICS_CRC_OK_MASK != 0
                    && self.incoming.frame[FCF_OFS] == FCF_BYTE_0
                    && self.incoming.frame[FCF_OFS + 1] == FCF_BYTE_1
                {
                    on_receive_complete(&self.incoming);
                }
            }

            // Cleared only now that the frame is fully drained; clearing
            // earlier can lose the pending indication of a frame arriving
            // right behind this one.
            self.radio.clear_frame_pending_flag();

            if !self.radio.fifo_has_data() {
                break;
            }
        }

        // Slow frame processing can overflow the FIFO while we are in here,
        // which stalls the radio until flushed. Never exit leaving that
        // condition behind.
        if self.radio.frame_pending() && !self.radio.fifo_has_data() {
            self.radio.flush_rx_fifo();
        }

        // Silicon erratum: individual flag clears can be lost; always finish
        // with the clear-everything write.
        self.radio.clear_all_radio_flags();
    }

    /// Service loop bridging the link to bounded frame channels: outbound
    /// frames come in on `tx_receiver` and go to the air with CCA, validated
    /// inbound frames are handed off through the frame queues to
    /// `rx_sender`. Platforms whose receive interrupt can call
    /// [`RadioLink::service_rx`] directly get lower latency; this loop polls
    /// instead so it works everywhere.
    pub async fn run(mut self, tx_receiver: crate::TxFrameQueueReceiver, rx_sender: crate::RxFrameQueueSender) -> ! {
        self.init();
        self.wake_up();
        self.rx_on();
        log!(Level::Info, "radio link service started");

        let mut queues = FrameQueueManager::new();
        loop {
            match select(tx_receiver.receive(), Timer::after(RX_POLL_INTERVAL)).await {
                Either::First(packet) => {
                    if queues.enqueue_outbound(packet).is_err() {
                        log!(Level::Warn, "outbound frame queue full, dropping frame");
                    }
                    while let Ok(mut packet) = queues.dequeue_outbound() {
                        if self.transmit(&mut packet, TransmitMode::Cca).is_err() {
                            log!(Level::Warn, "clear channel assessment failed, dropping frame");
                        }
                    }
                }
                Either::Second(_) => {
                    let queues = &mut queues;
                    self.service_rx(|packet| {
                        if queues.enqueue_inbound(*packet).is_err() {
                            log::warn!("inbound frame queue full, dropping received frame");
                        }
                    });
                    while let Ok(packet) = queues.dequeue_inbound() {
                        if rx_sender.try_send(packet).is_err() {
                            log::warn!("inbound frame channel full, dropping received frame");
                        }
                    }
                }
            }
        }
    }

    fn apply_logical_channel(&mut self, channel: u8) {
        assert!((channel as usize) < NUM_LOGICAL_CHANNELS, "logical channel out of range");

        // The frequency registers must not change under an active receiver.
        self.rx_mode_off();
        self.radio.set_channel(LOGICAL_CHANNEL_TABLE[channel as usize]);

        // Needed again on wake-up.
        self.current_channel = channel;

        if self.state == RadioState::Rx {
            self.rx_mode_on();
        }
    }

    fn apply_power(&mut self, index: u8) {
        assert!((index as usize) < NUM_POWER_SETTINGS, "power index out of range");

        self.rx_mode_off();
        self.radio.set_tx_power(RF_POWER_TABLE[index as usize]);
        self.current_power = index;

        if self.state == RadioState::Rx {
            self.rx_mode_on();
        }
    }

    fn rx_mode_on(&mut self) {
        // A residual flag from before the receiver was off would fire the
        // interrupt immediately.
        self.radio.clear_frame_pending_flag();
        self.radio.strobe_rx_on();
        self.radio.enable_rx_interrupt();
    }

    fn rx_mode_off(&mut self) {
        self.radio.disable_rx_interrupt();
        self.radio.strobe_rf_off();

        // Residual bytes of a half-received frame would corrupt the next
        // receive.
        self.radio.flush_rx_fifo();
        self.radio.clear_frame_pending_flag();
    }

    fn rssi_valid_wait(&mut self) {
        let mut remaining = R::RSSI_VALID_DELAY_US as i32;
        while !self.radio.rssi_valid() {
            delay_us_chunked(&mut self.delay, RSSI_POLL_STEP_US);
            remaining -= RSSI_POLL_STEP_US as i32;
            if remaining <= 0 {
                break;
            }
        }
    }

    fn random_backoff_delay(&mut self) {
        // 1 to 16 backoff periods.
        let backoffs = (self.random_byte() & 0x0F) + 1;
        for _ in 0..backoffs {
            delay_us_chunked(&mut self.delay, BACKOFF_PERIOD_US);
        }
    }
}

/// Two's-complement raw RSSI to dBm with offset compensation, clamped to the
/// lowest value an `i8` can hold.
fn calculate_rssi<R: RadioRegisters>(raw: u8) -> i8 {
    let mut rssi = if raw >= 128 { raw as i16 - 256 } else { raw as i16 };
    rssi -= R::RSSI_OFFSET_DB;
    if rssi < -128 {
        rssi = -128;
    }
    rssi as i8
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::delay::MAX_CRITICAL_DELAY_US;
    use crate::frame::PAYLOAD_OFS;
    use crate::radio_devices::simulator::RadioDevice;
    use crate::RADIO_HEADER_SIZE;

    #[derive(Default)]
    struct TestDelay {
        calls: u32,
    }

    impl DelaySource for TestDelay {
        fn delay_us(&mut self, _us: u32) {
            self.calls += 1;
        }
    }

    /// Chunked-delay calls per backoff period.
    const CALLS_PER_BACKOFF_PERIOD: u32 = 250 / MAX_CRITICAL_DELAY_US + 1;

    fn test_link() -> RadioLink<RadioDevice, TestDelay> {
        let mut radio = RadioDevice::new(0xBEEF);
        // Deterministic seed: all noise bits low forces the seed to the
        // non-zero guarantee bit, making the LCG sequence predictable.
        radio.set_noise_stuck_low(true);
        RadioLink::new(radio, TestDelay::default(), LinkConfig::default())
    }

    fn inited_link() -> RadioLink<RadioDevice, TestDelay> {
        let mut link = test_link();
        link.init();
        link
    }

    fn awake_link() -> RadioLink<RadioDevice, TestDelay> {
        let mut link = inited_link();
        link.wake_up();
        link
    }

    fn lcg_next(state: &mut u8) -> u8 {
        *state = state.wrapping_mul(RANDOM_MULTIPLIER).wrapping_add(RANDOM_OFFSET);
        *state
    }

    /// Over-the-air bytes of a well-formed data frame, length byte first,
    /// metrics last, ready for the simulator FIFO.
    fn air_frame(payload: &[u8], rssi_raw: u8, crc_corr: u8) -> Vec<u8> {
        let stored_len = RADIO_HEADER_SIZE + payload.len();
        let mut bytes = vec![(stored_len + RX_METRICS_SIZE) as u8, FCF_BYTE_0, FCF_BYTE_1, 0x07];
        bytes.extend_from_slice(&[0x10, 0x20, 0x30, 0x40]); // destination
        bytes.extend_from_slice(&[0x50, 0x60, 0x70, 0x80]); // source
        bytes.extend_from_slice(payload);
        bytes.push(rssi_raw);
        bytes.push(crc_corr);
        bytes
    }

    fn outgoing_packet(payload: &[u8]) -> RadioPacket {
        RadioPacket::new_data([0x10, 0x20, 0x30, 0x40], [0x50, 0x60, 0x70, 0x80], payload)
    }

    #[test]
    fn init_ends_powered_off_with_defaults_applied() {
        let mut link = test_link();
        link.init();

        assert_eq!(link.state(), RadioState::Off);
        assert!(!link.radio.is_powered());
        // Channel 0 maps to physical channel 15; power defaults to the top
        // table entry.
        assert_eq!(link.radio.frequency_register(), 0x0B + 5 * (15 - 11));
        assert_eq!(link.radio.power_register(), RF_POWER_TABLE[NUM_POWER_SETTINGS - 1]);
        // The startup backoff must actually have burned time.
        assert!(link.delay.calls > 0);
        assert_eq!(link.reply_delay.scalar_ms(), 4);
    }

    #[test]
    fn seed_is_never_zero_even_with_dead_noise_source() {
        let mut link = test_link();
        link.init();
        assert_eq!(link.radio.seed_register(), 0x0080);
        assert_ne!(link.radio.seed_register(), 0);
    }

    #[test]
    fn random_byte_follows_the_seeded_sequence() {
        let mut link = inited_link();
        // Init consumed one random byte for the startup backoff.
        let mut expected = 0x80u8;
        lcg_next(&mut expected);
        assert_eq!(link.random_byte(), lcg_next(&mut expected));
        assert_eq!(link.random_byte(), lcg_next(&mut expected));
    }

    #[test]
    #[should_panic(expected = "unexpected radio part number")]
    fn init_panics_on_wrong_part_number() {
        let mut link = test_link();
        link.radio.set_part_number(0x12);
        link.init();
    }

    #[test]
    #[should_panic(expected = "radio must be awake to transmit")]
    fn transmit_while_off_panics() {
        let mut link = inited_link();
        let mut packet = outgoing_packet(&[1, 2, 3]);
        let _ = link.transmit(&mut packet, TransmitMode::Forced);
    }

    #[test]
    fn forced_transmit_writes_air_length_and_stamps_header() {
        let mut link = awake_link();
        let payload = [0xAB, 0xCD, 0xEF];
        let mut packet = outgoing_packet(&payload);

        link.transmit(&mut packet, TransmitMode::Forced).unwrap();

        let stored_len = RADIO_HEADER_SIZE + payload.len();
        let tx = link.radio.last_transmitted();
        // Length byte on the air covers the frame plus the metrics the
        // radio appends.
        assert_eq!(tx[0] as usize, stored_len + RX_METRICS_SIZE);
        assert_eq!(tx.len(), 1 + stored_len);
        assert_eq!(tx[FCF_OFS], FCF_BYTE_0);
        assert_eq!(tx[FCF_OFS + 1], FCF_BYTE_1);
        assert_eq!(tx[DSN_OFS], 0);
        assert_eq!(&tx[PAYLOAD_OFS..PAYLOAD_OFS + payload.len()], &payload);

        // Sequence numbers increment per transmit.
        let mut second = outgoing_packet(&payload);
        link.transmit(&mut second, TransmitMode::Forced).unwrap();
        assert_eq!(link.radio.last_transmitted()[DSN_OFS], 1);
    }

    #[test]
    fn cca_transmit_succeeds_once_the_channel_clears() {
        let mut radio = RadioDevice::new(0xBEEF);
        radio.set_noise_stuck_low(true);
        let config = LinkConfig {
            cca_retries: 2,
            ..LinkConfig::default()
        };
        let mut link = RadioLink::new(radio, TestDelay::default(), config);
        link.init();
        link.wake_up();
        link.radio.set_channel_busy_for(2);

        let calls_before = link.delay.calls;
        let rnd_before = link.rnd_state;
        let mut packet = outgoing_packet(&[1]);
        link.transmit(&mut packet, TransmitMode::Cca).unwrap();

        // Busy, busy, clear: exactly three attempts and one transmission.
        assert_eq!(link.radio.cca_attempt_count(), 3);
        assert_eq!(link.radio.transmit_count(), 1);

        // The backoff ran exactly twice, each for the number of periods the
        // shared pseudo random sequence dictates.
        let mut rnd = rnd_before;
        let expected_periods = ((lcg_next(&mut rnd) & 0x0F) + 1) as u32 + ((lcg_next(&mut rnd) & 0x0F) + 1) as u32;
        assert_eq!(link.delay.calls - calls_before, expected_periods * CALLS_PER_BACKOFF_PERIOD);
    }

    #[test]
    fn cca_transmit_fails_after_exhausting_the_retry_budget() {
        let mut radio = RadioDevice::new(7);
        radio.set_noise_stuck_low(true);
        let config = LinkConfig {
            cca_retries: 2,
            ..LinkConfig::default()
        };
        let mut link = RadioLink::new(radio, TestDelay::default(), config);
        link.init();
        link.wake_up();
        link.radio.set_channel_busy_for(200);

        let mut packet = outgoing_packet(&[1]);
        assert_eq!(link.transmit(&mut packet, TransmitMode::Cca).unwrap_err(), TxError::CcaFailed);

        // At most retries + 1 attempts, and nothing went out.
        assert_eq!(link.radio.cca_attempt_count(), 3);
        assert_eq!(link.radio.transmit_count(), 0);
    }

    #[test]
    fn transmit_restores_receive_state_afterwards() {
        let mut link = awake_link();
        link.rx_on();
        let mut packet = outgoing_packet(&[9]);
        link.transmit(&mut packet, TransmitMode::Forced).unwrap();

        assert_eq!(link.state(), RadioState::Rx);
        assert!(link.radio.is_receiver_on());
        assert!(link.radio.is_rx_interrupt_enabled());
    }

    #[test]
    fn rx_on_and_rx_idle_are_idempotent() {
        let mut link = awake_link();

        link.rx_on();
        let enables = link.radio.rx_interrupt_enable_count();
        link.rx_on();
        assert_eq!(link.radio.rx_interrupt_enable_count(), enables);
        assert_eq!(link.state(), RadioState::Rx);

        link.rx_idle();
        let disables = link.radio.rx_interrupt_disable_count();
        link.rx_idle();
        assert_eq!(link.radio.rx_interrupt_disable_count(), disables);
        assert_eq!(link.state(), RadioState::Idle);
    }

    #[test]
    fn channel_change_in_receive_state_restores_receive() {
        let mut link = awake_link();
        link.rx_on();

        link.set_logical_channel(0);
        link.set_logical_channel(3);

        assert_eq!(link.state(), RadioState::Rx);
        assert!(link.radio.is_receiver_on());
        // Channel 3 maps to physical channel 26.
        assert_eq!(link.radio.frequency_register(), 0x0B + 5 * (26 - 11));
    }

    #[test]
    #[should_panic(expected = "logical channel out of range")]
    fn invalid_logical_channel_panics() {
        let mut link = awake_link();
        link.set_logical_channel(NUM_LOGICAL_CHANNELS as u8);
    }

    #[test]
    #[should_panic(expected = "power index out of range")]
    fn invalid_power_index_panics() {
        let mut link = awake_link();
        link.set_power(NUM_POWER_SETTINGS as u8);
    }

    #[test]
    #[should_panic(expected = "radio must be awake to change channels")]
    fn channel_change_while_off_panics() {
        let mut link = inited_link();
        link.set_logical_channel(1);
    }

    #[test]
    fn sleep_and_wake_are_idempotent_and_restore_settings() {
        let mut link = awake_link();
        link.set_logical_channel(2);
        link.set_power(0);
        link.set_rx_address_filter([0x12, 0x34, 0x56, 0x78]).unwrap();
        link.enable_rx_address_filter();

        link.sleep();
        assert_eq!(link.state(), RadioState::Off);
        assert!(!link.radio.is_powered());
        // Power-down lost the registers.
        assert_eq!(link.radio.frequency_register(), 0);
        link.sleep();
        assert_eq!(link.state(), RadioState::Off);

        link.wake_up();
        link.wake_up();
        assert_eq!(link.state(), RadioState::Idle);
        assert!(link.radio.is_powered());
        // Everything lost in power-down is back.
        assert_eq!(link.radio.frequency_register(), 0x0B + 5 * (25 - 11));
        assert_eq!(link.radio.power_register(), RF_POWER_TABLE[0]);
        assert_eq!(link.radio.address_filter(), [0x12, 0x34, 0x56, 0x78]);
        assert!(link.radio.is_address_filter_enabled());
    }

    #[test]
    fn valid_frame_reaches_the_receive_callback() {
        let mut link = awake_link();
        link.rx_on();
        let payload = [0xDE, 0xAD, 0xBE];
        // CRC pass bit plus correlation 0x2A.
        link.radio.inject_raw(&air_frame(&payload, 40, 0x80 | 0x2A));

        let mut delivered = 0;
        let mut staged = RadioPacket::new();
        link.service_rx(|packet| {
            delivered += 1;
            staged = *packet;
        });

        assert_eq!(delivered, 1);
        assert_eq!(staged.frame_len() as usize, RADIO_HEADER_SIZE + payload.len());
        assert_eq!(staged.payload(), &payload);
        assert_eq!(staged.rssi(), 40 - 76);
        assert_eq!(staged.lqi(), 0x2A);

        // The copy-out API sees the same staged frame.
        let mut copy = RadioPacket::new();
        link.receive(&mut copy);
        assert_eq!(copy.payload(), &payload);
        assert_eq!(copy.dsn(), 0x07);
    }

    #[test]
    fn undersized_frame_is_drained_without_touching_the_staged_packet() {
        let mut link = awake_link();
        link.rx_on();

        // Stage a good frame first so modification is observable.
        link.radio.inject_raw(&air_frame(&[0x11], 40, 0x80 | 0x2A));
        link.service_rx(|_| {});

        // One byte short of the minimum valid frame size.
        let mut runt = vec![(MIN_FRAME_SIZE - 1) as u8];
        runt.extend_from_slice(&vec![0u8; MIN_FRAME_SIZE - 1]);
        link.radio.inject_raw(&runt);

        let mut delivered = 0;
        link.service_rx(|_| delivered += 1);

        assert_eq!(delivered, 0);
        // FIFO fully drained, staged packet untouched.
        assert!(!link.radio.fifo_has_data());
        let mut staged = RadioPacket::new();
        link.receive(&mut staged);
        assert_eq!(staged.payload(), &[0x11]);
    }

    #[test]
    fn oversized_frame_is_drained_without_touching_the_staged_packet() {
        let mut link = awake_link();
        link.rx_on();

        link.radio.inject_raw(&air_frame(&[0x22], 40, 0x80 | 0x2A));
        link.service_rx(|_| {});

        // One byte past what the frame buffer can hold.
        let air_len = MAX_FRAME_SIZE - 1 + RX_METRICS_SIZE + 1;
        let mut oversized = vec![air_len as u8];
        oversized.extend_from_slice(&vec![0u8; air_len]);
        link.radio.inject_raw(&oversized);

        let mut delivered = 0;
        link.service_rx(|_| delivered += 1);

        assert_eq!(delivered, 0);
        assert!(!link.radio.fifo_has_data());
        let mut staged = RadioPacket::new();
        link.receive(&mut staged);
        assert_eq!(staged.payload(), &[0x22]);
    }

    #[test]
    fn crc_failure_never_reaches_the_callback() {
        let mut link = awake_link();
        link.rx_on();
        // Valid size and frame control field, CRC pass bit clear.
        link.radio.inject_raw(&air_frame(&[0x33], 40, 0x2A));

        let mut delivered = 0;
        link.service_rx(|_| delivered += 1);
        assert_eq!(delivered, 0);
    }

    #[test]
    fn wrong_frame_control_field_never_reaches_the_callback() {
        let mut link = awake_link();
        link.rx_on();
        let mut frame = air_frame(&[0x44], 40, 0x80 | 0x2A);
        frame[FCF_OFS] = 0x02;
        link.radio.inject_raw(&frame);

        let mut delivered = 0;
        link.service_rx(|_| delivered += 1);
        assert_eq!(delivered, 0);
    }

    #[test]
    fn several_pending_frames_are_drained_in_one_service_call() {
        let mut link = awake_link();
        link.rx_on();
        link.radio.inject_raw(&air_frame(&[0x01], 40, 0x80 | 0x10));
        link.radio.inject_raw(&air_frame(&[0x02], 42, 0x80 | 0x11));

        let mut payloads = Vec::new();
        link.service_rx(|packet| payloads.push(packet.payload()[0]));

        assert_eq!(payloads, vec![0x01, 0x02]);
        assert!(!link.radio.frame_pending());
        // The clear-everything erratum write happens once per service call.
        assert_eq!(link.radio.all_flag_clear_count(), 1);
    }

    #[test]
    fn fifo_overflow_recovers_with_a_double_flush() {
        let mut link = awake_link();
        link.rx_on();
        let flushes_before = link.radio.rx_flush_strobe_count();
        link.radio.force_overflow();

        let mut delivered = 0;
        link.service_rx(|_| delivered += 1);

        assert_eq!(delivered, 0);
        // One recovery flush, issued as two strobes.
        assert_eq!(link.radio.rx_flush_strobe_count() - flushes_before, 2);
        assert!(!link.radio.frame_pending());
    }

    #[test]
    #[should_panic(expected = "receive service outside receive state")]
    fn frame_service_outside_receive_state_panics() {
        let mut link = awake_link();
        link.radio.inject_raw(&air_frame(&[0x55], 40, 0x80 | 0x2A));
        link.service_rx(|_| {});
    }

    #[test]
    fn frame_service_with_nothing_pending_is_a_no_op() {
        let mut link = awake_link();
        // Idle state, empty FIFO: must return without asserting.
        link.service_rx(|_| panic!("no frame should be delivered"));
    }

    #[test]
    fn rssi_is_offset_compensated_and_clamped() {
        let mut link = awake_link();
        link.rx_on();

        link.radio.set_rssi_raw(40);
        assert_eq!(link.rssi(), 40 - 76);

        // Two's complement raw value.
        link.radio.set_rssi_raw(0xF6); // -10
        assert_eq!(link.rssi(), -10 - 76);

        // Clamp at the bottom of the i8 range.
        link.radio.set_rssi_raw(200); // -56 raw, -132 after offset
        assert_eq!(link.rssi(), -128);
    }

    #[test]
    #[should_panic(expected = "RSSI reading requires receive state")]
    fn rssi_outside_receive_state_panics() {
        let mut link = awake_link();
        let _ = link.rssi();
    }

    #[test]
    fn reserved_filter_addresses_are_rejected() {
        let mut link = awake_link();

        // PAN ID 0xFFFF.
        assert_eq!(link.set_rx_address_filter([0xFF, 0xFF, 0x01, 0x02]).unwrap_err(), FilterError::ReservedAddress);
        // PAN ID 0xFFFE.
        assert_eq!(link.set_rx_address_filter([0xFE, 0xFF, 0x01, 0x02]).unwrap_err(), FilterError::ReservedAddress);
        // Short address 0xFFFF.
        assert_eq!(link.set_rx_address_filter([0x01, 0x02, 0xFF, 0xFF]).unwrap_err(), FilterError::ReservedAddress);

        // A non-reserved address is accepted and written to the radio.
        link.set_rx_address_filter([0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(link.radio.address_filter(), [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    #[should_panic(expected = "address filter enabled before an address was set")]
    fn enabling_the_filter_without_an_address_panics() {
        let mut link = awake_link();
        link.enable_rx_address_filter();
    }

    #[test]
    fn delay_ms_runs_the_chunked_quantum_per_millisecond() {
        let mut link = inited_link();
        let calls_before = link.delay.calls;
        link.delay_ms(3);
        assert_eq!(link.delay.calls - calls_before, 3 * (1000 / MAX_CRITICAL_DELAY_US + 1));
    }

    #[test]
    fn posted_kill_sem_cuts_a_reply_delay_short() {
        let link = inited_link();
        // Inactive post must be a no-op; the timer tests cover the live
        // cancellation path, here we only prove the link-level plumbing.
        link.post_kill_sem();
    }
}
