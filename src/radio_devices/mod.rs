//! Radio device implementations
//!
//! This module holds the register-level seam between the link state machine
//! and the physical radio, plus one implementation per supported device:
//!
//! - `spi`: generic SPI transceiver driver over `embedded-hal` 1.0
//! - `simulator`: in-memory software radio for host tests and simulation
//!
//! The link layer only ever talks to [`RadioRegisters`]; picking a device is
//! a build-time feature choice, and the active implementation is re-exported
//! as `RadioDevice` for the built-in service task.

#[cfg(feature = "radio-device-spi")]
pub mod spi;

#[cfg(feature = "radio-device-simulator")]
pub mod simulator;

#[cfg(feature = "radio-device-simulator")]
pub use simulator::RadioDevice;

/// Number of logical channels exposed to the network layer.
pub const NUM_LOGICAL_CHANNELS: usize = 4;

/// Translates a logical channel into the physical channel number the
/// frequency register is derived from. Replace or add entries as needed, but
/// keep [`NUM_LOGICAL_CHANNELS`] in step.
pub const LOGICAL_CHANNEL_TABLE: [u8; NUM_LOGICAL_CHANNELS] = [15, 20, 25, 26];

/// Number of output power settings exposed to the network layer.
pub const NUM_POWER_SETTINGS: usize = 3;

/// Power register values indexed by logical power level, low to high. The
/// defaults approximate -20 dBm, -10 dBm and 0 dBm; the highest entry is the
/// startup default.
pub const RF_POWER_TABLE: [u8; NUM_POWER_SETTINGS] = [0x03, 0x2C, 0x32];

/// Register-level operations of a frame-oriented packet radio.
///
/// One implementation exists per physical radio family. Implementations own
/// no protocol state beyond the physical radio itself; all sequencing rules
/// (receiver off before channel changes, RSSI settle time before CCA, and so
/// on) are enforced by the link layer above.
pub trait RadioRegisters {
    /// Part number the chip must report at init; a mismatch is fatal.
    const PART_NUMBER: u8;
    /// Oldest silicon revision the driver supports.
    const MIN_VERSION: u8;
    /// Offset subtracted from the raw RSSI register value to get dBm.
    const RSSI_OFFSET_DB: i16;
    /// Time from receiver-on until the RSSI reading can be trusted, derived
    /// from the radio's symbol rate.
    const RSSI_VALID_DELAY_US: u32;
    /// Fixed over-the-air data rate, used to size the reply delay.
    const DATA_RATE_BPS: u32;

    /// Power the chip up and busy-wait until it reports ready.
    fn power_on(&mut self);
    fn power_off(&mut self);

    fn part_number(&mut self) -> u8;
    fn version(&mut self) -> u8;

    /// Write the frequency register for the given physical channel number.
    fn set_channel(&mut self, phy_channel: u8);
    /// Write the output power register value.
    fn set_tx_power(&mut self, register_value: u8);

    fn strobe_rx_on(&mut self);
    fn strobe_rf_off(&mut self);

    /// Flush the receive FIFO. Implementations must issue the hardware flush
    /// command twice; a single flush is not sufficient on the supported
    /// parts.
    fn flush_rx_fifo(&mut self);
    fn flush_tx_fifo(&mut self);
    fn write_tx_fifo(&mut self, bytes: &[u8]);

    /// Unconditionally strobe transmit.
    fn strobe_tx(&mut self);
    /// Strobe transmit-on-clear-channel. Whether transmission actually
    /// started must be sampled immediately afterwards via [`sampled_cca`],
    /// inside the same critical section.
    ///
    /// [`sampled_cca`]: RadioRegisters::sampled_cca
    fn strobe_tx_on_cca(&mut self);
    fn sampled_cca(&mut self) -> bool;

    fn tx_done(&mut self) -> bool;
    fn clear_tx_done(&mut self);

    fn rssi_valid(&mut self) -> bool;
    fn rssi_raw(&mut self) -> u8;

    /// One bit of analog noise, used to accumulate the random seed at init.
    fn random_noise_bit(&mut self) -> u8;
    /// Load the hardware random generator seed. The seed register is written
    /// twice: the second write shifts the first byte into the companion
    /// register.
    fn seed_random(&mut self, seed: u16);

    /// A complete frame is waiting in the receive FIFO (the FIFOP line).
    fn frame_pending(&mut self) -> bool;
    /// The receive FIFO holds any bytes at all (the FIFO line). Frame
    /// pending combined with an empty FIFO signals overflow.
    fn fifo_has_data(&mut self) -> bool;
    fn read_rx_fifo_byte(&mut self) -> u8;

    /// Clear the per-frame receive interrupt flag.
    fn clear_frame_pending_flag(&mut self);
    /// Clear every radio interrupt flag in one write. Documented silicon
    /// erratum: the receive service routine must always end with this.
    fn clear_all_radio_flags(&mut self);

    fn enable_rx_interrupt(&mut self);
    fn disable_rx_interrupt(&mut self);

    fn set_address_filter(&mut self, addr: [u8; 4]);
    fn set_address_filter_enabled(&mut self, enabled: bool);
}
