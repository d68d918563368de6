//! # SPI Radio Device - Register Driver for SPI-Attached Transceivers
//!
//! Register-level driver for a frame-oriented packet radio hanging off an
//! SPI bus, written against the `embedded-hal` 1.0 traits so it works with
//! any platform HAL that provides them.
//!
//! ## Hardware Requirements
//!
//! - SPI interface exposed as an [`embedded_hal::spi::SpiDevice`]
//! - Control outputs: RESETN (active low), VREG_EN (regulator enable)
//! - Status inputs: TX_DONE, FIFOP (complete frame pending), FIFO (receive
//!   FIFO non-empty)
//! - The MCU-side receive interrupt line, abstracted as
//!   [`RxInterruptControl`] because enabling, disabling and acknowledging
//!   that interrupt happens in the interrupt controller, not in the radio
//!
//! ## Wire Contract
//!
//! The strobe and register opcode map below is this crate's own versioned
//! contract with the radio. Command strobes are single-byte writes;
//! register access is a two-byte exchange; FIFO access keeps chip select
//! asserted across an opcode byte followed by the burst data.
//!
//! ## Error Policy
//!
//! The bus to an on-board radio either works or the hardware is broken, so
//! SPI and pin errors are treated as fatal contract violations rather than
//! results to propagate. This matches how the rest of the link layer treats
//! build/hardware mismatches.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::{Operation, SpiDevice};

use super::RadioRegisters;

// Command strobes.
const STROBE_RX_ON: u8 = 0x42;
const STROBE_TX_ON: u8 = 0x43;
const STROBE_TX_ON_CCA: u8 = 0x44;
const STROBE_RF_OFF: u8 = 0x45;
const STROBE_FLUSH_RX: u8 = 0x46;
const STROBE_FLUSH_TX: u8 = 0x47;

// Register addresses. Reads are `REG_READ | addr`, writes `REG_WRITE | addr`.
const REG_READ: u8 = 0x80;
const REG_WRITE: u8 = 0xC0;
const REG_CHIP_ID: u8 = 0x10;
const REG_VERSION: u8 = 0x11;
const REG_FREQ_CTRL: u8 = 0x12;
const REG_TX_POWER: u8 = 0x13;
const REG_RSSI: u8 = 0x14;
const REG_STATUS: u8 = 0x15;
const REG_SEED: u8 = 0x16;
const REG_EXC_FLAGS: u8 = 0x17;
const REG_FILTER_PAN_ID_L: u8 = 0x18;
const REG_FRAME_FILTER: u8 = 0x1C;

// FIFO access opcodes.
const OPCODE_TX_FIFO: u8 = 0x20;
const OPCODE_RX_FIFO: u8 = 0x21;

// Status register bits.
const STATUS_XOSC_STABLE: u8 = 0x01;
const STATUS_RSSI_VALID: u8 = 0x02;
const STATUS_SAMPLED_CCA: u8 = 0x04;

// Exception flag register bits.
const EXC_TX_FRM_DONE: u8 = 0x01;

// Frame filter register bits.
const FRAME_FILTER_ENABLE: u8 = 0x01;

/// Regulator settle time before the chip is released from reset.
const VREG_SETTLE_TIME_US: u32 = 100;

/// MCU-side control of the receive-frame interrupt line.
///
/// The FIFOP signal is routed to an interrupt on the host MCU; masking and
/// acknowledging it is interrupt-controller work the radio driver cannot do
/// over SPI. Platforms supply this alongside the pins.
pub trait RxInterruptControl {
    fn enable(&mut self);
    fn disable(&mut self);
    /// Acknowledge the pending interrupt flag for the FIFOP line.
    fn clear_flag(&mut self);
}

/// SPI-attached radio, generic over the platform's bus, pins, interrupt
/// control and delay provider.
pub struct RadioDevice<Spi, ResetN, VregEn, TxDonePin, FifopPin, FifoPin, Irq, Delay> {
    spi: Spi,
    resetn: ResetN,
    vreg_en: VregEn,
    tx_done_pin: TxDonePin,
    fifop_pin: FifopPin,
    fifo_pin: FifoPin,
    irq: Irq,
    delay: Delay,
}

impl<Spi, ResetN, VregEn, TxDonePin, FifopPin, FifoPin, Irq, Delay>
    RadioDevice<Spi, ResetN, VregEn, TxDonePin, FifopPin, FifoPin, Irq, Delay>
where
    Spi: SpiDevice,
    ResetN: OutputPin,
    VregEn: OutputPin,
    TxDonePin: InputPin,
    FifopPin: InputPin,
    FifoPin: InputPin,
    Irq: RxInterruptControl,
    Delay: DelayNs,
{
    pub fn new(
        spi: Spi,
        resetn: ResetN,
        vreg_en: VregEn,
        tx_done_pin: TxDonePin,
        fifop_pin: FifopPin,
        fifo_pin: FifoPin,
        irq: Irq,
        delay: Delay,
    ) -> Self {
        RadioDevice {
            spi,
            resetn,
            vreg_en,
            tx_done_pin,
            fifop_pin,
            fifo_pin,
            irq,
            delay,
        }
    }

    fn strobe(&mut self, strobe: u8) {
        assert!(self.spi.write(&[strobe]).is_ok(), "SPI bus fault");
    }

    fn reg_read(&mut self, addr: u8) -> u8 {
        let mut response = [0u8; 2];
        assert!(self.spi.transfer(&mut response, &[REG_READ | addr, 0]).is_ok(), "SPI bus fault");
        response[1]
    }

    fn reg_write(&mut self, addr: u8, value: u8) {
        assert!(self.spi.write(&[REG_WRITE | addr, value]).is_ok(), "SPI bus fault");
    }
}

impl<Spi, ResetN, VregEn, TxDonePin, FifopPin, FifoPin, Irq, Delay> RadioRegisters
    for RadioDevice<Spi, ResetN, VregEn, TxDonePin, FifopPin, FifoPin, Irq, Delay>
where
    Spi: SpiDevice,
    ResetN: OutputPin,
    VregEn: OutputPin,
    TxDonePin: InputPin,
    FifopPin: InputPin,
    FifoPin: InputPin,
    Irq: RxInterruptControl,
    Delay: DelayNs,
{
    const PART_NUMBER: u8 = 0x84;
    const MIN_VERSION: u8 = 0x00;
    const RSSI_OFFSET_DB: i16 = 76;
    // 20 symbol periods at 16 us per symbol: 12 symbols from idle to rx plus
    // 8 symbols to integrate the RSSI value.
    const RSSI_VALID_DELAY_US: u32 = 320;
    const DATA_RATE_BPS: u32 = 250_000;

    fn power_on(&mut self) {
        assert!(self.resetn.set_low().is_ok(), "radio control pin fault");
        assert!(self.vreg_en.set_high().is_ok(), "radio control pin fault");
        self.delay.delay_us(VREG_SETTLE_TIME_US);
        assert!(self.resetn.set_high().is_ok(), "radio control pin fault");

        // No timeout here: a crystal that never stabilizes means dead
        // hardware, and the device is not usable anyway.
        while self.reg_read(REG_STATUS) & STATUS_XOSC_STABLE == 0 {}
    }

    fn power_off(&mut self) {
        assert!(self.resetn.set_low().is_ok(), "radio control pin fault");
        assert!(self.vreg_en.set_low().is_ok(), "radio control pin fault");
    }

    fn part_number(&mut self) -> u8 {
        self.reg_read(REG_CHIP_ID)
    }

    fn version(&mut self) -> u8 {
        self.reg_read(REG_VERSION)
    }

    fn set_channel(&mut self, phy_channel: u8) {
        // Channel 11 sits at the base register value; consecutive channels
        // are 5 MHz, one register step per MHz.
        self.reg_write(REG_FREQ_CTRL, 0x0B + 5 * (phy_channel - 11));
    }

    fn set_tx_power(&mut self, register_value: u8) {
        self.reg_write(REG_TX_POWER, register_value);
    }

    fn strobe_rx_on(&mut self) {
        self.strobe(STROBE_RX_ON);
    }

    fn strobe_rf_off(&mut self) {
        self.strobe(STROBE_RF_OFF);
    }

    fn flush_rx_fifo(&mut self) {
        // The flush must be issued twice; a single strobe leaves the FIFO
        // state machine stuck after an overflow.
        critical_section::with(|_| {
            self.strobe(STROBE_FLUSH_RX);
            self.strobe(STROBE_FLUSH_RX);
        });
    }

    fn flush_tx_fifo(&mut self) {
        self.strobe(STROBE_FLUSH_TX);
    }

    fn write_tx_fifo(&mut self, bytes: &[u8]) {
        let mut ops = [Operation::Write(&[OPCODE_TX_FIFO]), Operation::Write(bytes)];
        assert!(self.spi.transaction(&mut ops).is_ok(), "SPI bus fault");
    }

    fn strobe_tx(&mut self) {
        self.strobe(STROBE_TX_ON);
    }

    fn strobe_tx_on_cca(&mut self) {
        self.strobe(STROBE_TX_ON_CCA);
    }

    fn sampled_cca(&mut self) -> bool {
        self.reg_read(REG_STATUS) & STATUS_SAMPLED_CCA != 0
    }

    fn tx_done(&mut self) -> bool {
        match self.tx_done_pin.is_high() {
            Ok(level) => level,
            Err(_) => panic!("radio status pin fault"),
        }
    }

    fn clear_tx_done(&mut self) {
        let flags = self.reg_read(REG_EXC_FLAGS);
        self.reg_write(REG_EXC_FLAGS, flags & !EXC_TX_FRM_DONE);
    }

    fn rssi_valid(&mut self) -> bool {
        self.reg_read(REG_STATUS) & STATUS_RSSI_VALID != 0
    }

    fn rssi_raw(&mut self) -> u8 {
        self.reg_read(REG_RSSI)
    }

    fn random_noise_bit(&mut self) -> u8 {
        self.reg_read(REG_RSSI) & 0x01
    }

    fn seed_random(&mut self, seed: u16) {
        // Two writes to the same register: the second shifts the first byte
        // into the companion register, loading the full 16-bit seed.
        self.reg_write(REG_SEED, (seed & 0xFF) as u8);
        self.reg_write(REG_SEED, (seed >> 8) as u8);
    }

    fn frame_pending(&mut self) -> bool {
        match self.fifop_pin.is_high() {
            Ok(level) => level,
            Err(_) => panic!("radio status pin fault"),
        }
    }

    fn fifo_has_data(&mut self) -> bool {
        match self.fifo_pin.is_high() {
            Ok(level) => level,
            Err(_) => panic!("radio status pin fault"),
        }
    }

    fn read_rx_fifo_byte(&mut self) -> u8 {
        let mut response = [0u8; 2];
        assert!(self.spi.transfer(&mut response, &[OPCODE_RX_FIFO, 0]).is_ok(), "SPI bus fault");
        response[1]
    }

    fn clear_frame_pending_flag(&mut self) {
        self.irq.clear_flag();
    }

    fn clear_all_radio_flags(&mut self) {
        self.reg_write(REG_EXC_FLAGS, 0x00);
    }

    fn enable_rx_interrupt(&mut self) {
        self.irq.enable();
    }

    fn disable_rx_interrupt(&mut self) {
        self.irq.disable();
    }

    fn set_address_filter(&mut self, addr: [u8; 4]) {
        for (i, byte) in addr.iter().enumerate() {
            self.reg_write(REG_FILTER_PAN_ID_L + i as u8, *byte);
        }
    }

    fn set_address_filter_enabled(&mut self, enabled: bool) {
        let current = self.reg_read(REG_FRAME_FILTER);
        let value = if enabled {
            current | FRAME_FILTER_ENABLE
        } else {
            current & !FRAME_FILTER_ENABLE
        };
        self.reg_write(REG_FRAME_FILTER, value);
    }
}
