//! Chip-manipulation commands: voltages, erase, program, read-back, blank
//! checks and the debug vector.
//!
//! A [`Programmer`] wraps an open [`Connection`] for one chip model. Its
//! constructor sends the init-programming-vars block, which the firmware
//! requires before any other chip command; every mutating command runs
//! inside [`Programmer::with_vpp`], which guarantees the programming
//! voltages are dropped and the jump table exited on every path out,
//! success or failure.

use std::convert::TryInto;
use std::time::Duration;

use log::{debug, info};

use crate::chipinfo::ChipInfo;
use crate::connection::{Connection, DEFAULT_TIMEOUT, LONG_TIMEOUT};
use crate::transport::Link;
use crate::utils::HexSlice;
use crate::{Error, Result};

const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A full ROM read at 19200 baud takes a while on the large parts.
const READ_ROM_TIMEOUT: Duration = Duration::from_secs(180);

/// Chip ID, programmed user ID, fuses and calibration, as read back from
/// the hardware. The wire layout is 26 bytes little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipConfig {
    pub chip_id: u16,
    pub id: [u8; 8],
    pub fuses: [u16; 7],
    pub calibrate: u16,
}

impl ChipConfig {
    pub fn from_bytes(data: &[u8; 26]) -> ChipConfig {
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[2..10]);
        let mut fuses = [0u16; 7];
        for (slot, pair) in fuses.iter_mut().zip(data[10..24].chunks_exact(2)) {
            *slot = u16::from_le_bytes([pair[0], pair[1]]);
        }
        ChipConfig {
            chip_id: u16::from_le_bytes([data[0], data[1]]),
            id,
            fuses,
            calibrate: u16::from_le_bytes([data[24], data[25]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 26] {
        let mut data = [0u8; 26];
        data[..2].copy_from_slice(&self.chip_id.to_le_bytes());
        data[2..10].copy_from_slice(&self.id);
        for (pair, fuse) in data[10..24].chunks_exact_mut(2).zip(self.fuses.iter()) {
            pair.copy_from_slice(&fuse.to_le_bytes());
        }
        data[24..].copy_from_slice(&self.calibrate.to_le_bytes());
        data
    }
}

/// Fuse values staged on a 16-bit core by [`Programmer::program_id_fuses`].
///
/// On those cores the fuses are not burned until the transaction is closed
/// with [`Programmer::commit_18f_fuses`]; holding the staged words in this
/// token makes it impossible to commit without priming first.
#[must_use = "16-bit fuses are not burned until the transaction is committed"]
#[derive(Debug)]
pub struct FuseTransaction {
    fuses: Vec<u16>,
}

/// The chip-programming interface for one chip model over one session.
#[derive(Debug)]
pub struct Programmer<'a, L: Link> {
    connection: &'a mut Connection<L>,
    chip: &'a ChipInfo,
}

impl<'a, L: Link> Programmer<'a, L> {
    /// Sends the init-programming-vars block for `chip` and returns the
    /// ready interface.
    ///
    /// In ICSP mode the power sequence is remapped onto the Vpp1 rail
    /// before it is sent.
    pub fn new(
        connection: &'a mut Connection<L>,
        chip: &'a ChipInfo,
        icsp_mode: bool,
    ) -> Result<Programmer<'a, L>> {
        let mut vars = chip.programming_vars()?;
        if icsp_mode {
            vars = vars.for_icsp();
        }

        let opcode = connection.commands().init_vars;
        connection.command_start(Some(opcode))?;
        connection.link.send(&vars.to_bytes())?;
        let ack = connection.read_bytes(1, Some(DEFAULT_TIMEOUT))?;
        connection.command_end()?;
        if ack.as_slice() != b"I" {
            return Err(Error::response(format!(
                "programmer rejected programming variables, got {:?}",
                HexSlice(&ack)
            )));
        }
        debug!("programming variables initialized for {}", chip.chip_name);
        Ok(Programmer { connection, chip })
    }

    pub fn chip(&self) -> &ChipInfo {
        self.chip
    }

    /// Turns the programming voltages on or off inside the current jump
    /// session.
    fn set_vpp(&mut self, on: bool) -> Result<()> {
        let commands = self.connection.commands();
        if on {
            self.connection.link.send(&[commands.vpp_on])?;
            self.connection.expect(b"V", Some(DEFAULT_TIMEOUT))
        } else {
            self.connection.link.send(&[commands.vpp_off])?;
            self.connection.expect(b"v", Some(DEFAULT_TIMEOUT))
        }
    }

    /// Runs `body` with the voltages up and `opcode` dispatched, dropping
    /// the voltages and leaving the jump table on every exit path. The
    /// body's error wins over any cleanup error.
    fn with_vpp<R>(
        &mut self,
        opcode: u8,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.connection.command_start(None)?;
        self.set_vpp(true)?;
        self.connection.link.send(&[opcode])?;
        let result = body(self);
        let powered_down = self.set_vpp(false);
        let ended = self.connection.command_end();
        let value = result?;
        powered_down?;
        ended?;
        Ok(value)
    }

    /// One opcode, one acknowledgement byte, no payload.
    fn simple_command(&mut self, opcode: u8, expected: u8) -> Result<()> {
        self.connection.command_start(Some(opcode))?;
        let ack = self.connection.read_bytes(1, Some(DEFAULT_TIMEOUT))?;
        self.connection.command_end()?;
        if ack != [expected] {
            return Err(Error::response(format!(
                "expected {:?}, received {:?}",
                HexSlice(&[expected]),
                HexSlice(&ack)
            )));
        }
        Ok(())
    }

    /// Power-cycles the programming voltages.
    pub fn cycle_programming_voltages(&mut self) -> Result<()> {
        let opcode = self.connection.commands().cycle_vpp;
        self.simple_command(opcode, b'V')
    }

    /// Writes `data` to ROM, high byte first, in 32-byte packets.
    pub fn program_rom(&mut self, data: &[u8]) -> Result<()> {
        let word_count = data.len() / 2;
        if word_count as u32 > self.chip.rom_size {
            return Err(Error::value(format!(
                "data too large for PIC ROM: {} > {} words",
                word_count, self.chip.rom_size
            )));
        }
        if data.len() % 32 != 0 {
            return Err(Error::value("ROM data must be a multiple of 32 bytes"));
        }

        let opcode = self.connection.commands().program_rom;
        self.with_vpp(opcode, |programmer| {
            let connection = &mut *programmer.connection;
            connection.link.send(&(word_count as u16).to_be_bytes())?;
            connection.expect(b"Y", Some(LONG_TIMEOUT))?;

            let transfer = (|| {
                for chunk in data.chunks(32) {
                    connection.link.send(chunk)?;
                    connection.expect(b"Y", Some(LONG_TIMEOUT))?;
                }
                connection.expect(b"P", Some(LONG_TIMEOUT))
            })();
            if transfer.is_err() {
                // Desynced mid-transfer; drop whatever the unit is saying.
                connection.link.flush_input()?;
            }
            transfer
        })?;
        info!("programmed {} ROM words", word_count);
        Ok(())
    }

    /// Writes `data` to EEPROM in 2-byte chunks.
    pub fn program_eeprom(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u32 > self.chip.eeprom_size {
            return Err(Error::value(format!(
                "data too large for PIC EEPROM: {} > {} bytes",
                data.len(),
                self.chip.eeprom_size
            )));
        }
        if data.len() % 2 != 0 {
            return Err(Error::value("EEPROM data must be a multiple of 2 bytes"));
        }

        let opcode = self.connection.commands().program_eeprom;
        self.with_vpp(opcode, |programmer| {
            let connection = &mut *programmer.connection;
            connection.link.send(&(data.len() as u16).to_be_bytes())?;
            connection.expect(b"Y", Some(LONG_TIMEOUT))?;
            for chunk in data.chunks(2) {
                connection.link.send(chunk)?;
                connection.expect(b"Y", Some(LONG_TIMEOUT))?;
            }
            // The handler swallows two further bytes before acknowledging.
            // Zeros are harmless if the unit already fell back to the jump
            // table.
            connection.link.send(&[0, 0])?;
            connection.expect(b"P", Some(LONG_TIMEOUT))
        })?;
        info!("programmed {} EEPROM bytes", data.len());
        Ok(())
    }

    /// Programs the user ID and the fuses.
    ///
    /// On 16-bit cores the fuses are only staged; the returned
    /// [`FuseTransaction`] must be committed after verification. The other
    /// cores burn their single fuse word immediately and return `None`.
    pub fn program_id_fuses(
        &mut self,
        id: &[u8],
        fuses: &[u16],
    ) -> Result<Option<FuseTransaction>> {
        let sixteen_bit = self.chip.core_bits() == 16;
        let mut body = Vec::with_capacity(24);
        // The handler expects ASCII zeros here, not zero bytes.
        body.extend_from_slice(b"00");
        if sixteen_bit {
            if id.len() != 8 {
                return Err(Error::value("16-bit cores take an 8-byte ID"));
            }
            if fuses.len() != 7 {
                return Err(Error::value("16-bit cores take 7 fuse words"));
            }
            body.extend_from_slice(id);
            for fuse in fuses {
                body.extend_from_slice(&fuse.to_le_bytes());
            }
        } else {
            if id.len() != 4 {
                return Err(Error::value("12/14-bit cores take a 4-byte ID"));
            }
            if fuses.len() != 1 {
                return Err(Error::value("12/14-bit cores take a single fuse word"));
            }
            body.extend_from_slice(id);
            body.extend_from_slice(b"FFFF");
            body.extend_from_slice(&fuses[0].to_le_bytes());
            body.extend_from_slice(&[0xff; 12]);
        }

        let opcode = self.connection.commands().program_id_fuses;
        let ack = self.with_vpp(opcode, |programmer| {
            programmer.connection.link.send(&body)?;
            programmer.connection.read_bytes(1, Some(LONG_TIMEOUT))
        })?;
        if ack.as_slice() != b"Y" {
            return Err(Error::response(format!(
                "ID/fuse programming not acknowledged, got {:?}",
                HexSlice(&ack)
            )));
        }

        if sixteen_bit {
            Ok(Some(FuseTransaction {
                fuses: fuses.to_vec(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Burns the fuse values staged by [`Programmer::program_id_fuses`] on
    /// a 16-bit core.
    pub fn commit_18f_fuses(&mut self, transaction: FuseTransaction) -> Result<()> {
        let mut body = vec![0u8; 10];
        for fuse in &transaction.fuses {
            body.extend_from_slice(&fuse.to_le_bytes());
        }

        let opcode = self.connection.commands().commit_18f_fuses;
        let ack = self.with_vpp(opcode, |programmer| {
            programmer.connection.link.send(&body)?;
            programmer.connection.read_bytes(1, Some(DEFAULT_TIMEOUT))
        })?;
        if ack.as_slice() != b"Y" {
            return Err(Error::response(format!(
                "fuse commit not acknowledged, got {:?}",
                HexSlice(&ack)
            )));
        }
        info!("committed 18F fuse data");
        Ok(())
    }

    /// Programs the calibration word and its fuse.
    pub fn program_calibration(&mut self, calibrate: u16, fuse: u16) -> Result<()> {
        let opcode = self.connection.commands().program_calibration;
        let ack = self.with_vpp(opcode, |programmer| {
            let mut payload = [0u8; 4];
            payload[..2].copy_from_slice(&calibrate.to_be_bytes());
            payload[2..].copy_from_slice(&fuse.to_be_bytes());
            programmer.connection.link.send(&payload)?;
            programmer.connection.read_bytes(1, Some(CALIBRATION_TIMEOUT))
        })?;
        match ack.as_slice() {
            b"Y" => Ok(()),
            b"C" => Err(Error::response("calibration programming failed")),
            b"F" => Err(Error::response("calibration fuse programming failed")),
            other => Err(Error::response(format!(
                "unexpected response {:?} to calibration programming",
                HexSlice(other)
            ))),
        }
    }

    /// Reads the whole ROM as big-endian words.
    pub fn read_rom(&mut self) -> Result<Vec<u8>> {
        let size = self.chip.rom_size as usize * 2;
        let opcode = self.connection.commands().read_rom;
        let data = self.with_vpp(opcode, |programmer| {
            programmer.connection.read_bytes(size, Some(READ_ROM_TIMEOUT))
        })?;
        if data.len() != size {
            return Err(Error::response(format!(
                "short ROM read: {} of {} bytes",
                data.len(),
                size
            )));
        }
        Ok(data)
    }

    /// Reads the whole EEPROM.
    pub fn read_eeprom(&mut self) -> Result<Vec<u8>> {
        let size = self.chip.eeprom_size as usize;
        let opcode = self.connection.commands().read_eeprom;
        let data = self.with_vpp(opcode, |programmer| {
            programmer.connection.read_bytes(size, Some(LONG_TIMEOUT))
        })?;
        if data.len() != size {
            return Err(Error::response(format!(
                "short EEPROM read: {} of {} bytes",
                data.len(),
                size
            )));
        }
        Ok(data)
    }

    /// Reads the chip ID, programmed ID, fuses and calibration word.
    pub fn read_config(&mut self) -> Result<ChipConfig> {
        let opcode = self.connection.commands().read_config;
        let raw = self.with_vpp(opcode, |programmer| {
            programmer.connection.expect(b"C", Some(DEFAULT_TIMEOUT))?;
            programmer.connection.read_bytes(26, Some(DEFAULT_TIMEOUT))
        })?;
        let raw: &[u8; 26] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::response("short chip config read"))?;
        Ok(ChipConfig::from_bytes(raw))
    }

    /// Erases all data on the chip.
    pub fn erase_chip(&mut self) -> Result<()> {
        let opcode = self.connection.commands().erase_chip;
        let ack = self.with_vpp(opcode, |programmer| {
            programmer.connection.read_bytes(1, Some(LONG_TIMEOUT))
        })?;
        if ack.as_slice() != b"Y" {
            return Err(Error::response(format!(
                "erase not acknowledged, got {:?}",
                HexSlice(&ack)
            )));
        }
        info!("chip erased");
        Ok(())
    }

    /// Checks whether the ROM is blank. `high_byte` is the blank word's
    /// high byte, which the firmware compares against.
    ///
    /// The unit emits one interim `B` per 256-word bank after the first;
    /// more than that means the session is desynced.
    pub fn rom_is_blank(&mut self, high_byte: u8) -> Result<bool> {
        let opcode = self.connection.commands().rom_is_blank;
        let mut progress_left = (self.chip.rom_size / 256).saturating_sub(1);
        self.connection.command_start(Some(opcode))?;
        self.connection.link.send(&[high_byte])?;
        loop {
            let response = self.connection.read_bytes(1, Some(LONG_TIMEOUT))?;
            match response.first().copied() {
                Some(b'Y') => {
                    self.connection.command_end()?;
                    return Ok(true);
                }
                Some(b'N') | Some(b'C') => {
                    self.connection.command_end()?;
                    return Ok(false);
                }
                Some(b'B') => {
                    if progress_left == 0 {
                        return Err(Error::response(
                            "too many progress bytes in ROM blank check",
                        ));
                    }
                    progress_left -= 1;
                }
                _ => {
                    return Err(Error::response(format!(
                        "unexpected response {:?} in ROM blank check",
                        HexSlice(&response)
                    )))
                }
            }
        }
    }

    /// Checks whether the EEPROM is blank.
    pub fn eeprom_is_blank(&mut self) -> Result<bool> {
        let opcode = self.connection.commands().eeprom_is_blank;
        self.connection.command_start(Some(opcode))?;
        let ack = self.connection.read_bytes(1, Some(DEFAULT_TIMEOUT))?;
        self.connection.command_end()?;
        match ack.as_slice() {
            b"Y" => Ok(true),
            b"N" => Ok(false),
            other => Err(Error::response(format!(
                "unexpected response {:?} in EEPROM blank check",
                HexSlice(other)
            ))),
        }
    }

    /// Sets the chip's debugging vector (low 24 bits of `address`).
    pub fn program_debug_vector(&mut self, address: u32) -> Result<()> {
        let opcode = self.connection.commands().program_debug_vector;
        let bytes = address.to_be_bytes();
        self.connection.command_start(Some(opcode))?;
        self.connection.link.send(&bytes[1..4])?;
        let ack = self.connection.read_bytes(1, Some(DEFAULT_TIMEOUT))?;
        self.connection.command_end()?;
        if ack.as_slice() != b"Y" {
            return Err(Error::response(format!(
                "debug vector programming not acknowledged, got {:?}",
                HexSlice(&ack)
            )));
        }
        Ok(())
    }

    /// Reads the chip's debugging vector.
    pub fn read_debug_vector(&mut self) -> Result<u32> {
        let opcode = self.connection.commands().read_debug_vector;
        self.connection.command_start(Some(opcode))?;
        let response = self.connection.read_bytes(4, Some(DEFAULT_TIMEOUT))?;
        self.connection.command_end()?;
        if response.len() != 4 {
            return Err(Error::response("short debug vector read"));
        }
        Ok(u32::from_be_bytes([0, response[1], response[2], response[3]]))
    }
}
