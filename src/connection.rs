//! Session management and framing for the programmer's wire protocol.
//!
//! The on-board controller has two states: idle, where `0x01` is answered
//! with `Q` and `P` enters the command jump table, and the jump table
//! itself, where single opcode bytes select command handlers. A
//! [`Connection`] tracks that handshake, resolves the firmware revision's
//! opcode numbering, and provides the session-level queries.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::transport::Link;
use crate::utils::HexSlice;
use crate::{Error, Result};

/// Default deadline for a single expected reply byte.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for commands that cover whole memories (program/verify steps).
pub(crate) const LONG_TIMEOUT: Duration = Duration::from_secs(20);

/// Leaving the jump table can stall behind a slow command handler.
const COMMAND_END_TIMEOUT: Duration = Duration::from_secs(10);

/// The DTR probe gets its answer quickly or not at all.
const RESET_REPLY_TIMEOUT: Duration = Duration::from_millis(300);

/// A protocol probe against the wrong firmware answers with the wrong
/// command, so don't wait long for the tag.
const PROTOCOL_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Jump-table opcode numbering for one firmware revision.
///
/// Opcodes 1-13 are common to both revisions; the command families from
/// erase onwards shifted by one between P018 and P18A.
#[derive(Debug)]
pub struct CommandSet {
    pub init_vars: u8,
    pub vpp_on: u8,
    pub vpp_off: u8,
    pub cycle_vpp: u8,
    pub program_rom: u8,
    pub program_eeprom: u8,
    pub program_id_fuses: u8,
    pub program_calibration: u8,
    pub read_rom: u8,
    pub read_eeprom: u8,
    pub read_config: u8,
    pub erase_chip: u8,
    pub rom_is_blank: u8,
    pub eeprom_is_blank: u8,
    pub commit_18f_fuses: u8,
    pub wait_chip_in: u8,
    pub wait_chip_out: u8,
    pub version: u8,
    pub protocol: u8,
    pub program_debug_vector: u8,
    pub read_debug_vector: u8,
}

pub(crate) const P018_COMMANDS: CommandSet = CommandSet {
    init_vars: 3,
    vpp_on: 4,
    vpp_off: 5,
    cycle_vpp: 6,
    program_rom: 7,
    program_eeprom: 8,
    program_id_fuses: 9,
    program_calibration: 10,
    read_rom: 11,
    read_eeprom: 12,
    read_config: 13,
    erase_chip: 15,
    rom_is_blank: 16,
    eeprom_is_blank: 17,
    commit_18f_fuses: 18,
    wait_chip_in: 19,
    wait_chip_out: 20,
    version: 21,
    protocol: 22,
    program_debug_vector: 23,
    read_debug_vector: 24,
};

pub(crate) const P18A_COMMANDS: CommandSet = CommandSet {
    init_vars: 3,
    vpp_on: 4,
    vpp_off: 5,
    cycle_vpp: 6,
    program_rom: 7,
    program_eeprom: 8,
    program_id_fuses: 9,
    program_calibration: 10,
    read_rom: 11,
    read_eeprom: 12,
    read_config: 13,
    erase_chip: 14,
    rom_is_blank: 15,
    eeprom_is_blank: 16,
    commit_18f_fuses: 17,
    wait_chip_in: 18,
    wait_chip_out: 19,
    version: 20,
    protocol: 21,
    program_debug_vector: 22,
    read_debug_vector: 23,
};

/// The firmware protocol revision, as reported by the protocol query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    P018,
    P18A,
}

impl Protocol {
    fn from_tag(tag: &[u8]) -> Option<Protocol> {
        match tag {
            b"P018" => Some(Protocol::P018),
            b"P18A" => Some(Protocol::P18A),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Protocol::P018 => "P018",
            Protocol::P18A => "P18A",
        }
    }

    pub fn commands(self) -> &'static CommandSet {
        match self {
            Protocol::P018 => &P018_COMMANDS,
            Protocol::P18A => &P18A_COMMANDS,
        }
    }
}

/// The programmer model names reported by the version query.
pub fn programmer_model_name(version: u8) -> Option<&'static str> {
    match version {
        0 => Some("K128"),
        1 => Some("K149-A"),
        2 => Some("K149-B"),
        3 => Some("K150"),
        _ => None,
    }
}

/// An open session with a programmer.
///
/// The connection must stay open for the whole pipeline: DTR transitions
/// reset the device, so the port is configured once and never touched
/// again.
#[derive(Debug)]
pub struct Connection<L: Link> {
    pub(crate) link: L,
    protocol: Protocol,
    firmware_version: Option<u8>,
}

impl<L: Link> Connection<L> {
    /// Resets the programmer over `link` and reads its protocol tag.
    pub fn open(link: L) -> Result<Connection<L>> {
        let mut connection = Connection {
            link,
            protocol: Protocol::P18A,
            firmware_version: None,
        };
        connection.reset()?;
        connection.protocol = connection.detect_protocol()?;
        info!("programmer speaks {}", connection.protocol.tag());
        Ok(connection)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn commands(&self) -> &'static CommandSet {
        self.protocol.commands()
    }

    /// The firmware version tag from the DTR probe, if the unit sent one.
    pub fn firmware_version(&self) -> Option<u8> {
        self.firmware_version
    }

    /// Resets the on-board controller with a DTR probe.
    ///
    /// Some units run with DTR high and some with DTR low, so both
    /// polarities are tried. A healthy unit announces itself with `B`
    /// followed by its firmware version tag.
    pub fn reset(&mut self) -> Result<()> {
        self.link.set_dtr(true)?;
        self.link.settle();
        self.link.flush_input()?;
        self.link.set_dtr(false)?;
        self.link.settle();
        let mut response = self.read_bytes(2, Some(RESET_REPLY_TIMEOUT))?;
        if response.is_empty() {
            // Apparently the unit operates with DTR high.
            self.link.set_dtr(true)?;
            self.link.settle();
            response = self.read_bytes(2, Some(RESET_REPLY_TIMEOUT))?;
        }
        if response.first() != Some(&b'B') {
            return Err(Error::response(format!(
                "programmer did not announce itself, got {:?}",
                HexSlice(&response)
            )));
        }
        self.firmware_version = response.get(1).copied();
        debug!("programmer reset, version tag {:?}", self.firmware_version);
        Ok(())
    }

    /// Reads up to `count` bytes, polling until the deadline passes.
    /// Returns short on timeout; `None` waits forever.
    pub(crate) fn read_bytes(
        &mut self,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut result = Vec::with_capacity(count);
        let mut buf = [0u8; 256];
        while result.len() < count {
            let want = (count - result.len()).min(buf.len());
            let received = self.link.recv(&mut buf[..want])?;
            result.extend_from_slice(&buf[..received]);
            if received == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Fails unless the device answers exactly `expected` before `timeout`.
    pub(crate) fn expect(&mut self, expected: &[u8], timeout: Option<Duration>) -> Result<()> {
        let response = self.read_bytes(expected.len(), timeout)?;
        if response != expected {
            return Err(Error::response(format!(
                "expected {:?}, received {:?}",
                HexSlice(expected),
                HexSlice(&response)
            )));
        }
        Ok(())
    }

    /// Enters the jump table and sends `command`, if one is given.
    ///
    /// The leading `0x01` is a harmless resync when the device is idle and
    /// exits the jump table when it is not.
    pub(crate) fn command_start(&mut self, command: Option<u8>) -> Result<()> {
        self.link.send(&[0x01])?;
        self.expect(b"Q", Some(DEFAULT_TIMEOUT))?;
        self.link.send(b"P")?;
        let ack = self.read_bytes(1, Some(DEFAULT_TIMEOUT))?;
        if ack.as_slice() != b"P" {
            return Err(Error::response("no acknowledgement for command start"));
        }
        if let Some(command) = command {
            self.link.send(&[command])?;
        }
        Ok(())
    }

    /// Leaves the jump table.
    pub(crate) fn command_end(&mut self) -> Result<()> {
        self.link.send(&[0x01])?;
        let ack = self.read_bytes(1, Some(COMMAND_END_TIMEOUT))?;
        match ack.as_slice() {
            b"Q" => Ok(()),
            b"" => Err(Error::response("no acknowledgement for command end")),
            other => Err(Error::response(format!(
                "unexpected response {:?} in command end",
                HexSlice(other)
            ))),
        }
    }

    fn detect_protocol(&mut self) -> Result<Protocol> {
        // The protocol query's own opcode moved between revisions. Probe
        // with each numbering; against the wrong firmware the opcode runs
        // some other query, whose answer is dropped before resyncing.
        for &opcode in &[P18A_COMMANDS.protocol, P018_COMMANDS.protocol] {
            self.command_start(Some(opcode))?;
            let tag = self.read_bytes(4, Some(PROTOCOL_PROBE_TIMEOUT))?;
            if let Some(protocol) = Protocol::from_tag(&tag) {
                self.command_end()?;
                return Ok(protocol);
            }
            self.link.flush_input()?;
            self.command_end()?;
        }
        Err(Error::response("programmer protocol tag not recognized"))
    }

    /// Asks the programmer to echo `message` back byte by byte.
    ///
    /// A healthy programmer returns the message unchanged; anything else
    /// means the link or the unit is sick.
    pub fn echo(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.command_start(None)?;
        let mut result = Vec::with_capacity(message.len());
        for &byte in message {
            self.link.send(&[0x02, byte])?;
            result.extend_from_slice(&self.read_bytes(1, Some(DEFAULT_TIMEOUT))?);
        }
        self.command_end()?;
        Ok(result)
    }

    /// The programmer's numeric model version (see
    /// [`programmer_model_name`]).
    pub fn programmer_version(&mut self) -> Result<u8> {
        self.command_start(Some(self.commands().version))?;
        let response = self.read_bytes(1, Some(DEFAULT_TIMEOUT))?;
        self.command_end()?;
        response
            .first()
            .copied()
            .ok_or_else(|| Error::response("no version byte from programmer"))
    }

    /// The 4-byte protocol tag, as text.
    pub fn programmer_protocol(&mut self) -> Result<String> {
        self.command_start(Some(self.commands().protocol))?;
        let response = self.read_bytes(4, Some(DEFAULT_TIMEOUT))?;
        self.command_end()?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Blocks until a chip is inserted in the programming socket.
    pub fn wait_until_chip_in_socket(&mut self) -> Result<()> {
        self.command_start(Some(self.commands().wait_chip_in))?;
        self.expect(b"A", Some(DEFAULT_TIMEOUT))?;
        // The user may take arbitrarily long to seat the chip.
        self.expect(b"Y", None)?;
        self.command_end()
    }

    /// Blocks until the chip is removed from the programming socket.
    pub fn wait_until_chip_out_of_socket(&mut self) -> Result<()> {
        self.command_start(Some(self.commands().wait_chip_out))?;
        self.expect(b"A", Some(DEFAULT_TIMEOUT))?;
        self.expect(b"Y", None)?;
        self.command_end()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockProgrammer;
    use super::*;

    #[test]
    fn open_resets_and_detects_the_protocol() {
        let connection = Connection::open(MockProgrammer::new()).unwrap();
        assert_eq!(connection.protocol(), Protocol::P18A);
        assert_eq!(connection.firmware_version(), Some(b'3'));
    }

    #[test]
    fn echo_returns_the_message() {
        let mut connection = Connection::open(MockProgrammer::new()).unwrap();
        assert_eq!(connection.echo(b"Hello").unwrap(), b"Hello");
    }

    #[test]
    fn version_and_protocol_queries_round_trip() {
        let mut connection = Connection::open(MockProgrammer::new()).unwrap();
        assert_eq!(connection.programmer_version().unwrap(), 3);
        assert_eq!(programmer_model_name(3), Some("K150"));
        assert_eq!(connection.programmer_protocol().unwrap(), "P18A");
    }

    #[test]
    fn socket_waits_acknowledge_then_block_for_the_chip() {
        let mut connection = Connection::open(MockProgrammer::new()).unwrap();
        connection.wait_until_chip_in_socket().unwrap();
        connection.wait_until_chip_out_of_socket().unwrap();
    }

    #[test]
    fn command_sets_follow_the_firmware_revision() {
        assert_eq!(P018_COMMANDS.erase_chip, 15);
        assert_eq!(P018_COMMANDS.commit_18f_fuses, 18);
        assert_eq!(P018_COMMANDS.read_debug_vector, 24);
        assert_eq!(P18A_COMMANDS.erase_chip, 14);
        assert_eq!(P18A_COMMANDS.commit_18f_fuses, 17);
        assert_eq!(P18A_COMMANDS.read_debug_vector, 23);
        // The common prefix is shared.
        assert_eq!(P018_COMMANDS.read_config, P18A_COMMANDS.read_config);
    }
}
