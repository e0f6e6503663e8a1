//! The chip-info database: per-chip programming parameters and the fuse
//! codec.
//!
//! Chip data lives in a line-oriented `.cid` file, one blank-line-separated
//! entry per chip. `KEY = value` lines set entry fields and
//! `LISTnn FUSEd "Name" "Setting"=hex[&hex…]…` lines declare the symbolic
//! fuse settings together with the AND-masks they apply to the chip's fuse
//! words.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use bitflags::bitflags;
use log::warn;
use serde::Serialize;

use crate::utils::indexwise_and;
use crate::{Error, Result};

/// The PIC instruction-set family, as named in the chip database.
///
/// The numeric codes are the values the programmer firmware expects in the
/// init-programming-vars payload. `NewF12B` has no documented code; chips
/// carrying it can be inspected but not programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoreType {
    #[serde(rename = "bit16_a")]
    Bit16A,
    #[serde(rename = "bit16_b")]
    Bit16B,
    #[serde(rename = "bit16_c")]
    Bit16C,
    #[serde(rename = "bit14_a")]
    Bit14A,
    #[serde(rename = "bit14_b")]
    Bit14B,
    #[serde(rename = "bit14_c")]
    Bit14C,
    #[serde(rename = "bit14_d")]
    Bit14D,
    #[serde(rename = "bit14_e")]
    Bit14E,
    #[serde(rename = "bit14_f")]
    Bit14F,
    #[serde(rename = "bit14_g")]
    Bit14G,
    #[serde(rename = "bit14_h")]
    Bit14H,
    #[serde(rename = "bit12_a")]
    Bit12A,
    #[serde(rename = "bit12_b")]
    Bit12B,
    #[serde(rename = "newf12b")]
    NewF12B,
}

impl CoreType {
    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "bit16_a" => CoreType::Bit16A,
            "bit16_b" => CoreType::Bit16B,
            "bit16_c" => CoreType::Bit16C,
            "bit14_a" => CoreType::Bit14A,
            "bit14_b" => CoreType::Bit14B,
            "bit14_c" => CoreType::Bit14C,
            "bit14_d" => CoreType::Bit14D,
            "bit14_e" => CoreType::Bit14E,
            "bit14_f" => CoreType::Bit14F,
            "bit14_g" => CoreType::Bit14G,
            "bit14_h" => CoreType::Bit14H,
            "bit12_a" => CoreType::Bit12A,
            "bit12_b" => CoreType::Bit12B,
            "newf12b" => CoreType::NewF12B,
            _ => return None,
        })
    }

    pub fn keyword(self) -> &'static str {
        match self {
            CoreType::Bit16A => "bit16_a",
            CoreType::Bit16B => "bit16_b",
            CoreType::Bit16C => "bit16_c",
            CoreType::Bit14A => "bit14_a",
            CoreType::Bit14B => "bit14_b",
            CoreType::Bit14C => "bit14_c",
            CoreType::Bit14D => "bit14_d",
            CoreType::Bit14E => "bit14_e",
            CoreType::Bit14F => "bit14_f",
            CoreType::Bit14G => "bit14_g",
            CoreType::Bit14H => "bit14_h",
            CoreType::Bit12A => "bit12_a",
            CoreType::Bit12B => "bit12_b",
            CoreType::NewF12B => "newf12b",
        }
    }

    /// The firmware code for this core family, if it has one.
    pub fn code(self) -> Option<u8> {
        Some(match self {
            CoreType::Bit16A => 1,
            CoreType::Bit16B => 2,
            CoreType::Bit14G => 3,
            CoreType::Bit12A => 4,
            CoreType::Bit14A => 5,
            CoreType::Bit14B => 6,
            CoreType::Bit14C => 7,
            CoreType::Bit14D => 8,
            CoreType::Bit14E => 9,
            CoreType::Bit14F => 10,
            CoreType::Bit12B => 11,
            CoreType::Bit14H => 12,
            CoreType::Bit16C => 13,
            CoreType::NewF12B => return None,
        })
    }

    /// Instruction width in bits. Determines memory layout, ID size and the
    /// fuse-commit protocol.
    pub fn bits(self) -> u8 {
        match self {
            CoreType::Bit16A | CoreType::Bit16B | CoreType::Bit16C => 16,
            CoreType::Bit12A | CoreType::Bit12B | CoreType::NewF12B => 12,
            _ => 14,
        }
    }
}

/// How Vcc and Vpp are sequenced when the chip is powered for programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerSequence {
    Vcc,
    VccVpp1,
    VccVpp2,
    Vpp1Vcc,
    Vpp2Vcc,
    VccFastVpp1,
    VccFastVpp2,
}

impl PowerSequence {
    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "Vcc" => PowerSequence::Vcc,
            "VccVpp1" => PowerSequence::VccVpp1,
            "VccVpp2" => PowerSequence::VccVpp2,
            "Vpp1Vcc" => PowerSequence::Vpp1Vcc,
            "Vpp2Vcc" => PowerSequence::Vpp2Vcc,
            "VccFastVpp1" => PowerSequence::VccFastVpp1,
            "VccFastVpp2" => PowerSequence::VccFastVpp2,
            _ => return None,
        })
    }

    /// The firmware code for this sequence. The fast variants share codes
    /// with their plain counterparts and are distinguished by the
    /// Vcc/Vpp-delay flag instead.
    pub fn code(self) -> u8 {
        match self {
            PowerSequence::Vcc => 0,
            PowerSequence::VccVpp1 | PowerSequence::VccFastVpp1 => 1,
            PowerSequence::VccVpp2 | PowerSequence::VccFastVpp2 => 2,
            PowerSequence::Vpp1Vcc => 3,
            PowerSequence::Vpp2Vcc => 4,
        }
    }

    pub fn vcc_vpp_delay(self) -> bool {
        matches!(
            self,
            PowerSequence::VccFastVpp1 | PowerSequence::VccFastVpp2
        )
    }
}

/// The programmer socket a chip family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocketImage {
    #[serde(rename = "8pin")]
    Pin8,
    #[serde(rename = "14pin")]
    Pin14,
    #[serde(rename = "18pin")]
    Pin18,
    #[serde(rename = "28Npin")]
    Pin28N,
    #[serde(rename = "40pin")]
    Pin40,
    #[serde(rename = "0pin")]
    Pin0,
}

impl SocketImage {
    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "8pin" => SocketImage::Pin8,
            "14pin" => SocketImage::Pin14,
            "18pin" => SocketImage::Pin18,
            "28Npin" => SocketImage::Pin28N,
            "40pin" => SocketImage::Pin40,
            "0pin" => SocketImage::Pin0,
            _ => return None,
        })
    }

    /// Where pin 1 goes in the ZIF socket, or `None` for parts that are only
    /// programmed through an ICSP header.
    pub fn pin1_location(self) -> Option<&'static str> {
        match self {
            SocketImage::Pin8 | SocketImage::Pin14 => Some("socket pin 13"),
            SocketImage::Pin18 => Some("socket pin 2"),
            SocketImage::Pin28N | SocketImage::Pin40 => Some("socket pin 1"),
            SocketImage::Pin0 => None,
        }
    }
}

/// One selectable value of a fuse: a name and the `(word index, AND-mask)`
/// pairs it applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuseSetting {
    pub name: String,
    pub masks: Vec<(usize, u16)>,
}

/// A named fuse and its settings, in database order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fuse {
    pub name: String,
    pub settings: Vec<FuseSetting>,
}

bitflags! {
    /// Flag byte of the init-programming-vars payload.
    pub struct VarFlags: u8 {
        /// The chip stores its calibration value in the last ROM word.
        const CALIBRATION_IN_ROM = 1 << 0;
        /// The chip has a band-gap fuse that must be preserved.
        const BAND_GAP_FUSE = 1 << 1;
        /// 18F single-panel access mode, used by `bit16_a` cores only.
        const SINGLE_PANEL_18F = 1 << 2;
        /// Delay between Vcc and Vpp, for the fast power sequences.
        const VCC_VPP_DELAY = 1 << 3;
    }
}

/// The argument block of the init-programming-vars command, derived once
/// per session from a [`ChipInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammingVars {
    pub rom_size: u16,
    pub eeprom_size: u16,
    pub core_type: u8,
    pub flags: VarFlags,
    pub program_delay: u8,
    pub power_sequence: u8,
    pub erase_mode: u8,
    pub program_retries: u8,
    pub over_program: u8,
}

impl ProgrammingVars {
    /// In-circuit programming uses the Vpp1 rail regardless of which rail
    /// the socket would use.
    pub fn for_icsp(mut self) -> Self {
        self.power_sequence = match self.power_sequence {
            2 => 1,
            4 => 3,
            other => other,
        };
        self
    }

    /// Packs the block the way the firmware wants it: two big-endian words
    /// followed by seven single bytes.
    pub fn to_bytes(&self) -> [u8; 11] {
        let rom = self.rom_size.to_be_bytes();
        let eeprom = self.eeprom_size.to_be_bytes();
        [
            rom[0],
            rom[1],
            eeprom[0],
            eeprom[1],
            self.core_type,
            self.flags.bits(),
            self.program_delay,
            self.power_sequence,
            self.erase_mode,
            self.program_retries,
            self.over_program,
        ]
    }
}

/// Everything the driver knows about one chip model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChipInfo {
    pub chip_name: String,
    pub include: bool,
    pub socket_image: SocketImage,
    pub erase_mode: u8,
    pub flash_chip: bool,
    pub power_sequence: PowerSequence,
    pub program_delay: u8,
    pub program_tries: u8,
    pub over_program: u8,
    pub core_type: CoreType,
    /// ROM size in words.
    pub rom_size: u32,
    /// EEPROM size in bytes.
    pub eeprom_size: u32,
    /// The all-erased state of the chip's fuse words.
    pub fuse_blank: Vec<u16>,
    pub cp_warn: bool,
    pub cal_word: bool,
    pub band_gap: bool,
    pub icsp_only: bool,
    pub chip_id: u16,
    pub fuses: Vec<Fuse>,
}

impl ChipInfo {
    pub fn core_bits(&self) -> u8 {
        self.core_type.bits()
    }

    pub fn has_eeprom(&self) -> bool {
        self.eeprom_size != 0
    }

    /// Builds the init-programming-vars block for this chip.
    ///
    /// Fails for `newf12b` cores, which have no firmware core code.
    pub fn programming_vars(&self) -> Result<ProgrammingVars> {
        let core_type = self.core_type.code().ok_or_else(|| {
            Error::value(format!(
                "chip \"{}\" uses the \"{}\" core, which has no firmware core code",
                self.chip_name,
                self.core_type.keyword()
            ))
        })?;

        let mut flags = VarFlags::empty();
        flags.set(VarFlags::CALIBRATION_IN_ROM, self.cal_word);
        flags.set(VarFlags::BAND_GAP_FUSE, self.band_gap);
        flags.set(
            VarFlags::SINGLE_PANEL_18F,
            self.core_type == CoreType::Bit16A,
        );
        flags.set(
            VarFlags::VCC_VPP_DELAY,
            self.power_sequence.vcc_vpp_delay(),
        );

        Ok(ProgrammingVars {
            rom_size: self.rom_size as u16,
            eeprom_size: self.eeprom_size as u16,
            core_type,
            flags,
            program_delay: self.program_delay,
            power_sequence: self.power_sequence.code(),
            erase_mode: self.erase_mode,
            program_retries: self.program_tries,
            over_program: self.over_program,
        })
    }

    /// Turns raw fuse words into the symbolic `(fuse, setting)` pairs they
    /// represent, in database order.
    ///
    /// For each fuse, every declared setting whose AND-mask leaves `words`
    /// unchanged is compatible; among those, the one that clears the most
    /// bits wins, later declarations breaking ties. A fuse with no
    /// compatible setting fails the decode.
    pub fn decode_fuse_data(&self, words: &[u16]) -> Result<Vec<(String, String)>> {
        let mut result = Vec::new();
        for fuse in &self.fuses {
            let mut best = vec![0xffffu16; words.len()];
            let mut identified: Option<&str> = None;
            for setting in &fuse.settings {
                if let Some(&(index, _)) =
                    setting.masks.iter().find(|(index, _)| *index >= words.len())
                {
                    return Err(Error::Fuse(format!(
                        "fuse \"{}\" references word {} but only {} were supplied",
                        fuse.name,
                        index + 1,
                        words.len()
                    )));
                }
                if indexwise_and(words, &setting.masks) != words {
                    continue;
                }
                let narrowed = indexwise_and(&best, &setting.masks);
                if narrowed != best {
                    best = narrowed;
                    identified = Some(&setting.name);
                }
            }
            match identified {
                Some(name) => result.push((fuse.name.clone(), name.to_string())),
                None => {
                    return Err(Error::Fuse(format!(
                        "could not identify a setting for fuse \"{}\"",
                        fuse.name
                    )))
                }
            }
        }
        Ok(result)
    }

    /// Turns symbolic `(fuse, setting)` pairs into raw fuse words, starting
    /// from the blank state.
    pub fn encode_fuse_data(&self, settings: &[(String, String)]) -> Result<Vec<u16>> {
        let mut result = self.fuse_blank.clone();
        for (fuse_name, value) in settings {
            let fuse = self
                .fuses
                .iter()
                .find(|fuse| fuse.name == *fuse_name)
                .ok_or_else(|| Error::Fuse(format!("unknown fuse \"{}\"", fuse_name)))?;
            let setting = fuse
                .settings
                .iter()
                .find(|setting| setting.name == *value)
                .ok_or_else(|| {
                    Error::Fuse(format!(
                        "invalid fuse setting: \"{}\" = \"{}\"",
                        fuse_name, value
                    ))
                })?;
            result = indexwise_and(&result, &setting.masks);
        }
        Ok(result)
    }

    /// A human-readable list of the chip's fuses and their settings, shown
    /// when a requested fuse override does not apply.
    pub fn fuse_doc(&self) -> String {
        let mut result = String::new();
        for fuse in &self.fuses {
            result.push_str(&format!("'{}' : (", fuse.name));
            for (i, setting) in fuse.settings.iter().enumerate() {
                if i != 0 {
                    result.push_str(", ");
                }
                result.push_str(&format!("'{}'", setting.name));
            }
            result.push_str(")\n");
        }
        result
    }
}

/// The parsed chip database, keyed by lowercase chip name.
#[derive(Debug, Clone)]
pub struct ChipDb {
    entries: HashMap<String, ChipInfo>,
}

impl ChipDb {
    /// Reads and parses the database at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parses chip entries from `text`.
    ///
    /// A malformed line fails its whole entry: the entry is dropped with a
    /// warning and parsing resumes at the next blank line. This keeps one
    /// bad vendor record from hiding the rest of the database.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        let mut block: Option<EntryBuilder> = None;
        let mut skipping = false;

        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            let line_number = index + 1;

            if line.is_empty() {
                skipping = false;
                if let Some(builder) = block.take() {
                    Self::close_block(&mut entries, builder, line_number);
                }
                continue;
            }
            if skipping {
                continue;
            }

            if line.starts_with("CHIPname") {
                if let Some(builder) = block.take() {
                    Self::close_block(&mut entries, builder, line_number);
                }
                block = Some(EntryBuilder::default());
            }

            let builder = match block.as_mut() {
                Some(builder) => builder,
                None => {
                    warn!(
                        "line {}: assignment outside of a chip entry, skipping block",
                        line_number
                    );
                    skipping = true;
                    continue;
                }
            };

            if let Err(err) = builder.parse_line(line) {
                warn!("line {}: {}, dropping chip entry", line_number, err);
                block = None;
                skipping = true;
            }
        }
        if let Some(builder) = block.take() {
            let last_line = text.lines().count();
            Self::close_block(&mut entries, builder, last_line);
        }

        ChipDb { entries }
    }

    fn close_block(
        entries: &mut HashMap<String, ChipInfo>,
        builder: EntryBuilder,
        line_number: usize,
    ) {
        match builder.finish() {
            Ok(info) => {
                entries.insert(info.chip_name.clone(), info);
            }
            Err(err) => warn!("chip entry ending at line {}: {}", line_number, err),
        }
    }

    /// Case-insensitive lookup by chip name.
    pub fn get(&self, name: &str) -> Result<&ChipInfo> {
        self.entries.get(&name.to_lowercase()).ok_or_else(|| {
            Error::value(format!("unknown chip type \"{}\"", name))
        })
    }

    pub fn chips(&self) -> impl Iterator<Item = &ChipInfo> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects one entry's `KEY = value` and fuse-list lines until the entry
/// is complete.
#[derive(Debug, Default)]
struct EntryBuilder {
    chip_name: Option<String>,
    include: Option<bool>,
    socket_image: Option<SocketImage>,
    erase_mode: Option<u8>,
    flash_chip: Option<bool>,
    power_sequence: Option<PowerSequence>,
    program_delay: Option<u8>,
    program_tries: Option<u8>,
    over_program: Option<u8>,
    core_type: Option<CoreType>,
    rom_size: Option<u32>,
    eeprom_size: Option<u32>,
    fuse_blank: Option<Vec<u16>>,
    cp_warn: Option<bool>,
    cal_word: Option<bool>,
    band_gap: Option<bool>,
    icsp_only: Option<bool>,
    chip_id: Option<u16>,
    fuses: Vec<Fuse>,
}

impl EntryBuilder {
    fn parse_line(&mut self, line: &str) -> Result<()> {
        if line.starts_with("LIST") {
            let fuse = parse_fuse_list(line)?;
            self.fuses.push(fuse);
            return Ok(());
        }

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => {
                return Err(Error::Format(format!(
                    "unrecognized line format \"{}\"",
                    line
                )))
            }
        };

        match key {
            "CHIPname" => self.chip_name = Some(value.to_lowercase()),
            "INCLUDE" => self.include = Some(parse_bool(key, value)?),
            "SocketImage" | "KITSRUS.COM" => {
                self.socket_image = Some(SocketImage::from_keyword(value).ok_or_else(|| {
                    Error::Format(format!("unknown socket image \"{}\"", value))
                })?)
            }
            "PowerSequence" => {
                self.power_sequence =
                    Some(PowerSequence::from_keyword(value).ok_or_else(|| {
                        Error::Format(format!("unknown power sequence \"{}\"", value))
                    })?)
            }
            "CoreType" => {
                self.core_type =
                    Some(CoreType::from_keyword(&value.to_lowercase()).ok_or_else(|| {
                        Error::Format(format!("unknown core type \"{}\"", value))
                    })?)
            }
            "CALword" => self.cal_word = Some(parse_bool(key, value)?),
            "ChipID" => self.chip_id = Some(parse_hex(key, value)? as u16),
            "CPwarn" => self.cp_warn = Some(parse_bool(key, value)?),
            "EEPROMsize" => self.eeprom_size = Some(parse_hex(key, value)?),
            "EraseMode" => self.erase_mode = Some(parse_int(key, value)?),
            "FlashChip" => self.flash_chip = Some(parse_bool(key, value)?),
            "FUSEblank" => self.fuse_blank = Some(parse_word_list(value)?),
            "ICSPonly" => self.icsp_only = Some(parse_bool(key, value)?),
            "OverProgram" => self.over_program = Some(parse_int(key, value)?),
            "ProgramDelay" => self.program_delay = Some(parse_int(key, value)?),
            "ProgramTries" => self.program_tries = Some(parse_int(key, value)?),
            "ROMsize" => self.rom_size = Some(parse_hex(key, value)?),
            "BandGap" => self.band_gap = Some(parse_bool(key, value)?),
            // Present in newer database revisions; meaning undocumented.
            "ProgramFlag2" | "PanelSizing" => {}
            _ => {
                return Err(Error::Format(format!("unrecognized key \"{}\"", key)));
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<ChipInfo> {
        Ok(ChipInfo {
            chip_name: require(self.chip_name, "CHIPname")?,
            include: require(self.include, "INCLUDE")?,
            socket_image: require(self.socket_image, "SocketImage")?,
            erase_mode: require(self.erase_mode, "EraseMode")?,
            flash_chip: require(self.flash_chip, "FlashChip")?,
            power_sequence: require(self.power_sequence, "PowerSequence")?,
            program_delay: require(self.program_delay, "ProgramDelay")?,
            // Absent from newer database revisions.
            program_tries: self.program_tries.unwrap_or(1),
            over_program: self.over_program.unwrap_or(0),
            core_type: require(self.core_type, "CoreType")?,
            rom_size: require(self.rom_size, "ROMsize")?,
            eeprom_size: require(self.eeprom_size, "EEPROMsize")?,
            fuse_blank: require(self.fuse_blank, "FUSEblank")?,
            cp_warn: require(self.cp_warn, "CPwarn")?,
            cal_word: require(self.cal_word, "CALword")?,
            band_gap: require(self.band_gap, "BandGap")?,
            icsp_only: require(self.icsp_only, "ICSPonly")?,
            chip_id: require(self.chip_id, "ChipID")?,
            fuses: self.fuses,
        })
    }
}

fn require<T>(field: Option<T>, key: &str) -> Result<T> {
    field.ok_or_else(|| Error::Format(format!("missing \"{}\"", key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "y" | "1" => Ok(true),
        "n" | "0" => Ok(false),
        _ => Err(Error::Format(format!(
            "\"{}\" is not a boolean value for \"{}\"",
            value, key
        ))),
    }
}

fn parse_hex(key: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| Error::Format(format!("\"{}\" is not a hex value for \"{}\"", value, key)))
}

fn parse_int(key: &str, value: &str) -> Result<u8> {
    value
        .parse()
        .map_err(|_| Error::Format(format!("\"{}\" is not an integer for \"{}\"", value, key)))
}

fn parse_word_list(value: &str) -> Result<Vec<u16>> {
    value
        .split_whitespace()
        .map(|word| {
            u16::from_str_radix(word, 16)
                .map_err(|_| Error::Format(format!("bad FUSEblank word \"{}\"", word)))
        })
        .collect()
}

/// Parses one `LISTnn FUSEd "Name" "Setting"=hex[&hex…]…` line.
///
/// The `d` in `FUSEd` is the 1-based index of the first fuse word the
/// settings apply to; `&`-joined values spread over consecutive words.
fn parse_fuse_list(line: &str) -> Result<Fuse> {
    let bad = |what: &str| Error::Format(format!("{} in fuse list \"{}\"", what, line));

    let rest = line.strip_prefix("LIST").ok_or_else(|| bad("missing LIST"))?;
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit()).trim_start();
    let rest = rest
        .strip_prefix("FUSE")
        .ok_or_else(|| bad("missing FUSE marker"))?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let first_index: usize = digits.parse().map_err(|_| bad("missing fuse number"))?;
    if first_index == 0 {
        return Err(bad("fuse numbers are 1-based"));
    }
    let (name, mut rest) = take_quoted(&rest[digits.len()..]).ok_or_else(|| bad("missing fuse name"))?;

    let mut settings = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let (setting_name, after_name) =
            take_quoted(rest).ok_or_else(|| bad("missing setting name"))?;
        let after_name = after_name.trim_start();
        let after_eq = after_name
            .strip_prefix('=')
            .ok_or_else(|| bad("missing '='"))?
            .trim_start();
        let value_len = after_eq
            .find(char::is_whitespace)
            .unwrap_or(after_eq.len());
        let (values, tail) = after_eq.split_at(value_len);

        let mut masks = Vec::new();
        for (offset, value) in values.split('&').enumerate() {
            let mask = u16::from_str_radix(value, 16)
                .map_err(|_| bad("bad setting value"))?;
            masks.push((first_index - 1 + offset, mask));
        }
        settings.push(FuseSetting {
            name: setting_name.to_string(),
            masks,
        });
        rest = tail;
    }
    if settings.is_empty() {
        return Err(bad("no settings"));
    }

    Ok(Fuse {
        name: name.to_string(),
        settings,
    })
}

/// Returns the contents of a leading double-quoted string and the text
/// following the closing quote.
fn take_quoted(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((&rest[..end], &rest[end + 1..]))
}

#[cfg(test)]
pub(crate) const SAMPLE_CHIP_DATA: &str = r#"CHIPname=12F675
INCLUDE=Y
SocketImage=8pin
EraseMode=1
FlashChip=Y
PowerSequence=Vpp1Vcc
ProgramDelay=10
ProgramTries=1
OverProgram=0
CoreType=bit14_b
ROMsize=0400
EEPROMsize=0080
FUSEblank=31FF
CPwarn=N
CALword=Y
BandGap=Y
ICSPonly=N
ChipID=0FC0
LIST2 FUSE1 "WDT" "Enabled"=3FFF "Disabled"=3FF7
LIST2 FUSE1 "PWRTE" "Disabled"=3FFF "Enabled"=3FEF
LIST2 FUSE1 "MCLRE" "Enabled"=3FFF "Disabled"=3FDF
LIST2 FUSE1 "BODEN" "Enabled"=3FFF "Disabled"=3FBF
LIST2 FUSE1 "Code Protect ROM" "Disabled"=3FFF "Enabled"=3F7F
LIST2 FUSE1 "Code Protect EEP" "Disabled"=3FFF "Enabled"=3EFF
LIST4 FUSE1 "Bandgap" "Highest"=3FFF "Mid High"=2FFF "Mid Low"=1FFF "Lowest"=0FFF
LIST8 FUSE1 "Oscillator" "RC CLKGP4 RCGP5"=3FFF "RC IOGP4 RCGP5"=3FFE "INTOSC CLKGP4 IOGP5"=3FFD "INTOSC IOGP4 IOGP5"=3FFC "EC IOGP4 CLKINGP5"=3FFB "HS"=3FFA "XT"=3FF9 "LP"=3FF8

CHIPname=16F737
INCLUDE=Y
SocketImage=28Npin
EraseMode=3
FlashChip=Y
PowerSequence=VccFastVpp1
ProgramDelay=10
CoreType=bit14_c
ROMsize=1000
EEPROMsize=0000
FUSEblank=3FFF 3FFF
CPwarn=N
CALword=N
BandGap=N
ICSPonly=N
ChipID=0BA0
LIST2 FUSE1 "WDT" "Enabled"=3FFF "Disabled"=3FFB
LIST4 FUSE1 "BOREN" "Enabled"=3FFF&3FFF "Sleep OFF"=3FFF&3FBF "SBOREN"=3FBF&3FFF "Disabled"=3FBF&3FBF
LIST2 FUSE2 "Clock Monitor" "Enabled"=3FFF "Disabled"=3FFE

CHIPname=18F252
INCLUDE=Y
SocketImage=28Npin
EraseMode=2
FlashChip=Y
PowerSequence=VccVpp1
ProgramDelay=1
CoreType=bit16_a
ROMsize=4000
EEPROMsize=0100
FUSEblank=FFFF FFFF FFFF FFFF FFFF FFFF FFFF
CPwarn=N
CALword=N
BandGap=N
ICSPonly=N
ChipID=0840
LIST2 FUSE2 "WDT" "Enabled"=FFFF "Disabled"=FFFE
LIST4 FUSE1 "Oscillator" "RC"=FFFF "HS"=FFFD "XT"=FFFC "LP"=FFFB

CHIPname=10F200
INCLUDE=Y
SocketImage=0pin
EraseMode=6
FlashChip=Y
PowerSequence=VccVpp1
ProgramDelay=20
CoreType=newf12b
ROMsize=0100
EEPROMsize=0000
FUSEblank=0FFF
CPwarn=N
CALword=Y
BandGap=N
ICSPonly=Y
ChipID=FFFF
LIST2 FUSE1 "WDT" "Enabled"=3FFF "Disabled"=3FFB
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> ChipDb {
        ChipDb::parse(SAMPLE_CHIP_DATA)
    }

    #[test]
    fn parses_entries_and_looks_up_case_insensitively() {
        let db = sample_db();
        assert_eq!(db.len(), 4);
        let chip = db.get("12f675").unwrap();
        assert_eq!(chip.chip_name, "12f675");
        assert_eq!(db.get("12F675").unwrap().chip_name, "12f675");
        assert!(db.get("16f88").is_err());
    }

    #[test]
    fn entry_fields_are_typed() {
        let db = sample_db();
        let chip = db.get("12F675").unwrap();
        assert_eq!(chip.socket_image, SocketImage::Pin8);
        assert_eq!(chip.power_sequence, PowerSequence::Vpp1Vcc);
        assert_eq!(chip.core_type, CoreType::Bit14B);
        assert_eq!(chip.rom_size, 0x400);
        assert_eq!(chip.eeprom_size, 0x80);
        assert_eq!(chip.fuse_blank, vec![0x31ff]);
        assert_eq!(chip.chip_id, 0x0fc0);
        assert!(chip.cal_word);
        assert!(!chip.icsp_only);
        assert!(chip.has_eeprom());
        assert_eq!(chip.core_bits(), 14);
        assert_eq!(chip.socket_image.pin1_location(), Some("socket pin 13"));
    }

    #[test]
    fn ampersand_values_spread_over_consecutive_fuses() {
        let db = sample_db();
        let chip = db.get("16f737").unwrap();
        let boren = chip.fuses.iter().find(|f| f.name == "BOREN").unwrap();
        let disabled = boren.settings.iter().find(|s| s.name == "Disabled").unwrap();
        assert_eq!(disabled.masks, vec![(0, 0x3fbf), (1, 0x3fbf)]);
        let monitor = chip.fuses.iter().find(|f| f.name == "Clock Monitor").unwrap();
        assert_eq!(monitor.settings[1].masks, vec![(1, 0x3ffe)]);
    }

    #[test]
    fn defaults_apply_for_missing_tries_and_over_program() {
        let db = sample_db();
        let chip = db.get("16f737").unwrap();
        assert_eq!(chip.program_tries, 1);
        assert_eq!(chip.over_program, 0);
    }

    #[test]
    fn malformed_lines_drop_only_their_entry() {
        let text = "CHIPname=BAD1\nBogusLine\n\nCHIPname=10F200\nINCLUDE=Y\nSocketImage=0pin\nEraseMode=6\nFlashChip=Y\nPowerSequence=VccVpp1\nProgramDelay=20\nCoreType=newf12b\nROMsize=0100\nEEPROMsize=0000\nFUSEblank=0FFF\nCPwarn=N\nCALword=Y\nBandGap=N\nICSPonly=Y\nChipID=FFFF\n";
        let db = ChipDb::parse(text);
        assert_eq!(db.len(), 1);
        assert!(db.get("10f200").is_ok());
    }

    #[test]
    fn programming_vars_pack_big_endian_with_flags() {
        let db = sample_db();
        let vars = db.get("12F675").unwrap().programming_vars().unwrap();
        assert_eq!(vars.rom_size, 0x400);
        assert_eq!(vars.core_type, 6);
        assert_eq!(vars.power_sequence, 3);
        assert_eq!(
            vars.flags,
            VarFlags::CALIBRATION_IN_ROM | VarFlags::BAND_GAP_FUSE
        );
        assert_eq!(
            vars.to_bytes(),
            [0x04, 0x00, 0x00, 0x80, 6, 0b0011, 10, 3, 1, 1, 0]
        );
    }

    #[test]
    fn fast_power_sequences_set_the_delay_flag() {
        let db = sample_db();
        let vars = db.get("16f737").unwrap().programming_vars().unwrap();
        assert_eq!(vars.power_sequence, 1);
        assert!(vars.flags.contains(VarFlags::VCC_VPP_DELAY));
    }

    #[test]
    fn icsp_remaps_the_power_sequence() {
        let vars = ProgrammingVars {
            rom_size: 64,
            eeprom_size: 0,
            core_type: 5,
            flags: VarFlags::empty(),
            program_delay: 1,
            power_sequence: 2,
            erase_mode: 1,
            program_retries: 1,
            over_program: 0,
        };
        assert_eq!(vars.for_icsp().power_sequence, 1);
        let mut vars = vars;
        vars.power_sequence = 4;
        assert_eq!(vars.for_icsp().power_sequence, 3);
        vars.power_sequence = 0;
        assert_eq!(vars.for_icsp().power_sequence, 0);
    }

    #[test]
    fn newf12b_cores_cannot_be_programmed() {
        let db = sample_db();
        let err = db.get("10F200").unwrap().programming_vars().unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }

    #[test]
    fn encode_starts_from_the_blank_words() {
        let db = sample_db();
        let chip = db.get("12F675").unwrap();
        assert_eq!(chip.encode_fuse_data(&[]).unwrap(), chip.fuse_blank);
    }

    #[test]
    fn fuse_settings_round_trip_for_12f675() {
        let db = sample_db();
        let chip = db.get("12F675").unwrap();
        let settings: Vec<(String, String)> = [
            ("WDT", "Enabled"),
            ("PWRTE", "Disabled"),
            ("MCLRE", "Enabled"),
            ("BODEN", "Enabled"),
            ("Code Protect ROM", "Disabled"),
            ("Code Protect EEP", "Disabled"),
            ("Bandgap", "Highest"),
            ("Oscillator", "RC CLKGP4 RCGP5"),
        ]
        .iter()
        .map(|(fuse, value)| (fuse.to_string(), value.to_string()))
        .collect();

        let words = chip.encode_fuse_data(&settings).unwrap();
        assert_eq!(words, vec![0x31ff]);

        let mut decoded = chip.decode_fuse_data(&words).unwrap();
        let mut expected = settings;
        decoded.sort();
        expected.sort();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn decode_prefers_the_setting_clearing_more_bits() {
        let db = sample_db();
        let chip = db.get("16f737").unwrap();
        // Word 0 has the SBOREN bit cleared; "Enabled" is also compatible
        // but clears nothing, so the narrower setting wins.
        let decoded = chip.decode_fuse_data(&[0x3fbf, 0x3fff]).unwrap();
        let boren = decoded.iter().find(|(name, _)| name == "BOREN").unwrap();
        assert_eq!(boren.1, "SBOREN");
    }

    #[test]
    fn decode_rejects_unidentifiable_words() {
        let db = sample_db();
        let chip = db.get("12F675").unwrap();
        // 0xffff has bits outside every declared mask, so nothing matches.
        assert!(matches!(
            chip.decode_fuse_data(&[0xffff]),
            Err(Error::Fuse(_))
        ));
    }

    #[test]
    fn decode_rejects_too_few_words() {
        let db = sample_db();
        let chip = db.get("16f737").unwrap();
        assert!(matches!(chip.decode_fuse_data(&[0x3fff]), Err(Error::Fuse(_))));
    }

    #[test]
    fn encode_rejects_unknown_names() {
        let db = sample_db();
        let chip = db.get("12F675").unwrap();
        let unknown_fuse = vec![("Nope".to_string(), "Enabled".to_string())];
        assert!(matches!(
            chip.encode_fuse_data(&unknown_fuse),
            Err(Error::Fuse(_))
        ));
        let unknown_setting = vec![("WDT".to_string(), "Maybe".to_string())];
        assert!(matches!(
            chip.encode_fuse_data(&unknown_setting),
            Err(Error::Fuse(_))
        ));
    }

    #[test]
    fn fuse_doc_lists_names_and_settings() {
        let db = sample_db();
        let doc = db.get("16f737").unwrap().fuse_doc();
        assert!(doc.contains("'WDT' : ('Enabled', 'Disabled')"));
        assert!(doc.contains("'BOREN' : ('Enabled', 'Sleep OFF', 'SBOREN', 'Disabled')"));
    }
}
