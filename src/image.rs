//! Builds the wire-ready memory buffers for one programming run.
//!
//! A [`FlashImage`] combines a chip's parameters with a parsed hex file and
//! optional user overrides, partitioning the file's sparse byte map into
//! ROM, EEPROM, user-ID and fuse buffers laid out the way the programmer
//! expects them.

use std::borrow::Cow;

use crate::chipinfo::ChipInfo;
use crate::hexfile::{merge_records, range_filter_records, HexFile, HexRecord};
use crate::utils::swab_bytes;
use crate::{Error, Result};

/// Byte-address layout of the hex file for one core family.
struct Regions {
    /// Upper bound of ROM data in the file; the chip may be smaller.
    rom_end: u32,
    config: (u32, u32),
    id: (u32, u32),
    fuse_base: u32,
    fuse_end: u32,
    eeprom_base: u32,
    eeprom_end: u32,
}

impl Regions {
    fn for_chip(chip: &ChipInfo) -> Regions {
        let fuse_bytes = chip.fuse_blank.len() as u32 * 2;
        match chip.core_bits() {
            16 => Regions {
                rom_end: 0x8000,
                config: (0x30_0000, 0x30_000e),
                id: (0x20_0000, 0x20_0010),
                fuse_base: 0x30_0000,
                fuse_end: 0x30_000e,
                eeprom_base: 0xf000,
                eeprom_end: 0xf100,
            },
            12 => {
                // The config span follows the ROM directly; the last words
                // of it hold the fuses.
                let config_base = chip.rom_size * 2;
                Regions {
                    rom_end: config_base,
                    config: (config_base, 0x2000),
                    id: (config_base, config_base + 8),
                    fuse_base: 0x2000 - fuse_bytes,
                    fuse_end: 0x2000,
                    eeprom_base: 0x4200,
                    eeprom_end: 0xffff,
                }
            }
            // The fuse words are the tail of the config span, so a chip
            // with more than one of them reaches below 0x400e.
            _ => Regions {
                rom_end: 0x4000,
                config: (0x4000, 0x4010),
                id: (0x4000, 0x4008),
                fuse_base: 0x4010 - fuse_bytes,
                fuse_end: 0x4010,
                eeprom_base: 0x4200,
                eeprom_end: 0xffff,
            },
        }
    }
}

/// The erased value of one ROM word for a core width.
pub fn rom_blank_word(core_bits: u8) -> u16 {
    (!(0xffffu32 << core_bits) & 0xffff) as u16
}

/// ROM, EEPROM, user-ID and fuse data ready to be sent to a chip.
#[derive(Debug, Clone)]
pub struct FlashImage {
    rom: Vec<u8>,
    eeprom: Vec<u8>,
    id: Vec<u8>,
    fuses: Vec<u16>,
    cal_word: bool,
    calibration: Option<u16>,
}

impl FlashImage {
    /// Partitions `hex` according to `chip`'s address map.
    ///
    /// `pic_id` replaces the user-ID bytes from the file; `fuse_overrides`
    /// are merged over the file's fuse words by decoding them symbolically,
    /// updating the named fuses, and re-encoding.
    pub fn build(
        chip: &ChipInfo,
        hex: &HexFile,
        pic_id: Option<&str>,
        fuse_overrides: &[(String, String)],
    ) -> Result<FlashImage> {
        let core_bits = chip.core_bits();
        let regions = Regions::for_chip(chip);
        let blank_word = rom_blank_word(core_bits);

        let mut rom_records = range_filter_records(hex.records(), 0, regions.rom_end);
        let mut config_records =
            range_filter_records(hex.records(), regions.config.0, regions.config.1);
        let mut id_records = range_filter_records(hex.records(), regions.id.0, regions.id.1);
        let eeprom_records =
            range_filter_records(hex.records(), regions.eeprom_base, regions.eeprom_end);

        let swap = is_little_endian(core_bits, &rom_records, blank_word)?;
        if swap {
            swab_records(&mut rom_records);
            swab_records(&mut config_records);
            swab_records(&mut id_records);
        }

        // EEPROM words carry one data byte per 16-bit slot; halve the
        // addresses and keep the data byte of each word.
        let pick_byte = if swap { 0 } else { 1 };
        let eeprom_records: Vec<HexRecord> = eeprom_records
            .into_iter()
            .map(|record| HexRecord {
                address: regions.eeprom_base + (record.address - regions.eeprom_base) / 2,
                data: record.data.iter().skip(pick_byte).step_by(2).copied().collect(),
            })
            .collect();

        let rom_blank = blank_word.to_be_bytes().repeat(chip.rom_size as usize);
        let rom = merge_records(&rom_records, &rom_blank, 0)?;
        let eeprom = merge_records(
            &eeprom_records,
            &vec![0xff; chip.eeprom_size as usize],
            regions.eeprom_base,
        )?;

        let id = match pic_id {
            Some(text) => decode_pic_id(text, core_bits)?,
            None => extract_id(core_bits, &regions, &config_records, &id_records)?,
        };

        let fuse_blank_bytes: Vec<u8> = chip
            .fuse_blank
            .iter()
            .flat_map(|word| word.to_be_bytes().to_vec())
            .collect();
        let fuse_records =
            range_filter_records(&config_records, regions.fuse_base, regions.fuse_end);
        let fuse_bytes = merge_records(&fuse_records, &fuse_blank_bytes, regions.fuse_base)?;
        let mut fuses: Vec<u16> = fuse_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();

        if !fuse_overrides.is_empty() {
            let mut settings = chip.decode_fuse_data(&fuses)?;
            for (name, value) in fuse_overrides {
                match settings.iter_mut().find(|(fuse, _)| fuse == name) {
                    Some(slot) => slot.1 = value.clone(),
                    None => settings.push((name.clone(), value.clone())),
                }
            }
            fuses = chip.encode_fuse_data(&settings)?;
        }

        Ok(FlashImage {
            rom,
            eeprom,
            id,
            fuses,
            cal_word: chip.cal_word,
            calibration: None,
        })
    }

    /// Records the calibration word read from the chip so the programmed
    /// image preserves it. Only meaningful on chips that keep calibration
    /// in the last ROM word.
    pub fn set_calibration_word(&mut self, word: u16) -> Result<()> {
        if !self.cal_word {
            return Err(Error::value(
                "this chip does not store calibration data in ROM",
            ));
        }
        self.calibration = Some(word);
        Ok(())
    }

    /// The ROM buffer, with the calibration word patched over the last two
    /// bytes when one has been set.
    pub fn rom_data(&self) -> Cow<'_, [u8]> {
        match self.calibration {
            Some(word) if self.cal_word => {
                let mut data = self.rom.clone();
                let tail = data.len() - 2;
                data[tail..].copy_from_slice(&word.to_be_bytes());
                Cow::Owned(data)
            }
            _ => Cow::Borrowed(&self.rom),
        }
    }

    pub fn eeprom_data(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn id_data(&self) -> &[u8] {
        &self.id
    }

    pub fn fuse_data(&self) -> &[u16] {
        &self.fuses
    }
}

fn swab_records(records: &mut [HexRecord]) {
    for record in records {
        record.data = swab_bytes(&record.data);
    }
}

/// Decides whether the hex file stores ROM words little-endian.
///
/// 16-bit cores are always little-endian and 12-bit cores are treated as
/// big-endian; for 14-bit cores the first word that is valid in exactly one
/// byte order decides for the whole file.
fn is_little_endian(core_bits: u8, rom_records: &[HexRecord], blank_word: u16) -> Result<bool> {
    if core_bits == 16 {
        return Ok(true);
    }
    for record in rom_records {
        if record.address % 2 != 0 {
            return Err(Error::value(format!(
                "ROM record starts on odd address {:#x}",
                record.address
            )));
        }
        if core_bits == 12 {
            continue;
        }
        for pair in record.data.chunks_exact(2) {
            let be = u16::from_be_bytes([pair[0], pair[1]]);
            let le = u16::from_le_bytes([pair[0], pair[1]]);
            let be_ok = (be & blank_word) == be;
            let le_ok = (le & blank_word) == le;
            match (be_ok, le_ok) {
                (true, false) => return Ok(false),
                (false, true) => return Ok(true),
                (true, true) => {}
                (false, false) => {
                    return Err(Error::value(format!(
                        "ROM word {:#06x} is valid in neither byte order",
                        be
                    )))
                }
            }
        }
    }
    Ok(false)
}

fn decode_pic_id(text: &str, core_bits: u8) -> Result<Vec<u8>> {
    let id = hex::decode(text)
        .map_err(|_| Error::value(format!("\"{}\" is not a hex PIC ID", text)))?;
    let expected = if core_bits == 16 { 8 } else { 4 };
    if id.len() != expected {
        return Err(Error::value(format!(
            "PIC ID must be {} bytes for this core, got {}",
            expected,
            id.len()
        )));
    }
    Ok(id)
}

/// Pulls the user-ID bytes out of the file. 16-bit cores store eight ID
/// bytes directly; the narrower cores store one ID nibble per word, so the
/// eight config bytes compact down to four.
fn extract_id(
    core_bits: u8,
    regions: &Regions,
    config_records: &[HexRecord],
    id_records: &[HexRecord],
) -> Result<Vec<u8>> {
    let base = regions.id.0;
    let source = if core_bits == 16 {
        range_filter_records(id_records, base, base + 8)
    } else {
        range_filter_records(config_records, base, base + 8)
    };
    let id = merge_records(&source, &[0u8; 8], base)?;
    if core_bits == 16 {
        Ok(id)
    } else {
        Ok(id.iter().skip(1).step_by(2).copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipinfo::{ChipDb, SAMPLE_CHIP_DATA};

    fn chip(name: &str) -> ChipInfo {
        ChipDb::parse(SAMPLE_CHIP_DATA).get(name).unwrap().clone()
    }

    fn image(name: &str, hex: &str) -> FlashImage {
        let file = HexFile::parse(hex).unwrap();
        FlashImage::build(&chip(name), &file, None, &[]).unwrap()
    }

    const EMPTY_HEX: &str = ":00000001FF\n";

    #[test]
    fn blank_words_for_core_widths() {
        assert_eq!(rom_blank_word(12), 0x0fff);
        assert_eq!(rom_blank_word(14), 0x3fff);
        assert_eq!(rom_blank_word(16), 0xffff);
    }

    #[test]
    fn empty_hex_gives_blank_image() {
        let image = image("12F675", EMPTY_HEX);
        let rom = image.rom_data();
        assert_eq!(rom.len(), 0x800);
        assert!(rom.chunks(2).all(|pair| pair == [0x3f, 0xff]));
        assert_eq!(image.eeprom_data(), &[0xff; 0x80][..]);
        assert_eq!(image.id_data(), &[0, 0, 0, 0]);
        assert_eq!(image.fuse_data(), &[0x31ff]);
    }

    #[test]
    fn big_endian_rom_is_kept_as_is() {
        // 0x280f/0x3fff are valid words big-endian; 0xff3f is not valid
        // little-endian, so the file reads as big-endian.
        let hex = ":04000000280F3FFF87\n:00000001FF\n";
        let image = image("12F675", hex);
        assert_eq!(&image.rom_data()[..4], &[0x28, 0x0f, 0x3f, 0xff]);
    }

    #[test]
    fn little_endian_rom_is_swapped() {
        let hex = ":040000000F28FF3F87\n:00000001FF\n";
        let image = image("12F675", hex);
        assert_eq!(&image.rom_data()[..4], &[0x28, 0x0f, 0x3f, 0xff]);
    }

    #[test]
    fn invalid_rom_words_are_rejected() {
        let hex = ":02000000FFFF00\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        assert!(matches!(
            FlashImage::build(&chip("12F675"), &file, None, &[]),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn odd_rom_record_addresses_are_rejected() {
        let hex = ":02000100280FC6\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        assert!(FlashImage::build(&chip("12F675"), &file, None, &[]).is_err());
    }

    #[test]
    fn rom_data_beyond_chip_size_is_rejected() {
        // 12F675 has 1024 words = 0x800 bytes of ROM.
        let hex = ":02100000280FB7\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        assert!(matches!(
            FlashImage::build(&chip("12F675"), &file, None, &[]),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn rom_data_at_the_top_of_the_chip_is_accepted() {
        let hex = ":0207FE00280FC2\n:00000001FF\n";
        let image = image("12F675", hex);
        assert_eq!(&image.rom_data()[0x7fe..], &[0x28, 0x0f]);
    }

    #[test]
    fn eeprom_words_compact_to_data_bytes() {
        let hex = ":044200000041004237\n:00000001FF\n";
        let image = image("12F675", hex);
        assert_eq!(&image.eeprom_data()[..2], &[0x41, 0x42]);
        assert_eq!(image.eeprom_data()[2], 0xff);
    }

    #[test]
    fn id_compacts_to_nibble_bytes_on_14_bit_cores() {
        let hex = ":084000000031003200330034EE\n:00000001FF\n";
        let image = image("12F675", hex);
        assert_eq!(image.id_data(), &[0x31, 0x32, 0x33, 0x34]);
    }

    #[test]
    fn explicit_pic_id_overrides_the_file() {
        let file = HexFile::parse(EMPTY_HEX).unwrap();
        let image = FlashImage::build(&chip("12F675"), &file, Some("deadbeef"), &[]).unwrap();
        assert_eq!(image.id_data(), &[0xde, 0xad, 0xbe, 0xef]);
        assert!(FlashImage::build(&chip("12F675"), &file, Some("dead"), &[]).is_err());
        assert!(FlashImage::build(&chip("12F675"), &file, Some("xx"), &[]).is_err());
    }

    #[test]
    fn fuse_words_come_from_the_config_region() {
        let hex = ":02400E0021FF90\n:00000001FF\n";
        let image = image("12F675", hex);
        assert_eq!(image.fuse_data(), &[0x21ff]);
    }

    #[test]
    fn fuse_overrides_merge_over_file_words() {
        let hex = ":02400E0021FF90\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        let overrides = vec![("Bandgap".to_string(), "Highest".to_string())];
        let image = FlashImage::build(&chip("12F675"), &file, None, &overrides).unwrap();
        assert_eq!(image.fuse_data(), &[0x31ff]);
    }

    #[test]
    fn multi_word_fuses_fill_the_config_tail() {
        // 16F737 has two fuse words, occupying 0x400c..0x4010 in the file.
        let hex = ":04400C003FFB3FFE39\n:00000001FF\n";
        let flash_image = image("16f737", hex);
        assert_eq!(flash_image.fuse_data(), &[0x3ffb, 0x3ffe]);

        // A file supplying only the second word leaves the first blank.
        let hex = ":02400E003FFE73\n:00000001FF\n";
        let flash_image = image("16f737", hex);
        assert_eq!(flash_image.fuse_data(), &[0x3fff, 0x3ffe]);
    }

    #[test]
    fn unknown_fuse_override_is_rejected() {
        let file = HexFile::parse(EMPTY_HEX).unwrap();
        let overrides = vec![("Nope".to_string(), "On".to_string())];
        assert!(matches!(
            FlashImage::build(&chip("12F675"), &file, None, &overrides),
            Err(Error::Fuse(_))
        ));
    }

    #[test]
    fn calibration_word_patches_the_last_rom_word() {
        let mut image = image("12F675", EMPTY_HEX);
        assert_eq!(&image.rom_data()[0x7fe..], &[0x3f, 0xff]);
        image.set_calibration_word(0x3468).unwrap();
        assert_eq!(&image.rom_data()[0x7fe..], &[0x34, 0x68]);
        // The stored image itself is untouched.
        assert_eq!(image.rom[0x7fe..], [0x3f, 0xff]);
    }

    #[test]
    fn calibration_word_needs_a_cal_word_chip() {
        let mut image = image("16f737", EMPTY_HEX);
        assert!(image.set_calibration_word(0x3468).is_err());
    }

    #[test]
    fn twelve_bit_cores_use_the_trailing_config_region() {
        // 10F200: 256 words of ROM with the config span right behind it;
        // the fuse word sits at the top of the 0x2000 span.
        let hex = ":021FFE000FAA28\n:02000000FF0FF0\n:00000001FF\n";
        let image = image("10F200", hex);
        assert_eq!(image.fuse_data(), &[0x0faa]);
        // 12-bit files are taken as big-endian without scanning the words.
        assert_eq!(&image.rom_data()[..2], &[0xff, 0x0f]);
        assert_eq!(&image.rom_data()[2..4], &[0x0f, 0xff]);
    }

    #[test]
    fn sixteen_bit_cores_swap_and_use_high_regions() {
        let hex = concat!(
            ":021000003412A8\n",            // ROM, little-endian file order
            ":020000040020DA\n",            // ID space
            ":080000004142434445464748D4\n",
            ":020000040030CA\n",            // config space
            ":0200000055AAFF\n",
            ":00000001FF\n"
        );
        let image = image("18F252", hex);
        assert_eq!(&image.rom_data()[0x1000..0x1002], &[0x12, 0x34]);
        assert_eq!(
            image.id_data(),
            &[0x42, 0x41, 0x44, 0x43, 0x46, 0x45, 0x48, 0x47]
        );
        assert_eq!(image.fuse_data()[0], 0xaa55);
        assert_eq!(image.fuse_data()[1..], [0xffff; 6]);
        assert_eq!(image.eeprom_data().len(), 0x100);
    }
}
