//! Command-line front end: one sub-command per pipeline operation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;

use log::{error, info, warn};
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use picpro::chipinfo::{ChipDb, ChipInfo};
use picpro::connection::{programmer_model_name, Connection};
use picpro::hexfile::{self, HexFile};
use picpro::image::{rom_blank_word, FlashImage};
use picpro::programming::{ChipConfig, Programmer};
use picpro::transport::{Link, SerialLink};
use picpro::{swab_bytes, Error, Result};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "picpro",
    about = "Program, verify and inspect PIC chips through a kitsrus K128/K149/K150 serial programmer."
)]
struct Options {
    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Program a chip from a hex file
    Program {
        /// Serial port the programmer is connected to
        #[structopt(short = "p", long)]
        port: String,
        /// Hex file to flash
        #[structopt(short = "i", long = "hex_file")]
        hex_file: PathBuf,
        /// Chip type to program
        #[structopt(short = "t", long = "pic_type")]
        pic_type: String,
        /// PIC ID to program, as hex digits
        #[structopt(long)]
        id: Option<String>,
        /// Fuse override as NAME:VALUE; may be repeated
        #[structopt(long = "fuse", number_of_values = 1)]
        fuses: Vec<String>,
        /// Program through the ICSP header instead of the socket
        #[structopt(long)]
        icsp: bool,
    },

    /// Verify chip contents against a hex file
    Verify {
        #[structopt(short = "p", long)]
        port: String,
        #[structopt(short = "i", long = "hex_file")]
        hex_file: PathBuf,
        #[structopt(short = "t", long = "pic_type")]
        pic_type: String,
        #[structopt(long)]
        icsp: bool,
    },

    /// Erase a chip
    Erase {
        #[structopt(short = "p", long)]
        port: String,
        #[structopt(short = "t", long = "pic_type")]
        pic_type: String,
        #[structopt(long)]
        icsp: bool,
    },

    /// Dump chip memory to a file
    Dump {
        /// Memory to dump: rom, eeprom or config
        mem_type: MemType,
        #[structopt(short = "p", long)]
        port: String,
        /// Output file
        #[structopt(short = "o", long = "out_file")]
        output: PathBuf,
        #[structopt(short = "t", long = "pic_type")]
        pic_type: String,
        #[structopt(long)]
        icsp: bool,
        /// Write raw binary instead of Intel-HEX
        #[structopt(long)]
        binary: bool,
    },

    /// Print chip database entries as JSON
    #[structopt(name = "chip_info")]
    ChipInfo {
        /// Chip type; all chips when omitted
        pic_type: Option<String>,
    },

    /// Read and print the chip's ID, fuses and calibration word
    #[structopt(name = "read_chip_config")]
    ReadChipConfig {
        #[structopt(short = "p", long)]
        port: String,
        #[structopt(short = "t", long = "pic_type")]
        pic_type: String,
        #[structopt(long)]
        icsp: bool,
    },

    /// Print information about a hex file
    #[structopt(name = "hex_info")]
    HexInfo {
        hex_file: PathBuf,
        pic_type: String,
    },

    /// Print the programmer's model and protocol version
    #[structopt(name = "programmer_info")]
    ProgrammerInfo {
        #[structopt(short = "p", long)]
        port: String,
    },

    /// Decode raw fuse words into symbolic settings
    #[structopt(name = "decode_fuses")]
    DecodeFuses {
        /// Fuse words, space separated, decimal or 0x-prefixed hex
        fuses: String,
        #[structopt(short = "t", long = "pic_type")]
        pic_type: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemType {
    Rom,
    Eeprom,
    Config,
}

impl FromStr for MemType {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        match text {
            "rom" => Ok(MemType::Rom),
            "eeprom" => Ok(MemType::Eeprom),
            "config" => Ok(MemType::Config),
            other => Err(format!("unknown memory type \"{}\"", other)),
        }
    }
}

fn main() {
    let options = Options::from_args();
    TermLogger::init(options.log_level, Config::default(), TerminalMode::Mixed)
        .expect("logger init");

    if let Err(err) = run(options.command) {
        error!("{}", err);
        process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Program {
            port,
            hex_file,
            pic_type,
            id,
            fuses,
            icsp,
        } => program(&port, &hex_file, &pic_type, id.as_deref(), &fuses, icsp),
        Command::Verify {
            port,
            hex_file,
            pic_type,
            icsp,
        } => verify(&port, &hex_file, &pic_type, icsp),
        Command::Erase {
            port,
            pic_type,
            icsp,
        } => erase(&port, &pic_type, icsp),
        Command::Dump {
            mem_type,
            port,
            output,
            pic_type,
            icsp,
            binary,
        } => dump(mem_type, &port, &output, &pic_type, icsp, binary),
        Command::ChipInfo { pic_type } => chip_info(pic_type.as_deref()),
        Command::ReadChipConfig {
            port,
            pic_type,
            icsp,
        } => read_chip_config(&port, &pic_type, icsp),
        Command::HexInfo { hex_file, pic_type } => hex_info(&hex_file, &pic_type),
        Command::ProgrammerInfo { port } => programmer_info(&port),
        Command::DecodeFuses { fuses, pic_type } => decode_fuses(&fuses, &pic_type),
    }
}

/// Searches the well-known locations for `chipdata.cid`.
fn find_chip_data() -> Result<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/share/picpro/chipdata.cid"),
        PathBuf::from("/usr/local/share/picpro/chipdata.cid"),
    ];
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("chipdata.cid"));
        }
    }
    candidates.push(PathBuf::from("chipdata.cid"));
    if cfg!(windows) {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            candidates.push(Path::new(&local).join("picpro").join("chipdata.cid"));
        }
    }

    candidates
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "chipdata.cid was not found in any search path",
            ))
        })
}

fn load_chip(pic_type: &str) -> Result<ChipInfo> {
    let db = ChipDb::load(find_chip_data()?)?;
    Ok(db.get(pic_type)?.clone())
}

fn connect(port: &str) -> Result<Connection<SerialLink>> {
    info!("Opening connection to programmer on {}", port);
    Connection::open(SerialLink::open(port)?)
}

fn parse_fuse_overrides(specs: &[String]) -> Result<Vec<(String, String)>> {
    specs
        .iter()
        .map(|spec| match spec.split_once(':') {
            Some((name, value)) => Ok((name.to_string(), value.to_string())),
            None => Err(Error::value(format!(
                "fuse override \"{}\" is not NAME:VALUE",
                spec
            ))),
        })
        .collect()
}

/// Builds the flash image, printing the chip's fuse vocabulary when a fuse
/// override does not apply.
fn build_image(
    chip: &ChipInfo,
    hex: &HexFile,
    id: Option<&str>,
    fuses: &[(String, String)],
) -> Result<FlashImage> {
    FlashImage::build(chip, hex, id, fuses).map_err(|err| {
        if let Error::Fuse(_) = err {
            eprintln!(
                "Valid fuse names and settings for this chip:\n{}",
                chip.fuse_doc()
            );
        }
        err
    })
}

fn show_chip_config(config: &ChipConfig, chip: &ChipInfo) {
    println!("Chip ID: {:#06x}", config.chip_id);
    println!("ID:      {}", hex::encode(config.id));
    println!("CAL:     {:#06x}", config.calibrate);
    match chip.decode_fuse_data(&config.fuses) {
        Ok(settings) => {
            println!("Fuses:");
            for (fuse, setting) in settings {
                println!("    {} = {}", fuse, setting);
            }
        }
        Err(_) => {
            let words: Vec<String> = config
                .fuses
                .iter()
                .map(|word| format!("{:#06x}", word))
                .collect();
            warn!("fuse words {} match no declared setting", words.join(" "));
        }
    }
}

/// Waits for the operator to seat the chip, unless the part is programmed
/// in-circuit.
fn wait_for_chip(
    connection: &mut Connection<SerialLink>,
    chip: &ChipInfo,
    icsp: bool,
) -> Result<()> {
    if icsp || chip.icsp_only {
        return Ok(());
    }
    match chip.socket_image.pin1_location() {
        Some(hint) => info!("Insert the chip into the socket, pin 1 at the {}", hint),
        None => info!("Insert the chip into the socket"),
    }
    connection.wait_until_chip_in_socket()
}

/// Reads back ROM (and EEPROM) and compares against the image.
fn verify_programmed_data<L: Link>(
    programmer: &mut Programmer<'_, L>,
    chip: &ChipInfo,
    image: &FlashImage,
) -> Result<bool> {
    info!("Verifying ROM");
    let device_rom = programmer.read_rom()?;
    let expected_rom = image.rom_data();
    let mut verified = true;
    if device_rom.as_slice() == &*expected_rom {
        info!("ROM verified");
    } else {
        error!("ROM verification failed");
        let zeros = device_rom.iter().filter(|&&byte| byte == 0).count();
        let opaque = if chip.cal_word {
            device_rom.len() - 2
        } else {
            device_rom.len()
        };
        if zeros == opaque {
            warn!("The ROM reads as all zeros; it may be locked for reading");
        }
        verified = false;
    }

    if chip.has_eeprom() {
        info!("Verifying EEPROM");
        let device_eeprom = programmer.read_eeprom()?;
        if device_eeprom.as_slice() == image.eeprom_data() {
            info!("EEPROM verified");
        } else {
            error!("EEPROM verification failed");
            verified = false;
        }
    }

    Ok(verified)
}

fn program(
    port: &str,
    hex_file: &Path,
    pic_type: &str,
    id: Option<&str>,
    fuse_specs: &[String],
    icsp: bool,
) -> Result<()> {
    let fuses = parse_fuse_overrides(fuse_specs)?;
    let hex = HexFile::open(hex_file)?;
    let chip = load_chip(pic_type)?;
    let mut image = build_image(&chip, &hex, id, &fuses)?;

    let mut connection = connect(port)?;
    wait_for_chip(&mut connection, &chip, icsp)?;
    info!("Initializing programming interface");
    let mut programmer = Programmer::new(&mut connection, &chip, icsp)?;

    let config = programmer.read_config()?;
    show_chip_config(&config, &chip);
    if chip.cal_word {
        info!("Calibration lives in ROM; preserving the chip's value");
        image.set_calibration_word(config.calibrate)?;
    }

    if chip.flash_chip {
        info!("Erasing chip");
        programmer.erase_chip()?;
    } else {
        info!("This chip is not erasable; programming over the existing contents");
    }
    programmer.cycle_programming_voltages()?;

    info!("Programming ROM");
    programmer.program_rom(&image.rom_data())?;
    if chip.has_eeprom() {
        info!("Programming EEPROM");
        programmer.program_eeprom(image.eeprom_data())?;
    }
    info!("Programming ID and fuses");
    let transaction = programmer.program_id_fuses(image.id_data(), image.fuse_data())?;

    if !verify_programmed_data(&mut programmer, &chip, &image)? {
        return Err(Error::InvalidResponse(
            "programmed data failed verification".to_string(),
        ));
    }
    if let Some(transaction) = transaction {
        info!("Committing 18F fuse data");
        programmer.commit_18f_fuses(transaction)?;
    }
    info!("Done");
    Ok(())
}

fn verify(port: &str, hex_file: &Path, pic_type: &str, icsp: bool) -> Result<()> {
    let hex = HexFile::open(hex_file)?;
    let chip = load_chip(pic_type)?;
    let mut image = build_image(&chip, &hex, None, &[])?;

    let mut connection = connect(port)?;
    info!("Initializing programming interface");
    let mut programmer = Programmer::new(&mut connection, &chip, icsp)?;

    let config = programmer.read_config()?;
    show_chip_config(&config, &chip);
    if chip.cal_word {
        image.set_calibration_word(config.calibrate)?;
    }

    if !verify_programmed_data(&mut programmer, &chip, &image)? {
        return Err(Error::InvalidResponse(
            "chip contents do not match the hex file".to_string(),
        ));
    }
    info!("Done");
    Ok(())
}

fn erase(port: &str, pic_type: &str, icsp: bool) -> Result<()> {
    let chip = load_chip(pic_type)?;
    let mut connection = connect(port)?;
    wait_for_chip(&mut connection, &chip, icsp)?;
    info!("Initializing programming interface");
    let mut programmer = Programmer::new(&mut connection, &chip, icsp)?;
    info!("Erasing chip");
    programmer.erase_chip()?;
    info!("Done");
    Ok(())
}

fn dump(
    mem_type: MemType,
    port: &str,
    output: &Path,
    pic_type: &str,
    icsp: bool,
    binary: bool,
) -> Result<()> {
    let chip = load_chip(pic_type)?;
    let mut connection = connect(port)?;
    info!("Initializing programming interface");
    let mut programmer = Programmer::new(&mut connection, &chip, icsp)?;

    let content = match mem_type {
        MemType::Rom => {
            info!("Reading ROM");
            swab_bytes(&programmer.read_rom()?)
        }
        MemType::Eeprom => {
            if !chip.has_eeprom() {
                return Err(Error::value("this chip has no EEPROM"));
            }
            info!("Reading EEPROM");
            swab_bytes(&programmer.read_eeprom()?)
        }
        MemType::Config => {
            info!("Reading chip config");
            programmer.read_config()?.to_bytes().to_vec()
        }
    };

    if binary {
        fs::write(output, &content)?;
    } else {
        fs::write(output, hexfile::write_ihex(&content)?)?;
    }
    info!("Dump written to {}", output.display());
    Ok(())
}

fn chip_info(pic_type: Option<&str>) -> Result<()> {
    let db = ChipDb::load(find_chip_data()?)?;
    let json = match pic_type {
        Some(name) => serde_json::to_string_pretty(db.get(name)?),
        None => {
            let chips: std::collections::BTreeMap<&str, &ChipInfo> = db
                .chips()
                .map(|chip| (chip.chip_name.as_str(), chip))
                .collect();
            serde_json::to_string_pretty(&chips)
        }
    }
    .map_err(|err| Error::value(format!("cannot serialize chip info: {}", err)))?;
    println!("{}", json);
    Ok(())
}

fn read_chip_config(port: &str, pic_type: &str, icsp: bool) -> Result<()> {
    let chip = load_chip(pic_type)?;
    let mut connection = connect(port)?;
    info!("Initializing programming interface");
    let mut programmer = Programmer::new(&mut connection, &chip, icsp)?;
    let config = programmer.read_config()?;
    show_chip_config(&config, &chip);
    Ok(())
}

fn hex_info(hex_file: &Path, pic_type: &str) -> Result<()> {
    let hex = HexFile::open(hex_file)?;
    let chip = load_chip(pic_type)?;
    let image = build_image(&chip, &hex, None, &[])?;

    let blank = rom_blank_word(chip.core_bits()).to_be_bytes();
    let rom_used = image
        .rom_data()
        .chunks(2)
        .filter(|word| *word != blank)
        .count();
    println!(
        "ROM: {} words used, {} words free on chip",
        rom_used,
        chip.rom_size as usize - rom_used
    );
    if chip.has_eeprom() {
        let eeprom_used = image
            .eeprom_data()
            .iter()
            .filter(|&&byte| byte != 0xff)
            .count();
        println!(
            "EEPROM: {} bytes used, {} bytes free on chip",
            eeprom_used,
            chip.eeprom_size as usize - eeprom_used
        );
    }
    println!("Data:");
    for (first, end) in hex.segments() {
        println!(
            "  {{ first: 0x{:08X}, last: 0x{:08X}, length: 0x{:08X} }}",
            first,
            end - 1,
            end - first
        );
    }
    Ok(())
}

fn programmer_info(port: &str) -> Result<()> {
    let mut connection = connect(port)?;
    let version = connection.programmer_version()?;
    match programmer_model_name(version) {
        Some(model) => println!("Programmer: {} (firmware version {})", model, version),
        None => println!("Programmer: unknown model (firmware version {})", version),
    }
    println!("Protocol:   {}", connection.programmer_protocol()?);
    Ok(())
}

fn decode_fuses(text: &str, pic_type: &str) -> Result<()> {
    let chip = load_chip(pic_type)?;
    let words = text
        .split_whitespace()
        .map(parse_fuse_word)
        .collect::<Result<Vec<u16>>>()?;
    for (fuse, setting) in chip.decode_fuse_data(&words)? {
        println!("{} = {}", fuse, setting);
    }
    Ok(())
}

fn parse_fuse_word(text: &str) -> Result<u16> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| Error::value(format!("\"{}\" is not a fuse word", text)))
}
