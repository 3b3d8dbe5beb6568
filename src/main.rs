use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use std::cell::RefCell;

use updiprog::flashing::{FlashProgress, Flashing, ProgressPhase};
use updiprog::session::SessionState;
use updiprog::transport::serial::Baudrate;
use updiprog::{ChargeConfig, DeviceDb, SerialTransport, Session};

#[derive(clap::Parser)]
#[clap(
    name = "updiprog",
    about = "UPDI programmer for the new 8-bit AVR generation, over a plain serial adapter",
    version
)]
struct Cli {
    /// Serial port connected to the UPDI adapter; first available port if
    /// omitted
    #[clap(short, long, global = true)]
    port: Option<String>,

    /// UPDI baudrate
    #[clap(short, long, global = true, value_enum, default_value_t = Baudrate::default())]
    baudrate: Baudrate,

    /// Expected chip; detected from the signature row if omitted
    #[clap(short, long, global = true)]
    chip: Option<String>,

    /// Verbose protocol logging (-v debug, -vv trace)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List serial ports and known chips
    Scan {},
    /// Show info about the connected chip
    Info {},
    /// Reset the connected chip
    Reset {},
    /// Erase flash and EEPROM
    Erase {},
    /// Unlock a locked chip (erases it, that is the deal)
    Unlock {},
    /// Program a firmware image (Intel HEX or raw binary) and verify it
    Flash {
        /// Path of the image to program
        path: String,
    },
    /// Verify flash content against an image
    Verify {
        path: String,
    },
    /// Read memory and dump it as hex
    Read {
        #[clap(value_parser = parse_maybe_hex)]
        address: u32,
        #[clap(value_parser = parse_maybe_hex)]
        length: u32,
    },
    /// Read the configuration record from EEPROM
    ReadConfig {},
    /// Write the configuration record, starting from what the device holds
    WriteConfig {
        #[clap(long)]
        charge_current: Option<u16>,
        #[clap(long)]
        charge_voltage: Option<u16>,
        #[clap(long)]
        input_current: Option<u16>,
        #[clap(long)]
        autostart: Option<bool>,
        #[clap(long)]
        led: Option<bool>,
    },
    /// Write the user row; works on a locked chip without erasing it
    WriteUserrow {
        /// Row content as a hex string, e.g. a9c7010a
        data: String,
    },
}

fn parse_maybe_hex(arg: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    if let Some(digits) = arg.strip_prefix("0x") {
        u32::from_str_radix(digits, 16)
    } else {
        arg.parse()
    }
}

fn open_transport(cli: &Cli) -> Result<SerialTransport> {
    Ok(match &cli.port {
        Some(port) => SerialTransport::open(port, cli.baudrate)?,
        None => SerialTransport::open_nth(0, cli.baudrate)?,
    })
}

/// Connect, enter programming mode and pin down the device identity.
fn open_flashing(cli: &Cli) -> Result<Flashing<SerialTransport>> {
    let mut session = Session::connect(open_transport(cli)?)?;
    session.enter_progmode()?;
    match &cli.chip {
        Some(name) => session.verify_device_id(DeviceDb::find_by_name(name)?)?,
        None => {
            session.detect_device()?;
        }
    }
    Ok(Flashing::new(session))
}

fn progress_bar() -> FlashProgress {
    let state: RefCell<Option<(ProgressPhase, ProgressBar)>> = RefCell::new(None);
    FlashProgress::new(move |phase, done, total| {
        let mut state = state.borrow_mut();
        let stale = !matches!(&*state, Some((p, _)) if *p == phase);
        if stale {
            if let Some((_, bar)) = state.take() {
                bar.finish();
            }
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template("{msg:8} {bar:40.cyan/blue} {pos}/{len}").unwrap(),
            );
            bar.set_message(match phase {
                ProgressPhase::Erase => "erase",
                ProgressPhase::Write => "write",
                ProgressPhase::Verify => "verify",
            });
            *state = Some((phase, bar));
        }
        let (_, bar) = state.as_ref().unwrap();
        bar.set_position(done as u64);
        if done == total {
            bar.finish();
        }
        true
    })
}

fn dump_hex(base: u32, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:06x}: {}", base as usize + i * 16, bytes.join(" "));
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match &cli.command {
        Command::Scan {} => {
            for port in SerialTransport::scan_ports()? {
                println!("{}", port);
            }
            println!("known chips: {}", DeviceDb::known_chips()?.join(", "));
        }
        Command::Info {} => {
            let mut flashing = open_flashing(&cli)?;
            flashing.dump_info()?;
            match flashing.read_config()? {
                Some(config) => log::info!("Configuration: {:?}", config),
                None => log::info!("Configuration area is blank"),
            }
            flashing.into_session().disconnect();
        }
        Command::Reset {} => {
            let mut session = Session::connect(open_transport(&cli)?)?;
            session.leave_progmode()?;
        }
        Command::Erase {} => {
            let mut flashing = open_flashing(&cli)?;
            flashing.erase_chip()?;
            flashing.into_session().disconnect();
        }
        Command::Unlock {} => {
            let mut session = Session::connect(open_transport(&cli)?)?;
            session.unlock()?;
            session.enter_progmode()?;
            session.detect_device()?;
            session.disconnect();
        }
        Command::Flash { path } => {
            let mut flashing = open_flashing(&cli)?;
            flashing.dump_info()?;
            let firmware = updiprog::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", firmware.data.len());
            flashing.program(&firmware, &progress_bar())?;
            flashing.into_session().disconnect();
        }
        Command::Verify { path } => {
            let mut flashing = open_flashing(&cli)?;
            let firmware = updiprog::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", firmware.data.len());
            flashing.verify(&firmware, &progress_bar())?;
            log::info!("Verified!");
            flashing.into_session().disconnect();
        }
        Command::Read { address, length } => {
            let mut flashing = open_flashing(&cli)?;
            let data = flashing.session().memory().read(*address, *length as usize)?;
            dump_hex(*address, &data);
            flashing.into_session().disconnect();
        }
        Command::ReadConfig {} => {
            let mut flashing = open_flashing(&cli)?;
            match flashing.read_config()? {
                Some(config) => println!("{:#?}", config),
                None => {
                    println!("configuration area is blank; defaults would be:");
                    println!("{:#?}", ChargeConfig::default());
                }
            }
            flashing.into_session().disconnect();
        }
        Command::WriteConfig {
            charge_current,
            charge_voltage,
            input_current,
            autostart,
            led,
        } => {
            let mut flashing = open_flashing(&cli)?;
            let mut config = match flashing.read_config()? {
                Some(config) => config,
                None => {
                    log::warn!("configuration area is blank, starting from defaults");
                    ChargeConfig::default()
                }
            };
            if let Some(v) = charge_current {
                config.charge_current_ma = *v;
            }
            if let Some(v) = charge_voltage {
                config.charge_voltage_mv = *v;
            }
            if let Some(v) = input_current {
                config.input_current_ma = *v;
            }
            if let Some(v) = autostart {
                config.autostart = *v;
            }
            if let Some(v) = led {
                config.led_enabled = *v;
            }
            flashing.write_config(&config)?;
            flashing.into_session().disconnect();
        }
        Command::WriteUserrow { data } => {
            let data = hex::decode(data)?;
            let mut session = Session::connect(open_transport(&cli)?)?;
            if session.state() == SessionState::Locked {
                // The key flow is the only way in; it needs to know the
                // memory map up front since the signature is unreadable.
                let chip = cli.chip.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("--chip is required for a locked user-row write")
                })?;
                let device = DeviceDb::find_by_name(chip)?;
                session.write_user_row_locked(&device, &data)?;
                session.disconnect();
            } else {
                session.enter_progmode()?;
                match &cli.chip {
                    Some(name) => session.verify_device_id(DeviceDb::find_by_name(name)?)?,
                    None => {
                        session.detect_device()?;
                    }
                }
                let mut flashing = Flashing::new(session);
                flashing.write_user_row(&data)?;
                flashing.into_session().disconnect();
            }
        }
    }

    Ok(())
}
