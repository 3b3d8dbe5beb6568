//! Serial transport with UPDI break support.

use std::{
    fmt::Display,
    io::{Read, Write},
    thread,
    time::Duration,
};

use clap::{ValueEnum, builder::PossibleValue};
use serialport::SerialPort;

use super::{Transport, check_echo};
use crate::error::{Error, Result};

const SERIAL_TIMEOUT_MS: u64 = 1000;

/// Nominal break duration. UPDI specifies a break as at least one frame at
/// the slowest possible UPDI clock, which stays below 25 ms.
const BREAK_DURATION_MS: u64 = 25;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    Baud57600,
    #[default]
    Baud115200,
    Baud230400,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud57600 => 57600,
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud230400 => 230400,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud57600,
            Baudrate::Baud115200,
            Baudrate::Baud230400,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud57600 => Some(PossibleValue::new("Baud57600").aliases(["57600"])),
            Baudrate::Baud115200 => Some(PossibleValue::new("Baud115200").aliases(["115200"])),
            Baudrate::Baud230400 => Some(PossibleValue::new("Baud230400").aliases(["230400"])),
        }
    }
}

/// A plain USB-serial adapter wired for UPDI: TX through a resistor to the
/// UPDI pin, RX straight on it. UPDI frames use even parity and two stop
/// bits.
pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate.into())
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::Two)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize, baudrate: Baudrate) -> Result<Self> {
        let ports = serialport::available_ports()?;
        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no serial ports found",
            ))),
        }
    }

    /// Read whatever is pending until the line goes quiet. Timeouts here
    /// are expected and ignored: this only discards stale bytes.
    fn drain_input(&mut self) {
        let mut scratch = [0u8; 64];
        loop {
            match self.serial_port.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => log::trace!("drained {} stale bytes", n),
                Err(_) => break,
            }
        }
    }

    /// Read up to `n` bytes, stopping early on timeout.
    fn read_upto(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut got = 0;
        while got < n {
            match self.serial_port.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(read) => got += read,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(got);
        Ok(buf)
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.serial_port.write_all(data)?;
        self.serial_port.flush()?;

        // The wire is shared, so everything we sent comes back first.
        let echo = self.read_upto(data.len())?;
        check_echo(data, &echo)
    }

    fn receive(&mut self, n: usize) -> Result<Vec<u8>> {
        let buf = self.read_upto(n)?;
        if buf.len() < n {
            log::debug!("receive: wanted {} bytes, got {}", n, buf.len());
            return Err(Error::TransportTimeout("response read"));
        }
        Ok(buf)
    }

    fn send_break(&mut self) -> Result<()> {
        log::debug!("sending break");
        self.serial_port.set_break()?;
        thread::sleep(Duration::from_millis(BREAK_DURATION_MS));
        self.serial_port.clear_break()?;
        self.drain_input();
        Ok(())
    }
}
