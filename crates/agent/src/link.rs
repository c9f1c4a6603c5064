//! crates/agent/src/link.rs
//!
//! Serial device adapter behind the protocol [`Link`] trait.

use std::io::{self, Read, Write};
use std::time::Duration;

use protocol::Link;
use tracing::info;

use crate::config::{Parity, SerialSettings, StopBits};
use crate::error::AgentError;

/// Device read timeout; an empty read after this long is normal.
const DEVICE_TIMEOUT: Duration = Duration::from_secs(1);

/// The production link: an open serial device.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    /// Opens and configures the serial device. Failure here is fatal
    /// for the agent: without the link there is no control channel.
    pub fn open(settings: &SerialSettings) -> Result<Self, AgentError> {
        settings.validate()?;
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits)?)
            .parity(parity(settings.parity))
            .stop_bits(stop_bits(settings.stop_bits))
            .timeout(DEVICE_TIMEOUT)
            .open()?;
        info!(
            port = %settings.port,
            baud = settings.baud_rate,
            "serial port open"
        );
        Ok(Self { port })
    }
}

impl Link for SerialLink {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(read) => Ok(read),
            // An idle link is not an error; the dispatcher polls again.
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(error) => Err(error),
        }
    }

    fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)
    }
}

fn data_bits(bits: u8) -> Result<serialport::DataBits, AgentError> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(crate::config::ConfigError::ByteSize(other).into()),
    }
}

const fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

const fn stop_bits(stop_bits: StopBits) -> serialport::StopBits {
    match stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_bits_map_to_serialport_values() {
        assert_eq!(data_bits(5).expect("bits"), serialport::DataBits::Five);
        assert_eq!(data_bits(8).expect("bits"), serialport::DataBits::Eight);
        assert!(data_bits(9).is_err());
    }

    #[test]
    fn opening_a_missing_device_is_an_error() {
        let settings = SerialSettings {
            port: "/dev/does-not-exist-serclient".to_string(),
            ..SerialSettings::default()
        };
        assert!(SerialLink::open(&settings).is_err());
    }
}
