//! Bluetooth sessions, discovery, connections and GATT over the host bus.
//!
//! All state hangs off a per-process context on the main thread; the bus
//! itself is behind the [`driver::BusDriver`] seam, with a BlueZ DBus
//! implementation in [`bluez`].

use std::fmt;
use std::str::FromStr;

use solstice::Error;

pub mod bluez;
mod context;
pub mod driver;
pub mod gatt;
pub mod uuid;

pub use context::{
    AdapterState, Conn, ScanHandle, Session, adapter_state, connect, enable, handle_event,
    indicate, init, is_initialized, local_read, local_write, notify, pending_reply, register,
    shutdown, start_scan, take_cached_value, unregister,
};
pub use gatt::PendingRef;

/// 48-bit device address, `AA:BB:CC:DD:EE:FF` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Address(pub [u8; 6]);

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Address, Error> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut out {
            let part = parts.next().ok_or(Error::InvalidInput)?;
            if part.len() != 2 {
                return Err(Error::InvalidInput);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidInput)?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidInput);
        }
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Discovery transport filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    All,
    LowEnergy,
    ClassicBrEdr,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::All => "all",
            Transport::LowEnergy => "le",
            Transport::ClassicBrEdr => "bredr",
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Transport, Error> {
        match s {
            "all" => Ok(Transport::All),
            "le" => Ok(Transport::LowEnergy),
            "bredr" => Ok(Transport::ClassicBrEdr),
            _ => Err(Error::InvalidInput),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a remote device, refreshed property by property.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub address: Address,
    pub name: String,
    pub paired: bool,
    pub connected: bool,
    pub rssi: i16,
    pub in_range: bool,
    pub uuids: Vec<uuid::Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_formats() {
        let addr: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(addr.0, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");
        assert_eq!("aa:bb:cc:dd:ee:01".parse::<Address>().unwrap(), addr);
        assert!("AA:BB:CC:DD:EE".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE:01:02".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<Address>().is_err());
    }

    #[test]
    fn transport_names_round_trip() {
        for transport in [Transport::All, Transport::LowEnergy, Transport::ClassicBrEdr] {
            assert_eq!(transport.as_str().parse::<Transport>().unwrap(), transport);
        }
        assert!("hyperspace".parse::<Transport>().is_err());
    }
}
