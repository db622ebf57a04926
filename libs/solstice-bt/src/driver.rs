//! Seam between the context state machine and the host bus.
//!
//! The context only ever talks to a [`BusDriver`] and only ever hears back
//! through [`BusEvent`]s handed to `Context::handle_event` on the main
//! thread. Production uses the BlueZ driver; tests substitute their own.

use solstice::Error;

use crate::gatt::{AttrTable, ChrFlags, DescFlags};
use crate::uuid::Uuid;
use crate::{Address, Transport};

/// Partial device property refresh; absent fields stay as they were.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub address: Option<Address>,
    pub name: Option<String>,
    pub paired: Option<bool>,
    pub connected: Option<bool>,
    pub rssi: Option<i16>,
    pub uuids: Option<Vec<Uuid>>,
    pub services_resolved: Option<bool>,
}

/// Kind of a remote attribute surfaced by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAttrKind {
    Service,
    Characteristic,
    Descriptor,
}

#[derive(Debug)]
pub enum BusEvent {
    AdapterAdded {
        path: String,
        powered: bool,
    },
    AdapterRemoved {
        path: String,
    },
    PoweredChanged {
        path: String,
        powered: bool,
    },
    DeviceAdded {
        path: String,
        update: DeviceUpdate,
    },
    DeviceChanged {
        path: String,
        update: DeviceUpdate,
    },
    DeviceRemoved {
        path: String,
    },
    /// Completion of an asynchronous `Connect` call.
    ConnectReply {
        path: String,
        result: Result<(), Error>,
    },
    /// Remote attribute found while resolving a device's services.
    AttrDiscovered {
        device: String,
        path: String,
        kind: RemoteAttrKind,
        uuid: Uuid,
        chr_flags: ChrFlags,
        desc_flags: DescFlags,
    },
    RemoteReadReply {
        token: u64,
        result: Result<Vec<u8>, Error>,
    },
    RemoteWriteReply {
        token: u64,
        result: Result<(), Error>,
    },
    /// Notification/indication from a subscribed remote characteristic.
    RemoteValueChanged {
        path: String,
        value: Vec<u8>,
    },
    /// The bus connection is gone; sweep everything in flight.
    BusLost,
}

/// Commands the context issues toward the bus. All calls are asynchronous;
/// outcomes come back as [`BusEvent`]s.
pub trait BusDriver {
    fn set_powered(&self, adapter: &str, powered: bool);
    fn start_discovery(&self, adapter: &str, transport: Transport);
    fn stop_discovery(&self, adapter: &str);
    fn connect_device(&self, device: &str);
    fn disconnect_device(&self, device: &str);
    fn register_application(&self, app_id: u32, table: &AttrTable, paths: &[String]);
    fn unregister_application(&self, app_id: u32);
    /// Emit a `Value` property change for a served attribute.
    fn emit_value_changed(&self, attr_path: &str, value: &[u8]);
    fn read_remote(&self, token: u64, attr_path: &str);
    fn write_remote(&self, token: u64, attr_path: &str, value: &[u8]);
    fn subscribe_remote(&self, attr_path: &str);
    fn unsubscribe_remote(&self, attr_path: &str);
}
