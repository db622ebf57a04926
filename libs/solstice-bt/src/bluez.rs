//! BlueZ DBus driver.
//!
//! The bus work runs on its own thread with its own connection; the main
//! loop talks to it through a command channel and hears back through
//! [`BusEvent`]s posted via the loop dispatcher. Served GATT objects hop
//! onto the main thread for every read/write and answer the bus through a
//! oneshot.

use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;

use futures::channel::{mpsc, oneshot};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt, TryStreamExt, future::LocalBoxFuture};
use solstice::Error;
use solstice::mainloop::{self, Dispatcher};
use tracing::{debug, error, warn};
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{Connection, MatchRule, MessageStream, interface, proxy};

use crate::driver::{BusDriver, BusEvent, DeviceUpdate, RemoteAttrKind};
use crate::gatt::{AttrTable, AttrType, ChrFlags, DescFlags};
use crate::uuid::Uuid;
use crate::{Address, Transport, context};

const BLUEZ: &str = "org.bluez";

#[proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
trait Adapter1 {
    async fn start_discovery(&self) -> zbus::Result<()>;

    async fn stop_discovery(&self) -> zbus::Result<()>;

    async fn set_discovery_filter(
        &self,
        filter: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_powered(&self, powered: bool) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
trait Device1 {
    async fn connect(&self) -> zbus::Result<()>;

    async fn disconnect(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.bluez.GattCharacteristic1",
    default_service = "org.bluez"
)]
trait RemoteCharacteristic {
    async fn read_value(&self, options: HashMap<String, OwnedValue>) -> zbus::Result<Vec<u8>>;

    async fn write_value(
        &self,
        value: Vec<u8>,
        options: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    async fn start_notify(&self) -> zbus::Result<()>;

    async fn stop_notify(&self) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.GattManager1", default_service = "org.bluez")]
trait GattManager1 {
    async fn register_application(
        &self,
        application: OwnedObjectPath,
        options: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    async fn unregister_application(&self, application: OwnedObjectPath) -> zbus::Result<()>;
}

/// Table entry flattened into `Send`-able form for the bus thread.
struct ServedAttr {
    kind: AttrType,
    path: String,
    uuid: String,
    flags: Vec<String>,
    parent: String,
}

enum Command {
    SetPowered { adapter: String, powered: bool },
    StartDiscovery { adapter: String, transport: Transport },
    StopDiscovery { adapter: String },
    ConnectDevice { device: String },
    DisconnectDevice { device: String },
    Register { app_id: u32, attrs: Vec<ServedAttr> },
    Unregister { app_id: u32 },
    EmitValue { path: String, value: Vec<u8> },
    ReadRemote { token: u64, path: String },
    WriteRemote { token: u64, path: String, value: Vec<u8> },
    Subscribe { path: String },
    Unsubscribe { path: String },
}

pub struct BlueZDriver {
    commands: mpsc::UnboundedSender<Command>,
}

impl BlueZDriver {
    /// Spawn the bus thread and return the driver for [`context::init`].
    pub fn spawn() -> Result<Rc<BlueZDriver>, Error> {
        let dispatcher = mainloop::dispatcher();
        let (tx, rx) = mpsc::unbounded();
        std::thread::Builder::new()
            .name("solstice-bt-bus".into())
            .spawn(move || {
                if let Err(err) = futures::executor::block_on(bus_main(dispatcher.clone(), rx)) {
                    error!(?err, "bus thread exited");
                    post(&dispatcher, BusEvent::BusLost);
                }
            })
            .map_err(|_| Error::NoResources)?;
        Ok(Rc::new(BlueZDriver { commands: tx }))
    }

    fn send(&self, command: Command) {
        if self.commands.unbounded_send(command).is_err() {
            warn!("bus thread is gone, dropping command");
        }
    }
}

impl BusDriver for BlueZDriver {
    fn set_powered(&self, adapter: &str, powered: bool) {
        self.send(Command::SetPowered {
            adapter: adapter.into(),
            powered,
        });
    }

    fn start_discovery(&self, adapter: &str, transport: Transport) {
        self.send(Command::StartDiscovery {
            adapter: adapter.into(),
            transport,
        });
    }

    fn stop_discovery(&self, adapter: &str) {
        self.send(Command::StopDiscovery {
            adapter: adapter.into(),
        });
    }

    fn connect_device(&self, device: &str) {
        self.send(Command::ConnectDevice {
            device: device.into(),
        });
    }

    fn disconnect_device(&self, device: &str) {
        self.send(Command::DisconnectDevice {
            device: device.into(),
        });
    }

    fn register_application(&self, app_id: u32, table: &AttrTable, paths: &[String]) {
        let mut attrs = Vec::new();
        let mut service = String::new();
        let mut chr = String::new();
        for (attr, path) in table.iter().zip(paths) {
            let flags = match attr.kind {
                AttrType::Characteristic => {
                    attr.chr_flags.to_strings().iter().map(|s| s.to_string()).collect()
                }
                AttrType::Descriptor => {
                    attr.desc_flags.to_strings().iter().map(|s| s.to_string()).collect()
                }
                _ => Vec::new(),
            };
            let parent = match attr.kind {
                AttrType::Service => {
                    service = path.clone();
                    String::new()
                }
                AttrType::Characteristic => {
                    chr = path.clone();
                    service.clone()
                }
                AttrType::Descriptor => chr.clone(),
                AttrType::Invalid => continue,
            };
            attrs.push(ServedAttr {
                kind: attr.kind,
                path: path.clone(),
                uuid: attr.uuid.to_string(),
                flags,
                parent,
            });
        }
        self.send(Command::Register { app_id, attrs });
    }

    fn unregister_application(&self, app_id: u32) {
        self.send(Command::Unregister { app_id });
    }

    fn emit_value_changed(&self, attr_path: &str, value: &[u8]) {
        self.send(Command::EmitValue {
            path: attr_path.into(),
            value: value.to_vec(),
        });
    }

    fn read_remote(&self, token: u64, attr_path: &str) {
        self.send(Command::ReadRemote {
            token,
            path: attr_path.into(),
        });
    }

    fn write_remote(&self, token: u64, attr_path: &str, value: &[u8]) {
        self.send(Command::WriteRemote {
            token,
            path: attr_path.into(),
            value: value.to_vec(),
        });
    }

    fn subscribe_remote(&self, attr_path: &str) {
        self.send(Command::Subscribe {
            path: attr_path.into(),
        });
    }

    fn unsubscribe_remote(&self, attr_path: &str) {
        self.send(Command::Unsubscribe {
            path: attr_path.into(),
        });
    }
}

fn post(dispatcher: &Dispatcher, event: BusEvent) {
    if dispatcher
        .post(move || context::handle_event(event))
        .is_err()
    {
        warn!("main loop is gone, dropping bus event");
    }
}

fn bus_error(err: zbus::Error) -> Error {
    Error::Io(std::io::Error::other(err.to_string()))
}

fn prop<T>(props: &HashMap<String, OwnedValue>, name: &str) -> Option<T>
where
    T: TryFrom<OwnedValue>,
{
    props.get(name).and_then(|v| T::try_from(v.clone()).ok())
}

fn device_update(props: &HashMap<String, OwnedValue>) -> DeviceUpdate {
    DeviceUpdate {
        address: prop::<String>(props, "Address").and_then(|s| Address::from_str(&s).ok()),
        name: prop(props, "Name"),
        paired: prop(props, "Paired"),
        connected: prop(props, "Connected"),
        rssi: prop(props, "RSSI"),
        uuids: prop::<Vec<String>>(props, "UUIDs").map(|uuids| {
            uuids
                .iter()
                .filter_map(|u| Uuid::from_str(u).ok())
                .collect()
        }),
        services_resolved: prop(props, "ServicesResolved"),
    }
}

/// `/org/bluez/hci0/dev_X/serviceY/...` back to the device node.
fn device_of(path: &str) -> Option<String> {
    let at = path.find("/service")?;
    Some(path[..at].to_string())
}

fn remote_attr_event(
    path: &str,
    iface: &str,
    props: &HashMap<String, OwnedValue>,
) -> Option<BusEvent> {
    let kind = match iface {
        "org.bluez.GattService1" => RemoteAttrKind::Service,
        "org.bluez.GattCharacteristic1" => RemoteAttrKind::Characteristic,
        "org.bluez.GattDescriptor1" => RemoteAttrKind::Descriptor,
        _ => return None,
    };
    let uuid = Uuid::from_str(&prop::<String>(props, "UUID")?).ok()?;
    let flags = prop::<Vec<String>>(props, "Flags").unwrap_or_default();
    Some(BusEvent::AttrDiscovered {
        device: device_of(path)?,
        path: path.to_string(),
        kind,
        uuid,
        chr_flags: ChrFlags::from_strings(flags.iter().map(|s| s.as_str())),
        desc_flags: DescFlags::from_strings(flags.iter().map(|s| s.as_str())),
    })
}

fn object_events(
    dispatcher: &Dispatcher,
    path: &str,
    interfaces: &HashMap<String, HashMap<String, OwnedValue>>,
) {
    if let Some(props) = interfaces.get("org.bluez.Adapter1") {
        post(
            dispatcher,
            BusEvent::AdapterAdded {
                path: path.to_string(),
                powered: prop(props, "Powered").unwrap_or(false),
            },
        );
    }
    if let Some(props) = interfaces.get("org.bluez.Device1") {
        post(
            dispatcher,
            BusEvent::DeviceAdded {
                path: path.to_string(),
                update: device_update(props),
            },
        );
    }
    for (iface, props) in interfaces {
        if let Some(event) = remote_attr_event(path, iface, props) {
            post(dispatcher, event);
        }
    }
}

struct Service {
    uuid: String,
}

#[interface(name = "org.bluez.GattService1")]
impl Service {
    #[zbus(property)]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        true
    }
}

struct Characteristic {
    uuid: String,
    flags: Vec<String>,
    service: OwnedObjectPath,
    path: String,
    value: Vec<u8>,
    dispatcher: Dispatcher,
}

async fn forward_read(dispatcher: &Dispatcher, path: String) -> zbus::fdo::Result<Vec<u8>> {
    let (tx, rx) = oneshot::channel();
    dispatcher
        .post(move || {
            context::local_read(
                &path,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
        })
        .map_err(|_| zbus::fdo::Error::Failed("main loop is gone".into()))?;
    match rx.await {
        Ok(Ok(value)) => Ok(value.unwrap_or_default()),
        Ok(Err(err)) => Err(zbus::fdo::Error::Failed(err.to_string())),
        Err(_) => Err(zbus::fdo::Error::Failed("operation dropped".into())),
    }
}

async fn forward_write(
    dispatcher: &Dispatcher,
    path: String,
    value: Vec<u8>,
) -> zbus::fdo::Result<()> {
    let (tx, rx) = oneshot::channel();
    dispatcher
        .post(move || {
            context::local_write(
                &path,
                value,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
        })
        .map_err(|_| zbus::fdo::Error::Failed("main loop is gone".into()))?;
    match rx.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(zbus::fdo::Error::Failed(err.to_string())),
        Err(_) => Err(zbus::fdo::Error::Failed("operation dropped".into())),
    }
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl Characteristic {
    #[zbus(property)]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    #[zbus(property)]
    fn service(&self) -> OwnedObjectPath {
        self.service.clone()
    }

    #[zbus(property)]
    fn value(&self) -> Vec<u8> {
        self.value.clone()
    }

    async fn read_value(
        &self,
        _options: HashMap<String, OwnedValue>,
    ) -> zbus::fdo::Result<Vec<u8>> {
        forward_read(&self.dispatcher, self.path.clone()).await
    }

    async fn write_value(
        &self,
        value: Vec<u8>,
        _options: HashMap<String, OwnedValue>,
    ) -> zbus::fdo::Result<()> {
        forward_write(&self.dispatcher, self.path.clone(), value).await
    }
}

struct Descriptor {
    uuid: String,
    flags: Vec<String>,
    characteristic: OwnedObjectPath,
    path: String,
    dispatcher: Dispatcher,
}

#[interface(name = "org.bluez.GattDescriptor1")]
impl Descriptor {
    #[zbus(property)]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    #[zbus(property)]
    fn characteristic(&self) -> OwnedObjectPath {
        self.characteristic.clone()
    }

    async fn read_value(
        &self,
        _options: HashMap<String, OwnedValue>,
    ) -> zbus::fdo::Result<Vec<u8>> {
        forward_read(&self.dispatcher, self.path.clone()).await
    }

    async fn write_value(
        &self,
        value: Vec<u8>,
        _options: HashMap<String, OwnedValue>,
    ) -> zbus::fdo::Result<()> {
        forward_write(&self.dispatcher, self.path.clone(), value).await
    }
}

struct Bus {
    conn: Connection,
    dispatcher: Dispatcher,
    adapter: Option<String>,
    apps: HashMap<u32, Vec<String>>,
}

impl Bus {
    async fn serve(&self, app_id: u32, attrs: Vec<ServedAttr>) -> zbus::Result<Vec<String>> {
        let server = self.conn.object_server();
        let base = format!("/org/solstice/gatt{app_id}");
        server.at(base.as_str(), zbus::fdo::ObjectManager).await?;
        let mut paths = vec![base.clone()];
        for attr in attrs {
            match attr.kind {
                AttrType::Service => {
                    server
                        .at(attr.path.as_str(), Service { uuid: attr.uuid })
                        .await?;
                }
                AttrType::Characteristic => {
                    server
                        .at(
                            attr.path.as_str(),
                            Characteristic {
                                uuid: attr.uuid,
                                flags: attr.flags,
                                service: OwnedObjectPath::try_from(attr.parent.as_str())?,
                                path: attr.path.clone(),
                                value: Vec::new(),
                                dispatcher: self.dispatcher.clone(),
                            },
                        )
                        .await?;
                }
                AttrType::Descriptor => {
                    server
                        .at(
                            attr.path.as_str(),
                            Descriptor {
                                uuid: attr.uuid,
                                flags: attr.flags,
                                characteristic: OwnedObjectPath::try_from(attr.parent.as_str())?,
                                path: attr.path.clone(),
                                dispatcher: self.dispatcher.clone(),
                            },
                        )
                        .await?;
                }
                AttrType::Invalid => {}
            }
            paths.push(attr.path);
        }
        if let Some(adapter) = &self.adapter {
            let manager = GattManager1Proxy::builder(&self.conn)
                .path(adapter.as_str())?
                .build()
                .await?;
            manager
                .register_application(OwnedObjectPath::try_from(base.as_str())?, HashMap::new())
                .await?;
        }
        Ok(paths)
    }

    async fn unserve(&mut self, app_id: u32) -> zbus::Result<()> {
        let Some(paths) = self.apps.remove(&app_id) else {
            return Ok(());
        };
        if let (Some(adapter), Some(base)) = (&self.adapter, paths.first()) {
            let manager = GattManager1Proxy::builder(&self.conn)
                .path(adapter.as_str())?
                .build()
                .await?;
            if let Err(err) = manager
                .unregister_application(OwnedObjectPath::try_from(base.as_str())?)
                .await
            {
                debug!(?err, "unregister application");
            }
        }
        let server = self.conn.object_server();
        for path in paths.iter().rev() {
            if path.contains("/desc") {
                server.remove::<Descriptor, _>(path.as_str()).await?;
            } else if path.contains("/chr") {
                server.remove::<Characteristic, _>(path.as_str()).await?;
            } else if path.contains("/service") {
                server.remove::<Service, _>(path.as_str()).await?;
            } else {
                server
                    .remove::<zbus::fdo::ObjectManager, _>(path.as_str())
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Option<LocalBoxFuture<'static, ()>> {
        match command {
            Command::SetPowered { adapter, powered } => {
                let proxy = self.adapter_proxy(&adapter).await?;
                Some(
                    async move {
                        if let Err(err) = proxy.set_powered(powered).await {
                            warn!(?err, "set powered");
                        }
                    }
                    .boxed_local(),
                )
            }
            Command::StartDiscovery { adapter, transport } => {
                self.adapter = Some(adapter.clone());
                let proxy = self.adapter_proxy(&adapter).await?;
                Some(
                    async move {
                        let mut filter = HashMap::new();
                        if let Ok(value) = OwnedValue::try_from(zbus::zvariant::Value::from(
                            transport.as_str().to_string(),
                        )) {
                            filter.insert("Transport".to_string(), value);
                        }
                        if let Err(err) = proxy.set_discovery_filter(filter).await {
                            debug!(?err, "discovery filter");
                        }
                        if let Err(err) = proxy.start_discovery().await {
                            warn!(?err, "start discovery");
                        }
                    }
                    .boxed_local(),
                )
            }
            Command::StopDiscovery { adapter } => {
                let proxy = self.adapter_proxy(&adapter).await?;
                Some(
                    async move {
                        if let Err(err) = proxy.stop_discovery().await {
                            debug!(?err, "stop discovery");
                        }
                    }
                    .boxed_local(),
                )
            }
            Command::ConnectDevice { device } => {
                let proxy = self.device_proxy(&device).await?;
                let dispatcher = self.dispatcher.clone();
                Some(
                    async move {
                        let result = proxy.connect().await.map_err(bus_error);
                        post(&dispatcher, BusEvent::ConnectReply {
                            path: device,
                            result,
                        });
                    }
                    .boxed_local(),
                )
            }
            Command::DisconnectDevice { device } => {
                let proxy = self.device_proxy(&device).await?;
                Some(
                    async move {
                        if let Err(err) = proxy.disconnect().await {
                            debug!(?err, "disconnect");
                        }
                    }
                    .boxed_local(),
                )
            }
            Command::Register { app_id, attrs } => {
                match self.serve(app_id, attrs).await {
                    Ok(paths) => {
                        self.apps.insert(app_id, paths);
                    }
                    Err(err) => warn!(?err, app_id, "gatt registration failed"),
                }
                None
            }
            Command::Unregister { app_id } => {
                if let Err(err) = self.unserve(app_id).await {
                    warn!(?err, app_id, "gatt unregistration failed");
                }
                None
            }
            Command::EmitValue { path, value } => {
                if let Err(err) = self.emit_value(&path, value).await {
                    warn!(?err, path, "value change signal failed");
                }
                None
            }
            Command::ReadRemote { token, path } => {
                let proxy = self.chr_proxy(&path).await?;
                let dispatcher = self.dispatcher.clone();
                Some(
                    async move {
                        let result = proxy.read_value(HashMap::new()).await.map_err(bus_error);
                        post(&dispatcher, BusEvent::RemoteReadReply { token, result });
                    }
                    .boxed_local(),
                )
            }
            Command::WriteRemote { token, path, value } => {
                let proxy = self.chr_proxy(&path).await?;
                let dispatcher = self.dispatcher.clone();
                Some(
                    async move {
                        let result = proxy
                            .write_value(value, HashMap::new())
                            .await
                            .map_err(bus_error);
                        post(&dispatcher, BusEvent::RemoteWriteReply { token, result });
                    }
                    .boxed_local(),
                )
            }
            Command::Subscribe { path } => {
                let proxy = self.chr_proxy(&path).await?;
                Some(
                    async move {
                        if let Err(err) = proxy.start_notify().await {
                            warn!(?err, "start notify");
                        }
                    }
                    .boxed_local(),
                )
            }
            Command::Unsubscribe { path } => {
                let proxy = self.chr_proxy(&path).await?;
                Some(
                    async move {
                        if let Err(err) = proxy.stop_notify().await {
                            debug!(?err, "stop notify");
                        }
                    }
                    .boxed_local(),
                )
            }
        }
    }

    async fn emit_value(&self, path: &str, value: Vec<u8>) -> zbus::Result<()> {
        let iface = self
            .conn
            .object_server()
            .interface::<_, Characteristic>(path)
            .await?;
        iface.get_mut().await.value = value;
        iface
            .get()
            .await
            .value_changed(iface.signal_emitter())
            .await?;
        Ok(())
    }

    async fn adapter_proxy(&self, path: &str) -> Option<Adapter1Proxy<'static>> {
        Adapter1Proxy::builder(&self.conn)
            .path(path.to_string())
            .ok()?
            .build()
            .await
            .ok()
    }

    async fn device_proxy(&self, path: &str) -> Option<Device1Proxy<'static>> {
        Device1Proxy::builder(&self.conn)
            .path(path.to_string())
            .ok()?
            .build()
            .await
            .ok()
    }

    async fn chr_proxy(&self, path: &str) -> Option<RemoteCharacteristicProxy<'static>> {
        RemoteCharacteristicProxy::builder(&self.conn)
            .path(path.to_string())
            .ok()?
            .build()
            .await
            .ok()
    }
}

fn properties_event(path: String, iface: &str, props: HashMap<String, OwnedValue>) -> Option<BusEvent> {
    match iface {
        "org.bluez.Adapter1" => Some(BusEvent::PoweredChanged {
            powered: prop(&props, "Powered")?,
            path,
        }),
        "org.bluez.Device1" => Some(BusEvent::DeviceChanged {
            update: device_update(&props),
            path,
        }),
        "org.bluez.GattCharacteristic1" => Some(BusEvent::RemoteValueChanged {
            value: prop(&props, "Value")?,
            path,
        }),
        _ => None,
    }
}

async fn bus_main(
    dispatcher: Dispatcher,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> zbus::Result<()> {
    let conn = Connection::system().await?;
    let object_manager = zbus::fdo::ObjectManagerProxy::builder(&conn)
        .destination(BLUEZ)?
        .path("/")?
        .build()
        .await?;
    let mut added = object_manager.receive_interfaces_added().await?;
    let mut removed = object_manager.receive_interfaces_removed().await?;
    let props_rule = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(BLUEZ)?
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .build();
    let mut props = MessageStream::for_match_rule(props_rule, &conn, None).await?;

    for (path, interfaces) in object_manager.get_managed_objects().await? {
        let interfaces = interfaces
            .into_iter()
            .map(|(name, props)| (name.to_string(), props))
            .collect();
        object_events(&dispatcher, path.as_str(), &interfaces);
    }

    let mut bus = Bus {
        conn,
        dispatcher: dispatcher.clone(),
        adapter: None,
        apps: HashMap::new(),
    };
    let mut tasks: FuturesUnordered<LocalBoxFuture<'static, ()>> = FuturesUnordered::new();

    loop {
        futures::select! {
            command = commands.next() => {
                let Some(command) = command else { break };
                if let Command::SetPowered { adapter, .. } = &command {
                    // remember the adapter for gatt registration
                    bus.adapter = Some(adapter.clone());
                }
                if let Some(task) = bus.handle(command).await {
                    tasks.push(task);
                }
            }
            signal = added.next().fuse() => {
                let Some(signal) = signal else { break };
                if let Ok(args) = signal.args() {
                    let interfaces = args
                        .interfaces_and_properties
                        .iter()
                        .map(|(name, props)| {
                            (name.to_string(), props.iter().map(|(k, v)| {
                                (k.to_string(), v.try_to_owned())
                            })
                            .filter_map(|(k, v)| v.ok().map(|v| (k, v)))
                            .collect())
                        })
                        .collect();
                    object_events(&dispatcher, args.object_path.as_str(), &interfaces);
                }
            }
            signal = removed.next().fuse() => {
                let Some(signal) = signal else { break };
                if let Ok(args) = signal.args() {
                    let path = args.object_path.to_string();
                    for iface in args.interfaces.iter() {
                        match iface.as_str() {
                            "org.bluez.Adapter1" => post(&dispatcher, BusEvent::AdapterRemoved { path: path.clone() }),
                            "org.bluez.Device1" => post(&dispatcher, BusEvent::DeviceRemoved { path: path.clone() }),
                            _ => {}
                        }
                    }
                }
            }
            message = props.try_next().fuse() => {
                let Ok(Some(message)) = message else { break };
                let header = message.header();
                let Some(path) = header.path() else { continue };
                let body = message.body();
                if let Ok((iface, changed, _invalidated)) =
                    body.deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                {
                    if let Some(event) = properties_event(path.to_string(), &iface, changed) {
                        post(&dispatcher, event);
                    }
                }
            }
            _ = tasks.select_next_some() => {}
        }
    }
    post(&dispatcher, BusEvent::BusLost);
    Ok(())
}
