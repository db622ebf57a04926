//! Process-singleton Bluetooth context.
//!
//! Everything lives on the main thread: the adapter state machine, the
//! device table, sessions, scans, connections and the pending-operation
//! vector. Bus callbacks never run while the context is borrowed; every
//! user callback and driver call is queued under the borrow and dispatched
//! after it is released.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags::bitflags;
use solstice::Error;
use tracing::{debug, warn};

use crate::driver::{BusDriver, BusEvent, DeviceUpdate, RemoteAttrKind};
use crate::gatt::{
    self, AttrTable, AttrType, LocalReply, Pending, PendingKind, PendingRef, RemoteCb,
};
use crate::uuid::Uuid;
use crate::{Address, DeviceInfo, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Off,
    On,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct DeviceMask: u8 {
        const ADDRESS = 1 << 0;
        const NAME = 1 << 1;
        const PAIRED = 1 << 2;
        const CONNECTED = 1 << 3;
        const RSSI = 1 << 4;
        const UUIDS = 1 << 5;
    }
}

const READY: DeviceMask = DeviceMask::ADDRESS.union(DeviceMask::NAME).union(DeviceMask::PAIRED);

struct RemoteAttr {
    path: String,
    kind: RemoteAttrKind,
    uuid: Uuid,
}

struct Device {
    path: String,
    mask: DeviceMask,
    info: DeviceInfo,
    attrs: Vec<RemoteAttr>,
    resolved: bool,
}

type SessionCb = Rc<RefCell<Box<dyn FnMut(bool)>>>;
type ScanCb = Rc<RefCell<Box<dyn FnMut(&DeviceInfo)>>>;
type ValueCb = Rc<RefCell<Box<dyn FnMut(&[u8])>>>;

struct SessionRec {
    id: u64,
    cb: SessionCb,
    notified: bool,
}

struct ScanRec {
    id: u64,
    transport: Transport,
    cb: ScanCb,
}

pub(crate) struct ConnShared {
    device_path: String,
    awaiting_reply: Cell<bool>,
    /// Cleared by explicit disconnect; a silent detach follows.
    armed: Cell<bool>,
    notified: Cell<bool>,
    detached: Cell<bool>,
    on_connect: RefCell<Option<Box<dyn FnMut(&Conn)>>>,
    on_disconnect: RefCell<Option<Box<dyn FnMut(&Conn)>>>,
    on_error: RefCell<Option<Box<dyn FnMut(&Conn, &Error)>>>,
}

/// Refcounted connection handle.
#[derive(Clone)]
pub struct Conn(Rc<ConnShared>);

struct Subscription {
    attr_path: String,
    cb: ValueCb,
}

struct Registration {
    app_id: u32,
    table: AttrTable,
    paths: Vec<String>,
    len: usize,
}

struct Context {
    driver: Rc<dyn BusDriver>,
    adapter: Option<String>,
    original_state: AdapterState,
    state: AdapterState,
    devices: Vec<Device>,
    sessions: Vec<SessionRec>,
    scans: Vec<ScanRec>,
    conns: Vec<Conn>,
    registrations: Vec<Registration>,
    pendings: Vec<Rc<Pending>>,
    cached_values: Vec<(String, Vec<u8>)>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
    next_app: u32,
}

thread_local! {
    static CTX: RefCell<Option<Context>> = const { RefCell::new(None) };
}

type Deferred = Vec<Box<dyn FnOnce()>>;

fn with_ctx<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CTX.with(|ctx| match ctx.borrow_mut().as_mut() {
        Some(ctx) => f(ctx),
        None => panic!("bluetooth API used before init()"),
    })
}

fn run(deferred: Deferred) {
    for action in deferred {
        action();
    }
}

/// Install the bus driver. One context per thread; a second `init` without
/// an intervening [`shutdown`] is `AlreadyExists`.
pub fn init(driver: Rc<dyn BusDriver>) -> Result<(), Error> {
    CTX.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.is_some() {
            return Err(Error::AlreadyExists);
        }
        *ctx = Some(Context {
            driver,
            adapter: None,
            original_state: AdapterState::Unknown,
            state: AdapterState::Unknown,
            devices: Vec::new(),
            sessions: Vec::new(),
            scans: Vec::new(),
            conns: Vec::new(),
            registrations: Vec::new(),
            pendings: Vec::new(),
            cached_values: Vec::new(),
            subscriptions: Vec::new(),
            next_id: 1,
            next_app: 1,
        });
        Ok(())
    })
}

pub fn shutdown() {
    let deferred = CTX.with(|ctx| {
        let mut deferred = Deferred::new();
        if let Some(ctx) = ctx.borrow_mut().take() {
            sweep_pendings(ctx.pendings, &mut deferred);
        }
        deferred
    });
    run(deferred);
}

pub fn is_initialized() -> bool {
    CTX.with(|ctx| ctx.borrow().is_some())
}

pub fn adapter_state() -> AdapterState {
    with_ctx(|ctx| ctx.state)
}

/// Feed one bus event through the state machine. Must run on the main
/// thread; the production driver posts these through the loop dispatcher.
pub fn handle_event(event: BusEvent) {
    let deferred = with_ctx(|ctx| ctx.apply(event));
    run(deferred);
}

impl Context {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn apply(&mut self, event: BusEvent) -> Deferred {
        let mut deferred = Deferred::new();
        match event {
            BusEvent::AdapterAdded { path, powered } => {
                if self.adapter.is_some() {
                    debug!(path, "ignoring extra adapter");
                    return deferred;
                }
                self.adapter = Some(path.clone());
                let state = if powered {
                    AdapterState::On
                } else {
                    AdapterState::Off
                };
                self.original_state = state;
                self.state = state;
                if powered {
                    self.on_powered(&mut deferred);
                } else if !self.sessions.is_empty() {
                    let driver = self.driver.clone();
                    deferred.push(Box::new(move || driver.set_powered(&path, true)));
                }
            }
            BusEvent::AdapterRemoved { path } => {
                if self.adapter.as_deref() != Some(path.as_str()) {
                    return deferred;
                }
                self.adapter = None;
                self.state = AdapterState::Unknown;
                self.original_state = AdapterState::Unknown;
                self.on_unpowered(&mut deferred);
            }
            BusEvent::PoweredChanged { path, powered } => {
                if self.adapter.as_deref() != Some(path.as_str()) {
                    return deferred;
                }
                if powered {
                    self.state = AdapterState::On;
                    self.on_powered(&mut deferred);
                } else {
                    self.state = AdapterState::Off;
                    self.on_unpowered(&mut deferred);
                }
            }
            BusEvent::DeviceAdded { path, update } | BusEvent::DeviceChanged { path, update } => {
                self.device_update(path, update, &mut deferred);
            }
            BusEvent::DeviceRemoved { path } => {
                self.detach_conns(&path, true, &mut deferred);
                self.devices.retain(|dev| dev.path != path);
            }
            BusEvent::ConnectReply { path, result } => {
                let failed: Vec<Conn> = self
                    .conns
                    .iter()
                    .filter(|conn| {
                        conn.0.device_path == path && conn.0.awaiting_reply.replace(false)
                    })
                    .cloned()
                    .filter(|_| result.is_err())
                    .collect();
                if let Err(err) = result {
                    let err = Rc::new(err);
                    for conn in failed {
                        conn.0.armed.set(false);
                        conn.0.detached.set(true);
                        self.conns.retain(|c| !Rc::ptr_eq(&c.0, &conn.0));
                        let err = err.clone();
                        deferred.push(Box::new(move || {
                            let cb = conn.0.on_error.borrow_mut().take();
                            if let Some(mut cb) = cb {
                                cb(&conn, &err);
                            }
                        }));
                    }
                }
            }
            BusEvent::AttrDiscovered {
                device,
                path,
                kind,
                uuid,
                chr_flags: _,
                desc_flags: _,
            } => {
                if let Some(dev) = self.devices.iter_mut().find(|d| d.path == device) {
                    dev.attrs.push(RemoteAttr { path, kind, uuid });
                }
            }
            BusEvent::RemoteReadReply { token, result } => {
                self.complete_remote(token, result.map(Some), &mut deferred);
            }
            BusEvent::RemoteWriteReply { token, result } => {
                self.complete_remote(token, result.map(|_| None), &mut deferred);
            }
            BusEvent::RemoteValueChanged { path, value } => {
                let value = Rc::new(value);
                for sub in &self.subscriptions {
                    if sub.attr_path == path {
                        let cb = sub.cb.clone();
                        let value = value.clone();
                        deferred.push(Box::new(move || (cb.borrow_mut())(&value)));
                    }
                }
            }
            BusEvent::BusLost => {
                warn!("bus connection lost");
                self.adapter = None;
                self.state = AdapterState::Unknown;
                self.original_state = AdapterState::Unknown;
                let pendings = std::mem::take(&mut self.pendings);
                sweep_pendings(pendings, &mut deferred);
                let paths: Vec<String> =
                    self.devices.iter().map(|dev| dev.path.clone()).collect();
                for path in paths {
                    self.detach_conns(&path, true, &mut deferred);
                }
                self.on_unpowered(&mut deferred);
            }
        }
        deferred
    }

    fn on_powered(&mut self, deferred: &mut Deferred) {
        for session in &mut self.sessions {
            if !session.notified {
                session.notified = true;
                let cb = session.cb.clone();
                deferred.push(Box::new(move || (cb.borrow_mut())(true)));
            }
        }
        if let (Some(adapter), Some(scan)) = (self.adapter.clone(), self.scans.first()) {
            let driver = self.driver.clone();
            let transport = scan.transport;
            deferred.push(Box::new(move || {
                driver.start_discovery(&adapter, transport)
            }));
        }
    }

    fn on_unpowered(&mut self, deferred: &mut Deferred) {
        for session in &mut self.sessions {
            if session.notified {
                session.notified = false;
                let cb = session.cb.clone();
                deferred.push(Box::new(move || (cb.borrow_mut())(false)));
            }
        }
    }

    fn device_update(&mut self, path: String, update: DeviceUpdate, deferred: &mut Deferred) {
        let scanning = !self.scans.is_empty();
        let connected = update.connected;
        let at = match self.devices.iter().position(|dev| dev.path == path) {
            Some(at) => at,
            None => {
                self.devices.push(Device {
                    path: path.clone(),
                    mask: DeviceMask::empty(),
                    info: DeviceInfo::default(),
                    attrs: Vec::new(),
                    resolved: false,
                });
                self.devices.len() - 1
            }
        };
        let device = &mut self.devices[at];
        if let Some(address) = update.address {
            device.info.address = address;
            device.mask |= DeviceMask::ADDRESS;
        }
        if let Some(name) = update.name {
            device.info.name = name;
            device.mask |= DeviceMask::NAME;
        }
        if let Some(paired) = update.paired {
            device.info.paired = paired;
            device.mask |= DeviceMask::PAIRED;
        }
        if let Some(connected) = update.connected {
            device.info.connected = connected;
            device.mask |= DeviceMask::CONNECTED;
        }
        if let Some(rssi) = update.rssi {
            device.info.rssi = rssi;
            device.mask |= DeviceMask::RSSI;
        }
        if let Some(uuids) = update.uuids {
            device.info.uuids = uuids;
            device.mask |= DeviceMask::UUIDS;
        }
        if let Some(resolved) = update.services_resolved {
            device.resolved = resolved;
            if !resolved {
                device.attrs.clear();
            }
        }
        if scanning {
            device.info.in_range = true;
        }
        let ready = device.mask.contains(READY);
        let info = device.info.clone();
        if ready {
            for scan in &self.scans {
                let cb = scan.cb.clone();
                let info = info.clone();
                deferred.push(Box::new(move || (cb.borrow_mut())(&info)));
            }
        }
        match connected {
            Some(true) => {
                for conn in &self.conns {
                    if conn.0.device_path == path && !conn.0.notified.replace(true) {
                        let conn = conn.clone();
                        deferred.push(Box::new(move || {
                            let mut cb = conn.0.on_connect.borrow_mut();
                            if let Some(cb) = cb.as_mut() {
                                cb(&conn);
                            }
                        }));
                    }
                }
            }
            Some(false) => self.detach_conns(&path, true, deferred),
            None => {}
        }
    }

    /// Detach every connection bound to `path`, newest first. Armed
    /// connections get their `on_disconnect` when `notify` is set.
    fn detach_conns(&mut self, path: &str, notify: bool, deferred: &mut Deferred) {
        let mut detached = Vec::new();
        let mut idx = self.conns.len();
        while idx > 0 {
            idx -= 1;
            if self.conns[idx].0.device_path == path {
                detached.push(self.conns.remove(idx));
            }
        }
        for conn in detached {
            conn.0.detached.set(true);
            conn.0.notified.set(false);
            if notify && conn.0.armed.get() {
                deferred.push(Box::new(move || {
                    let mut cb = conn.0.on_disconnect.borrow_mut();
                    if let Some(cb) = cb.as_mut() {
                        cb(&conn);
                    }
                }));
            }
        }
    }

    fn complete_remote(
        &mut self,
        token: u64,
        result: Result<Option<Vec<u8>>, Error>,
        deferred: &mut Deferred,
    ) {
        let Some(at) = self.pendings.iter().position(|p| p.id == token) else {
            return;
        };
        let pending = self.pendings.remove(at);
        deferred.push(Box::new(move || {
            if let Some(cb) = pending.remote_cb.borrow_mut().take() {
                cb(result);
            }
        }));
    }
}

fn sweep_pendings(pendings: Vec<Rc<Pending>>, deferred: &mut Deferred) {
    for pending in pendings {
        deferred.push(Box::new(move || {
            if let Some(reply) = pending.reply.borrow_mut().take() {
                reply(Err(Error::Cancelled));
            }
            if let Some(cb) = pending.remote_cb.borrow_mut().take() {
                cb(Err(Error::Cancelled));
            }
        }));
    }
}

/// Power session. The adapter stays on while at least one session exists;
/// dropping the last one restores the state observed at first attach.
pub struct Session {
    id: u64,
}

/// Attach a session. `cb(true)` fires when the adapter is powered, which is
/// immediate if it already is; `cb(false)` fires when power is lost.
pub fn enable(cb: impl FnMut(bool) + 'static) -> Session {
    let (session, deferred) = with_ctx(|ctx| {
        let mut deferred = Deferred::new();
        let id = ctx.next_id();
        let cb: SessionCb = Rc::new(RefCell::new(Box::new(cb)));
        let notified = ctx.state == AdapterState::On;
        ctx.sessions.push(SessionRec {
            id,
            cb: cb.clone(),
            notified,
        });
        if notified {
            deferred.push(Box::new(move || (cb.borrow_mut())(true)));
        } else if let Some(adapter) = ctx.adapter.clone() {
            if ctx.state == AdapterState::Off {
                let driver = ctx.driver.clone();
                deferred.push(Box::new(move || driver.set_powered(&adapter, true)));
            }
        }
        (Session { id }, deferred)
    });
    run(deferred);
    session
}

impl Session {
    pub fn disable(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        let id = self.id;
        let deferred = CTX.with(|ctx| {
            let mut deferred = Deferred::new();
            if let Ok(mut ctx) = ctx.try_borrow_mut() {
                if let Some(ctx) = ctx.as_mut() {
                    ctx.sessions.retain(|s| s.id != id);
                    if ctx.sessions.is_empty()
                        && ctx.original_state == AdapterState::Off
                        && ctx.state == AdapterState::On
                    {
                        if let Some(adapter) = ctx.adapter.clone() {
                            let driver = ctx.driver.clone();
                            deferred
                                .push(Box::new(move || driver.set_powered(&adapter, false)));
                        }
                    }
                }
            }
            deferred
        });
        run(deferred);
    }
}

pub struct ScanHandle {
    id: u64,
}

/// Subscribe to device discovery. The first subscriber starts discovery on
/// the adapter; later ones join the scan in flight. Devices already known
/// and ready are replayed to the new subscriber.
pub fn start_scan(transport: Transport, cb: impl FnMut(&DeviceInfo) + 'static) -> ScanHandle {
    let (handle, deferred) = with_ctx(|ctx| {
        let mut deferred = Deferred::new();
        let id = ctx.next_id();
        let cb: ScanCb = Rc::new(RefCell::new(Box::new(cb)));
        let first = ctx.scans.is_empty();
        ctx.scans.push(ScanRec {
            id,
            transport,
            cb: cb.clone(),
        });
        if first && ctx.state == AdapterState::On {
            if let Some(adapter) = ctx.adapter.clone() {
                let driver = ctx.driver.clone();
                deferred.push(Box::new(move || {
                    driver.start_discovery(&adapter, transport)
                }));
            }
        }
        for device in &mut ctx.devices {
            if device.mask.contains(READY) {
                device.info.in_range = true;
                let cb = cb.clone();
                let info = device.info.clone();
                deferred.push(Box::new(move || (cb.borrow_mut())(&info)));
            }
        }
        (ScanHandle { id }, deferred)
    });
    run(deferred);
    handle
}

impl ScanHandle {
    pub fn stop(self) {}
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        let id = self.id;
        let deferred = CTX.with(|ctx| {
            let mut deferred = Deferred::new();
            if let Ok(mut ctx) = ctx.try_borrow_mut() {
                if let Some(ctx) = ctx.as_mut() {
                    ctx.scans.retain(|s| s.id != id);
                    if ctx.scans.is_empty() {
                        for device in &mut ctx.devices {
                            device.info.in_range = false;
                        }
                        if let Some(adapter) = ctx.adapter.clone() {
                            let driver = ctx.driver.clone();
                            deferred.push(Box::new(move || driver.stop_discovery(&adapter)));
                        }
                    }
                }
            }
            deferred
        });
        run(deferred);
    }
}

/// Connect to a known device by address. The adapter must be on and the
/// device already discovered. `on_connect` fires once the device reports
/// itself connected; `on_disconnect` only fires for disconnects the user
/// did not ask for.
pub fn connect(
    addr: Address,
    on_connect: impl FnMut(&Conn) + 'static,
    on_disconnect: impl FnMut(&Conn) + 'static,
    on_error: impl FnMut(&Conn, &Error) + 'static,
) -> Result<Conn, Error> {
    let (conn, deferred) = with_ctx(|ctx| {
        if ctx.state != AdapterState::On {
            return Err(Error::InvalidArgument);
        }
        let device = ctx
            .devices
            .iter()
            .find(|dev| dev.mask.contains(DeviceMask::ADDRESS) && dev.info.address == addr)
            .ok_or(Error::NotFound)?;
        let path = device.path.clone();
        let conn = Conn(Rc::new(ConnShared {
            device_path: path.clone(),
            awaiting_reply: Cell::new(true),
            armed: Cell::new(true),
            notified: Cell::new(false),
            detached: Cell::new(false),
            on_connect: RefCell::new(Some(Box::new(on_connect))),
            on_disconnect: RefCell::new(Some(Box::new(on_disconnect))),
            on_error: RefCell::new(Some(Box::new(on_error))),
        }));
        ctx.conns.push(conn.clone());
        let driver = ctx.driver.clone();
        let deferred: Deferred = vec![Box::new(move || driver.connect_device(&path))];
        Ok((conn, deferred))
    })?;
    run(deferred);
    Ok(conn)
}

impl Conn {
    /// Tear the connection down. Explicit disconnect is silent; the
    /// `on_disconnect` callback is disarmed before the bus call goes out.
    pub fn disconnect(&self) {
        self.0.armed.set(false);
        if self.0.detached.replace(true) {
            return;
        }
        let deferred = with_ctx(|ctx| {
            ctx.conns.retain(|c| !Rc::ptr_eq(&c.0, &self.0));
            let driver = ctx.driver.clone();
            let path = self.0.device_path.clone();
            let deferred: Deferred = vec![Box::new(move || driver.disconnect_device(&path))];
            deferred
        });
        run(deferred);
    }

    pub fn is_connected(&self) -> bool {
        self.0.notified.get() && !self.0.detached.get()
    }

    /// Identity comparison between handles to the same connection.
    pub fn ptr_eq(a: &Conn, b: &Conn) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Snapshot of the peer device's properties.
    pub fn info(&self) -> Option<DeviceInfo> {
        with_ctx(|ctx| {
            ctx.devices
                .iter()
                .find(|dev| dev.path == self.0.device_path)
                .map(|dev| dev.info.clone())
        })
    }

    fn remote_attr(&self, ctx: &Context, uuid: &Uuid) -> Result<String, Error> {
        let device = ctx
            .devices
            .iter()
            .find(|dev| dev.path == self.0.device_path)
            .ok_or(Error::NotFound)?;
        device
            .attrs
            .iter()
            .find(|attr| attr.kind == RemoteAttrKind::Characteristic && attr.uuid == *uuid)
            .map(|attr| attr.path.clone())
            .ok_or(Error::NotFound)
    }

    /// Read a remote characteristic by UUID.
    pub fn read(&self, uuid: &Uuid, cb: RemoteCb) -> Result<(), Error> {
        if self.0.detached.get() {
            return Err(Error::InvalidArgument);
        }
        let deferred = with_ctx(|ctx| {
            let attr_path = self.remote_attr(ctx, uuid)?;
            let token = ctx.next_id();
            ctx.pendings.push(Rc::new(Pending {
                id: token,
                kind: PendingKind::RemoteRead,
                attr_path: attr_path.clone(),
                buf: RefCell::new(None),
                reply: RefCell::new(None),
                remote_cb: RefCell::new(Some(cb)),
            }));
            let driver = ctx.driver.clone();
            let deferred: Deferred = vec![Box::new(move || driver.read_remote(token, &attr_path))];
            Ok::<_, Error>(deferred)
        })?;
        run(deferred);
        Ok(())
    }

    /// Write a remote characteristic by UUID.
    pub fn write(&self, uuid: &Uuid, value: Vec<u8>, cb: RemoteCb) -> Result<(), Error> {
        if self.0.detached.get() {
            return Err(Error::InvalidArgument);
        }
        let deferred = with_ctx(|ctx| {
            let attr_path = self.remote_attr(ctx, uuid)?;
            let token = ctx.next_id();
            ctx.pendings.push(Rc::new(Pending {
                id: token,
                kind: PendingKind::RemoteWrite,
                attr_path: attr_path.clone(),
                buf: RefCell::new(Some(value.clone())),
                reply: RefCell::new(None),
                remote_cb: RefCell::new(Some(cb)),
            }));
            let driver = ctx.driver.clone();
            let deferred: Deferred = vec![Box::new(move || {
                driver.write_remote(token, &attr_path, &value)
            })];
            Ok::<_, Error>(deferred)
        })?;
        run(deferred);
        Ok(())
    }

    /// Deliver notifications/indications of a remote characteristic to `cb`.
    pub fn subscribe(&self, uuid: &Uuid, cb: impl FnMut(&[u8]) + 'static) -> Result<(), Error> {
        if self.0.detached.get() {
            return Err(Error::InvalidArgument);
        }
        let deferred = with_ctx(|ctx| {
            let attr_path = self.remote_attr(ctx, uuid)?;
            ctx.subscriptions.push(Subscription {
                attr_path: attr_path.clone(),
                cb: Rc::new(RefCell::new(Box::new(cb))),
            });
            let driver = ctx.driver.clone();
            let deferred: Deferred = vec![Box::new(move || driver.subscribe_remote(&attr_path))];
            Ok::<_, Error>(deferred)
        })?;
        run(deferred);
        Ok(())
    }

    pub fn unsubscribe(&self, uuid: &Uuid) -> Result<(), Error> {
        let deferred = with_ctx(|ctx| {
            let attr_path = self.remote_attr(ctx, uuid)?;
            ctx.subscriptions.retain(|sub| sub.attr_path != attr_path);
            let driver = ctx.driver.clone();
            let deferred: Deferred = vec![Box::new(move || driver.unsubscribe_remote(&attr_path))];
            Ok::<_, Error>(deferred)
        })?;
        run(deferred);
        Ok(())
    }
}

/// Register a GATT attribute table. Sequencing is validated first; the
/// table is then published object-by-object and `RegisterApplication` is
/// issued. Registering the identical table again is `AlreadyExists`.
pub fn register(table: &AttrTable) -> Result<u32, Error> {
    let (app_id, deferred) = with_ctx(|ctx| {
        if ctx
            .registrations
            .iter()
            .any(|reg| Rc::ptr_eq(&reg.table, table))
        {
            return Err(Error::AlreadyExists);
        }
        let len = gatt::validate_table(table)?;
        let app_id = ctx.next_app;
        ctx.next_app += 1;
        let paths = gatt::assign_paths(app_id, &table[..len]);
        ctx.registrations.push(Registration {
            app_id,
            table: table.clone(),
            paths: paths.clone(),
            len,
        });
        let driver = ctx.driver.clone();
        let table = table.clone();
        let deferred: Deferred = vec![Box::new(move || {
            driver.register_application(app_id, &table, &paths)
        })];
        Ok((app_id, deferred))
    })?;
    run(deferred);
    Ok(app_id)
}

/// Drop a registration. Pending operations against its attributes complete
/// with `Cancelled`.
pub fn unregister(app_id: u32) -> Result<(), Error> {
    let deferred = with_ctx(|ctx| {
        let at = ctx
            .registrations
            .iter()
            .position(|reg| reg.app_id == app_id)
            .ok_or(Error::NotFound)?;
        let reg = ctx.registrations.remove(at);
        let mut deferred = Deferred::new();
        let mut kept = Vec::new();
        for pending in std::mem::take(&mut ctx.pendings) {
            if reg.paths.iter().any(|p| *p == pending.attr_path) {
                sweep_pendings(vec![pending], &mut deferred);
            } else {
                kept.push(pending);
            }
        }
        ctx.pendings = kept;
        ctx.cached_values
            .retain(|(path, _)| !reg.paths.iter().any(|p| p == path));
        let driver = ctx.driver.clone();
        deferred.push(Box::new(move || driver.unregister_application(app_id)));
        Ok::<_, Error>(deferred)
    })?;
    run(deferred);
    Ok(())
}

fn local_op(
    attr_path: &str,
    kind: PendingKind,
    payload: Option<Vec<u8>>,
    reply: LocalReply,
) {
    let attr_path = attr_path.to_string();
    let deferred = with_ctx(|ctx| {
        let mut deferred = Deferred::new();
        let found = ctx.registrations.iter().find_map(|reg| {
            reg.paths
                .iter()
                .position(|p| *p == attr_path)
                .map(|idx| (reg.table.clone(), idx))
        });
        let Some((table, idx)) = found else {
            deferred.push(Box::new(move || reply(Err(Error::NotFound))));
            return deferred;
        };
        let wants_read = kind == PendingKind::LocalRead;
        let has_cb = if wants_read {
            table[idx].read.borrow().is_some()
        } else {
            table[idx].write.borrow().is_some()
        };
        if !has_cb {
            deferred.push(Box::new(move || reply(Err(Error::Unsupported))));
            return deferred;
        }
        let pending = Rc::new(Pending {
            id: ctx.next_id(),
            kind,
            attr_path,
            buf: RefCell::new(payload),
            reply: RefCell::new(Some(reply)),
            remote_cb: RefCell::new(None),
        });
        ctx.pendings.push(pending.clone());
        deferred.push(Box::new(move || {
            let handle = PendingRef(pending.clone());
            if wants_read {
                if let Some(cb) = table[idx].read.borrow_mut().as_mut() {
                    cb(&handle);
                }
            } else {
                let payload = pending.buf.borrow().clone().unwrap_or_default();
                if let Some(cb) = table[idx].write.borrow_mut().as_mut() {
                    cb(&handle, &payload);
                }
            }
        }));
        deferred
    });
    run(deferred);
}

/// Incoming `ReadValue` against a served attribute.
pub fn local_read(attr_path: &str, reply: LocalReply) {
    local_op(attr_path, PendingKind::LocalRead, None, reply);
}

/// Incoming `WriteValue` against a served attribute.
pub fn local_write(attr_path: &str, value: Vec<u8>, reply: LocalReply) {
    local_op(attr_path, PendingKind::LocalWrite, Some(value), reply);
}

fn update_op(app_id: u32, attr_index: usize, kind: PendingKind) -> Result<PendingRef, Error> {
    with_ctx(|ctx| {
        let attr_path = {
            let reg = ctx
                .registrations
                .iter()
                .find(|reg| reg.app_id == app_id)
                .ok_or(Error::NotFound)?;
            if attr_index >= reg.len || reg.table[attr_index].kind != AttrType::Characteristic {
                return Err(Error::InvalidArgument);
            }
            reg.paths[attr_index].clone()
        };
        let pending = Rc::new(Pending {
            id: ctx.next_id(),
            kind,
            attr_path,
            buf: RefCell::new(None),
            reply: RefCell::new(None),
            remote_cb: RefCell::new(None),
        });
        ctx.pendings.push(pending.clone());
        Ok(PendingRef(pending))
    })
}

/// Start a notification on a served characteristic; finish it with
/// [`pending_reply`] carrying the value.
pub fn notify(app_id: u32, attr_index: usize) -> Result<PendingRef, Error> {
    update_op(app_id, attr_index, PendingKind::Notify)
}

pub fn indicate(app_id: u32, attr_index: usize) -> Result<PendingRef, Error> {
    update_op(app_id, attr_index, PendingKind::Indicate)
}

/// Complete a pending operation. Always detaches the record; what else
/// happens depends on the kind:
/// - local read: method return with `buf`
/// - local write: empty method return
/// - notify/indicate: cache `buf` and emit a `Value` property change
/// - remote read/write: the user callback fires with the outcome
pub fn pending_reply(
    pending: PendingRef,
    result: Result<(), Error>,
    buf: Option<&[u8]>,
) -> Result<(), Error> {
    let buf = buf.map(|b| b.to_vec());
    let deferred = with_ctx(|ctx| {
        let at = ctx
            .pendings
            .iter()
            .position(|p| Rc::ptr_eq(p, &pending.0))
            .ok_or(Error::NotFound)?;
        let record = ctx.pendings.remove(at);
        let mut deferred = Deferred::new();
        match (record.kind, result) {
            (PendingKind::LocalRead, Ok(())) => {
                deferred.push(Box::new(move || {
                    if let Some(reply) = record.reply.borrow_mut().take() {
                        reply(Ok(Some(buf.unwrap_or_default())));
                    }
                }));
            }
            (PendingKind::LocalWrite, Ok(())) => {
                deferred.push(Box::new(move || {
                    if let Some(reply) = record.reply.borrow_mut().take() {
                        reply(Ok(None));
                    }
                }));
            }
            (PendingKind::Notify | PendingKind::Indicate, Ok(())) => {
                let value = buf.unwrap_or_default();
                *record.buf.borrow_mut() = Some(value.clone());
                ctx.cached_values
                    .push((record.attr_path.clone(), value.clone()));
                let driver = ctx.driver.clone();
                deferred.push(Box::new(move || {
                    driver.emit_value_changed(&record.attr_path, &value)
                }));
            }
            (PendingKind::RemoteRead, Ok(())) => {
                deferred.push(Box::new(move || {
                    if let Some(cb) = record.remote_cb.borrow_mut().take() {
                        cb(Ok(buf));
                    }
                }));
            }
            (PendingKind::RemoteWrite, Ok(())) => {
                deferred.push(Box::new(move || {
                    if let Some(cb) = record.remote_cb.borrow_mut().take() {
                        cb(Ok(None));
                    }
                }));
            }
            (_, Err(err)) => {
                // a record carries either a local reply or a remote cb
                deferred.push(Box::new(move || {
                    if let Some(reply) = record.reply.borrow_mut().take() {
                        reply(Err(err));
                    } else if let Some(cb) = record.remote_cb.borrow_mut().take() {
                        cb(Err(err));
                    }
                }));
            }
        }
        Ok::<_, Error>(deferred)
    })?;
    run(deferred);
    Ok(())
}

/// Cached value stored by the latest notify/indicate on `attr_path`. Reads
/// out exactly once.
pub fn take_cached_value(attr_path: &str) -> Option<Vec<u8>> {
    with_ctx(|ctx| {
        let at = ctx
            .cached_values
            .iter()
            .position(|(path, _)| path == attr_path)?;
        Some(ctx.cached_values.remove(at).1)
    })
}
