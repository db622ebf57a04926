//! GATT attribute tables and pending-operation records.
//!
//! An attribute table is a flat sequence terminated by an [`AttrType::Invalid`]
//! entry; a characteristic must follow a service and a descriptor must follow
//! a characteristic. Registration sequencing, object-path layout and the
//! flag/string mapping live here; the bus machinery is the driver's problem.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use solstice::Error;

use crate::uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChrFlags: u16 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        const RELIABLE_WRITE = 1 << 7;
        const WRITABLE_AUXILIARIES = 1 << 8;
        const ENCRYPT_READ = 1 << 9;
        const ENCRYPT_WRITE = 1 << 10;
        const ENCRYPT_AUTHENTICATED_READ = 1 << 11;
        const ENCRYPT_AUTHENTICATED_WRITE = 1 << 12;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ENCRYPT_READ = 1 << 2;
        const ENCRYPT_WRITE = 1 << 3;
        const ENCRYPT_AUTHENTICATED_READ = 1 << 4;
        const ENCRYPT_AUTHENTICATED_WRITE = 1 << 5;
    }
}

const CHR_FLAG_TABLE: [(ChrFlags, &str); 13] = [
    (ChrFlags::BROADCAST, "broadcast"),
    (ChrFlags::READ, "read"),
    (ChrFlags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
    (ChrFlags::WRITE, "write"),
    (ChrFlags::NOTIFY, "notify"),
    (ChrFlags::INDICATE, "indicate"),
    (
        ChrFlags::AUTHENTICATED_SIGNED_WRITES,
        "authenticated-signed-writes",
    ),
    (ChrFlags::RELIABLE_WRITE, "reliable-write"),
    (ChrFlags::WRITABLE_AUXILIARIES, "writable-auxiliaries"),
    (ChrFlags::ENCRYPT_READ, "encrypt-read"),
    (ChrFlags::ENCRYPT_WRITE, "encrypt-write"),
    (
        ChrFlags::ENCRYPT_AUTHENTICATED_READ,
        "encrypt-authenticated-read",
    ),
    (
        ChrFlags::ENCRYPT_AUTHENTICATED_WRITE,
        "encrypt-authenticated-write",
    ),
];

const DESC_FLAG_TABLE: [(DescFlags, &str); 6] = [
    (DescFlags::READ, "read"),
    (DescFlags::WRITE, "write"),
    (DescFlags::ENCRYPT_READ, "encrypt-read"),
    (DescFlags::ENCRYPT_WRITE, "encrypt-write"),
    (
        DescFlags::ENCRYPT_AUTHENTICATED_READ,
        "encrypt-authenticated-read",
    ),
    (
        DescFlags::ENCRYPT_AUTHENTICATED_WRITE,
        "encrypt-authenticated-write",
    ),
];

impl ChrFlags {
    /// Every set bit as its bus string, in table order.
    pub fn to_strings(self) -> Vec<&'static str> {
        CHR_FLAG_TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Unknown strings are ignored.
    pub fn from_strings<'a>(names: impl IntoIterator<Item = &'a str>) -> ChrFlags {
        let mut flags = ChrFlags::empty();
        for name in names {
            if let Some((flag, _)) = CHR_FLAG_TABLE.iter().find(|(_, n)| *n == name) {
                flags |= *flag;
            }
        }
        flags
    }
}

impl DescFlags {
    pub fn to_strings(self) -> Vec<&'static str> {
        DESC_FLAG_TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_strings<'a>(names: impl IntoIterator<Item = &'a str>) -> DescFlags {
        let mut flags = DescFlags::empty();
        for name in names {
            if let Some((flag, _)) = DESC_FLAG_TABLE.iter().find(|(_, n)| *n == name) {
                flags |= *flag;
            }
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Service,
    Characteristic,
    Descriptor,
    /// Table terminator.
    Invalid,
}

/// Local-side operation callbacks get the pending record; the user answers
/// later with [`crate::pending_reply`].
pub type ReadCb = Box<dyn FnMut(&PendingRef)>;
pub type WriteCb = Box<dyn FnMut(&PendingRef, &[u8])>;

pub struct Attr {
    pub kind: AttrType,
    pub uuid: Uuid,
    pub chr_flags: ChrFlags,
    pub desc_flags: DescFlags,
    pub read: RefCell<Option<ReadCb>>,
    pub write: RefCell<Option<WriteCb>>,
}

impl Attr {
    pub fn service(uuid: Uuid) -> Attr {
        Attr {
            kind: AttrType::Service,
            uuid,
            chr_flags: ChrFlags::empty(),
            desc_flags: DescFlags::empty(),
            read: RefCell::new(None),
            write: RefCell::new(None),
        }
    }

    pub fn characteristic(uuid: Uuid, flags: ChrFlags) -> Attr {
        Attr {
            kind: AttrType::Characteristic,
            uuid,
            chr_flags: flags,
            desc_flags: DescFlags::empty(),
            read: RefCell::new(None),
            write: RefCell::new(None),
        }
    }

    pub fn descriptor(uuid: Uuid, flags: DescFlags) -> Attr {
        Attr {
            kind: AttrType::Descriptor,
            uuid,
            chr_flags: ChrFlags::empty(),
            desc_flags: flags,
            read: RefCell::new(None),
            write: RefCell::new(None),
        }
    }

    pub fn invalid() -> Attr {
        Attr {
            kind: AttrType::Invalid,
            uuid: Uuid::from_u16(0),
            chr_flags: ChrFlags::empty(),
            desc_flags: DescFlags::empty(),
            read: RefCell::new(None),
            write: RefCell::new(None),
        }
    }

    pub fn with_read(self, cb: ReadCb) -> Attr {
        *self.read.borrow_mut() = Some(cb);
        self
    }

    pub fn with_write(self, cb: WriteCb) -> Attr {
        *self.write.borrow_mut() = Some(cb);
        self
    }
}

/// Shared attribute table; registration keys off its identity, so
/// registering the same table twice is `AlreadyExists`.
pub type AttrTable = Rc<Vec<Attr>>;

/// Sequencing check over the entries before the terminator. Returns how
/// many entries precede it.
pub(crate) fn validate_table(attrs: &[Attr]) -> Result<usize, Error> {
    let mut seen_service = false;
    let mut seen_chr = false;
    for (idx, attr) in attrs.iter().enumerate() {
        match attr.kind {
            AttrType::Invalid => return Ok(idx),
            AttrType::Service => {
                seen_service = true;
                seen_chr = false;
            }
            AttrType::Characteristic => {
                if !seen_service {
                    return Err(Error::InvalidArgument);
                }
                seen_chr = true;
            }
            AttrType::Descriptor => {
                if !seen_chr {
                    return Err(Error::InvalidArgument);
                }
            }
        }
    }
    // missing terminator
    Err(Error::InvalidArgument)
}

/// Object paths under the per-application base path, one per table entry.
pub(crate) fn assign_paths(app_id: u32, attrs: &[Attr]) -> Vec<String> {
    let base = format!("/org/solstice/gatt{app_id}");
    let mut paths = Vec::with_capacity(attrs.len());
    let mut service = String::new();
    let mut chr = String::new();
    let (mut si, mut ci, mut di) = (0u32, 0u32, 0u32);
    for attr in attrs {
        match attr.kind {
            AttrType::Service => {
                service = format!("{base}/service{si}");
                si += 1;
                ci = 0;
                paths.push(service.clone());
            }
            AttrType::Characteristic => {
                chr = format!("{service}/chr{ci}");
                ci += 1;
                di = 0;
                paths.push(chr.clone());
            }
            AttrType::Descriptor => {
                paths.push(format!("{chr}/desc{di}"));
                di += 1;
            }
            AttrType::Invalid => {}
        }
    }
    paths
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    LocalRead,
    LocalWrite,
    Notify,
    Indicate,
    RemoteRead,
    RemoteWrite,
}

/// Answer channel back to the bus for local operations.
pub type LocalReply = Box<dyn FnOnce(Result<Option<Vec<u8>>, Error>)>;
/// Completion for remote operations; reads carry the payload.
pub type RemoteCb = Box<dyn FnOnce(Result<Option<Vec<u8>>, Error>)>;

pub struct Pending {
    pub(crate) id: u64,
    pub(crate) kind: PendingKind,
    pub(crate) attr_path: String,
    pub(crate) buf: RefCell<Option<Vec<u8>>>,
    pub(crate) reply: RefCell<Option<LocalReply>>,
    pub(crate) remote_cb: RefCell<Option<RemoteCb>>,
}

/// Handle to an in-flight operation awaiting [`crate::pending_reply`].
#[derive(Clone)]
pub struct PendingRef(pub(crate) Rc<Pending>);

impl PendingRef {
    pub fn kind(&self) -> PendingKind {
        self.0.kind
    }

    /// Payload of a local write, if any.
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.0.buf.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_strings_round_trip_in_table_order() {
        let flags = ChrFlags::WRITE | ChrFlags::NOTIFY | ChrFlags::BROADCAST;
        assert_eq!(flags.to_strings(), ["broadcast", "write", "notify"]);
        assert_eq!(
            ChrFlags::from_strings(["broadcast", "write", "notify"]),
            flags
        );
        let desc = DescFlags::READ | DescFlags::ENCRYPT_AUTHENTICATED_WRITE;
        assert_eq!(
            desc.to_strings(),
            ["read", "encrypt-authenticated-write"]
        );
        assert_eq!(DescFlags::from_strings(desc.to_strings()), desc);
    }

    #[test]
    fn unknown_flag_strings_are_ignored() {
        assert_eq!(
            ChrFlags::from_strings(["read", "levitate", "write"]),
            ChrFlags::READ | ChrFlags::WRITE
        );
        assert_eq!(DescFlags::from_strings(["levitate"]), DescFlags::empty());
    }

    #[test]
    fn sequencing_requires_parents() {
        let orphan_chr = vec![
            Attr::characteristic(Uuid::from_u16(0x2a00), ChrFlags::READ),
            Attr::invalid(),
        ];
        assert!(matches!(
            validate_table(&orphan_chr),
            Err(Error::InvalidArgument)
        ));

        let orphan_desc = vec![
            Attr::service(Uuid::from_u16(0x1800)),
            Attr::descriptor(Uuid::from_u16(0x2901), DescFlags::READ),
            Attr::invalid(),
        ];
        assert!(matches!(
            validate_table(&orphan_desc),
            Err(Error::InvalidArgument)
        ));

        let complete = vec![
            Attr::service(Uuid::from_u16(0x1800)),
            Attr::characteristic(Uuid::from_u16(0x2a00), ChrFlags::READ),
            Attr::descriptor(Uuid::from_u16(0x2901), DescFlags::READ),
            Attr::invalid(),
        ];
        assert_eq!(validate_table(&complete).unwrap(), 3);

        let unterminated = vec![Attr::service(Uuid::from_u16(0x1800))];
        assert!(matches!(
            validate_table(&unterminated),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn paths_nest_service_chr_desc() {
        let table = vec![
            Attr::service(Uuid::from_u16(0x1800)),
            Attr::characteristic(Uuid::from_u16(0x2a00), ChrFlags::READ),
            Attr::descriptor(Uuid::from_u16(0x2901), DescFlags::READ),
            Attr::characteristic(Uuid::from_u16(0x2a01), ChrFlags::READ),
            Attr::service(Uuid::from_u16(0x1801)),
        ];
        let paths = assign_paths(3, &table);
        assert_eq!(
            paths,
            [
                "/org/solstice/gatt3/service0",
                "/org/solstice/gatt3/service0/chr0",
                "/org/solstice/gatt3/service0/chr0/desc0",
                "/org/solstice/gatt3/service0/chr1",
                "/org/solstice/gatt3/service1",
            ]
        );
    }
}
