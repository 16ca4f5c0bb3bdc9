//! The tagged value union realising the D-Bus type grammar.

use std::os::unix::io::RawFd;

use super::signature::Signature;
use super::signature::SingleCompleteTypeSignature;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Basic(BasicType),
    Container(ContainerType),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BasicType {
    DBusByte(DBusByte),
    DBusBoolean(DBusBoolean),
    DBusInt16(DBusInt16),
    DBusUint16(DBusUint16),
    DBusInt32(DBusInt32),
    DBusUint32(DBusUint32),
    DBusInt64(DBusInt64),
    DBusUint64(DBusUint64),
    DBusDouble(DBusDouble),
    DBusString(DBusString),
    DBusObjectPath(DBusObjectPath),
    DBusSignature(DBusSignature),
    DBusUnixFileDescriptor(DBusUnixFileDescriptor),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerType {
    DBusArray(DBusArray),
    DBusStruct(DBusStruct),
    DBusVariant(DBusVariant),
    DBusDictEntry(DBusDictEntry),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusByte {
    pub u8: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusBoolean {
    pub bool: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusInt16 {
    pub i16: i16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusUint16 {
    pub u16: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusInt32 {
    pub i32: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusUint32 {
    pub u32: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusInt64 {
    pub i64: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusUint64 {
    pub u64: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusDouble {
    pub f64: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DBusString {
    pub string: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DBusObjectPath {
    pub dbus_string: DBusString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DBusSignature {
    pub vec: Vec<SingleCompleteTypeSignature>,
}

/// A unix file descriptor. The value carries the resolved descriptor; on the
/// wire it is an index into the out-of-band fd table of its message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DBusUnixFileDescriptor {
    pub fd: RawFd,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DBusArray {
    pub item_type: SingleCompleteTypeSignature,
    pub items: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DBusStruct {
    pub fields: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DBusVariant {
    pub variant: Box<Type>,
}

/// Key/value pair. Occurs only as the element of an array; the key must be a
/// basic type.
#[derive(Debug, Clone, PartialEq)]
pub struct DBusDictEntry {
    pub key: BasicType,
    pub value: Box<Type>,
}

/// Check a string against the D-Bus object path grammar: `/`, or `/`-separated
/// non-empty segments of `[A-Za-z0-9_]`.
pub fn validate_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..]
        .split('/')
        .all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
}

impl DBusString {
    pub fn new<T>(t: T) -> Self
    where
        T: Into<String>,
    {
        Self { string: t.into() }
    }
}

impl From<&str> for DBusString {
    fn from(t: &str) -> Self {
        Self::new(t)
    }
}

impl From<String> for DBusString {
    fn from(t: String) -> Self {
        Self::new(t)
    }
}

impl DBusObjectPath {
    /// Validates the path grammar eagerly. The marshaller re-checks, so a
    /// path built through [From] is still caught before it hits the wire.
    pub fn new<T>(t: T) -> crate::Result<Self>
    where
        T: Into<String>,
    {
        let string = t.into();
        if !validate_object_path(&string) {
            return Err(crate::ProtocolError::BadObjectPath(string).into());
        }
        Ok(Self {
            dbus_string: DBusString { string },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.dbus_string.string
    }
}

impl From<&str> for DBusObjectPath {
    fn from(t: &str) -> Self {
        Self {
            dbus_string: DBusString::new(t),
        }
    }
}

impl From<String> for DBusObjectPath {
    fn from(t: String) -> Self {
        Self {
            dbus_string: DBusString::new(t),
        }
    }
}

impl DBusArray {
    pub fn new(item_type: SingleCompleteTypeSignature) -> Self {
        Self {
            item_type,
            items: Vec::new(),
        }
    }

    /// An empty `a{KV}` dict.
    pub fn new_dict(
        key: SingleCompleteTypeSignature,
        value: SingleCompleteTypeSignature,
    ) -> Self {
        Self::new(SingleCompleteTypeSignature::DBusDictEntry {
            key: Box::new(key),
            value: Box::new(value),
        })
    }

    pub fn push<T: Into<Type>>(&mut self, item: T) {
        self.items.push(item.into());
    }
}

impl DBusStruct {
    pub fn new(fields: Vec<Type>) -> Self {
        Self { fields }
    }
}

impl DBusVariant {
    pub fn new<T: Into<Type>>(t: T) -> Self {
        Self {
            variant: Box::new(t.into()),
        }
    }
}

impl DBusDictEntry {
    pub fn new<K: Into<BasicType>, V: Into<Type>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: Box::new(value.into()),
        }
    }
}

impl Type {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Type::Basic(BasicType::DBusString(s)) => Some(&s.string),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&str> {
        match self {
            Type::Basic(BasicType::DBusObjectPath(p)) => Some(p.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Type::Basic(BasicType::DBusUint32(v)) => Some(v.u32),
            _ => None,
        }
    }

    /// The value inside a variant.
    pub fn as_variant(&self) -> Option<&Type> {
        match self {
            Type::Container(ContainerType::DBusVariant(v)) => Some(&v.variant),
            _ => None,
        }
    }

    /// Interpret an `a{s…}` dict as a list of string-keyed entries, in wire
    /// order.
    pub fn as_string_dict(&self) -> Option<Vec<(&str, &Type)>> {
        let array = match self {
            Type::Container(ContainerType::DBusArray(a)) => a,
            _ => return None,
        };
        let mut entries = Vec::with_capacity(array.items.len());
        for item in &array.items {
            match item {
                Type::Container(ContainerType::DBusDictEntry(entry)) => match &entry.key {
                    BasicType::DBusString(key) => entries.push((key.string.as_str(), &*entry.value)),
                    _ => return None,
                },
                _ => return None,
            }
        }
        Some(entries)
    }
}

macro_rules! impl_from_basic {
    ($name:ident) => {
        impl From<$name> for BasicType {
            fn from(t: $name) -> Self {
                BasicType::$name(t)
            }
        }

        impl From<$name> for Type {
            fn from(t: $name) -> Self {
                Type::Basic(BasicType::$name(t))
            }
        }
    };
}

impl_from_basic!(DBusByte);
impl_from_basic!(DBusBoolean);
impl_from_basic!(DBusInt16);
impl_from_basic!(DBusUint16);
impl_from_basic!(DBusInt32);
impl_from_basic!(DBusUint32);
impl_from_basic!(DBusInt64);
impl_from_basic!(DBusUint64);
impl_from_basic!(DBusDouble);
impl_from_basic!(DBusString);
impl_from_basic!(DBusObjectPath);
impl_from_basic!(DBusSignature);
impl_from_basic!(DBusUnixFileDescriptor);

macro_rules! impl_from_container {
    ($name:ident) => {
        impl From<$name> for ContainerType {
            fn from(t: $name) -> Self {
                ContainerType::$name(t)
            }
        }

        impl From<$name> for Type {
            fn from(t: $name) -> Self {
                Type::Container(ContainerType::$name(t))
            }
        }
    };
}

impl_from_container!(DBusArray);
impl_from_container!(DBusStruct);
impl_from_container!(DBusVariant);
impl_from_container!(DBusDictEntry);

impl From<BasicType> for Type {
    fn from(t: BasicType) -> Self {
        Type::Basic(t)
    }
}

impl From<ContainerType> for Type {
    fn from(t: ContainerType) -> Self {
        Type::Container(t)
    }
}

impl Signature for Type {
    fn signature(&self) -> SingleCompleteTypeSignature {
        match self {
            Type::Basic(inner) => inner.signature(),
            Type::Container(inner) => inner.signature(),
        }
    }
}

impl Signature for BasicType {
    fn signature(&self) -> SingleCompleteTypeSignature {
        match self {
            BasicType::DBusByte(inner) => inner.signature(),
            BasicType::DBusBoolean(inner) => inner.signature(),
            BasicType::DBusInt16(inner) => inner.signature(),
            BasicType::DBusUint16(inner) => inner.signature(),
            BasicType::DBusInt32(inner) => inner.signature(),
            BasicType::DBusUint32(inner) => inner.signature(),
            BasicType::DBusInt64(inner) => inner.signature(),
            BasicType::DBusUint64(inner) => inner.signature(),
            BasicType::DBusDouble(inner) => inner.signature(),
            BasicType::DBusString(inner) => inner.signature(),
            BasicType::DBusObjectPath(inner) => inner.signature(),
            BasicType::DBusSignature(inner) => inner.signature(),
            BasicType::DBusUnixFileDescriptor(inner) => inner.signature(),
        }
    }
}

impl Signature for ContainerType {
    fn signature(&self) -> SingleCompleteTypeSignature {
        match self {
            ContainerType::DBusArray(inner) => inner.signature(),
            ContainerType::DBusStruct(inner) => inner.signature(),
            ContainerType::DBusVariant(inner) => inner.signature(),
            ContainerType::DBusDictEntry(inner) => inner.signature(),
        }
    }
}

/// Implement [Signature] for types whose signature is a bare type code.
macro_rules! impl_to_signature {
    ($name:ident) => {
        impl Signature for $name {
            fn signature(&self) -> SingleCompleteTypeSignature {
                SingleCompleteTypeSignature::$name
            }
        }
    };
}

impl_to_signature!(DBusByte);
impl_to_signature!(DBusBoolean);
impl_to_signature!(DBusInt16);
impl_to_signature!(DBusUint16);
impl_to_signature!(DBusInt32);
impl_to_signature!(DBusUint32);
impl_to_signature!(DBusInt64);
impl_to_signature!(DBusUint64);
impl_to_signature!(DBusDouble);
impl_to_signature!(DBusString);
impl_to_signature!(DBusObjectPath);
impl_to_signature!(DBusSignature);
impl_to_signature!(DBusUnixFileDescriptor);
impl_to_signature!(DBusVariant);

impl Signature for DBusArray {
    fn signature(&self) -> SingleCompleteTypeSignature {
        SingleCompleteTypeSignature::DBusArray(Box::new(self.item_type.clone()))
    }
}

impl Signature for DBusStruct {
    fn signature(&self) -> SingleCompleteTypeSignature {
        SingleCompleteTypeSignature::DBusStruct {
            fields: self.fields.iter().map(|field| field.signature()).collect(),
        }
    }
}

impl Signature for DBusDictEntry {
    fn signature(&self) -> SingleCompleteTypeSignature {
        SingleCompleteTypeSignature::DBusDictEntry {
            key: Box::new(self.key.signature()),
            value: Box::new(self.value.signature()),
        }
    }
}
