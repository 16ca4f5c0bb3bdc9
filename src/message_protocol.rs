//! Message frames: the fixed prologue, the header-field array, and the body.

pub mod body;

use std::convert::TryFrom;
use std::num::NonZeroU32;
use std::os::unix::io::RawFd;

use self::body::Body;
use crate::type_system::marshal::{Encoder, Marshal};
use crate::type_system::signature::{SingleCompleteTypeSignature, HEADER_FIELD_SIGNATURE};
use crate::type_system::types::*;
use crate::type_system::unmarshal::Decoder;
use crate::type_system::Endianness;
use crate::ProtocolError;

/// The fixed prologue plus the header-field array length: enough bytes to
/// compute the length of the whole frame.
pub const MIN_MESSAGE_SIZE: usize = 16;

const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;
const FLAG_NO_AUTO_START: u8 = 0x2;
const FLAG_ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn decimal_value(&self) -> u8 {
        match self {
            Self::MethodCall => 1,
            Self::MethodReturn => 2,
            Self::Error => 3,
            Self::Signal => 4,
        }
    }

    pub fn from_decimal_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }
}

/// A header field and its typed value. The codes are fixed by the protocol;
/// unknown codes are ignored on receive and never emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderField {
    Path(DBusObjectPath),
    Interface(DBusString),
    Member(DBusString),
    ErrorName(DBusString),
    ReplySerial(DBusUint32),
    Destination(DBusString),
    Sender(DBusString),
    Signature(DBusSignature),
    UnixFds(DBusUint32),
}

impl HeaderField {
    pub fn decimal_code(&self) -> u8 {
        match self {
            Self::Path(_) => 1,
            Self::Interface(_) => 2,
            Self::Member(_) => 3,
            Self::ErrorName(_) => 4,
            Self::ReplySerial(_) => 5,
            Self::Destination(_) => 6,
            Self::Sender(_) => 7,
            Self::Signature(_) => 8,
            Self::UnixFds(_) => 9,
        }
    }

    fn inner_into_variant(self) -> DBusVariant {
        match self {
            Self::Path(inner) => DBusVariant::new(inner),
            Self::Interface(inner) => DBusVariant::new(inner),
            Self::Member(inner) => DBusVariant::new(inner),
            Self::ErrorName(inner) => DBusVariant::new(inner),
            Self::ReplySerial(inner) => DBusVariant::new(inner),
            Self::Destination(inner) => DBusVariant::new(inner),
            Self::Sender(inner) => DBusVariant::new(inner),
            Self::Signature(inner) => DBusVariant::new(inner),
            Self::UnixFds(inner) => DBusVariant::new(inner),
        }
    }

    /// Interpret one decoded `(yv)` pair. `Ok(None)` for codes this
    /// implementation does not know, which the protocol says to skip.
    fn from_wire(code: u8, value: Type) -> crate::Result<Option<HeaderField>> {
        let field = match (code, value) {
            (1, Type::Basic(BasicType::DBusObjectPath(path))) => Some(Self::Path(path)),
            (2, Type::Basic(BasicType::DBusString(s))) => Some(Self::Interface(s)),
            (3, Type::Basic(BasicType::DBusString(s))) => Some(Self::Member(s)),
            (4, Type::Basic(BasicType::DBusString(s))) => Some(Self::ErrorName(s)),
            (5, Type::Basic(BasicType::DBusUint32(serial))) => Some(Self::ReplySerial(serial)),
            (6, Type::Basic(BasicType::DBusString(s))) => Some(Self::Destination(s)),
            (7, Type::Basic(BasicType::DBusString(s))) => Some(Self::Sender(s)),
            (8, Type::Basic(BasicType::DBusSignature(signature))) => {
                Some(Self::Signature(signature))
            }
            (9, Type::Basic(BasicType::DBusUint32(count))) => Some(Self::UnixFds(count)),
            (code @ 1..=9, value) => {
                return Err(ProtocolError::Invalid(format!(
                    "header field {} carries a {:?}",
                    code, value
                ))
                .into());
            }
            _ => None,
        };
        Ok(field)
    }
}

/// A method call descriptor: everything the caller specifies, with the
/// serial and wire concerns left to the connection.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// The name of the connection the call is intended for.
    pub destination: DBusString,

    /// The object to invoke the method on.
    pub path: DBusObjectPath,

    /// The interface holding the method. Optional on the wire; the peer then
    /// picks any interface with a matching member.
    pub interface: Option<DBusString>,

    /// The method name.
    pub member: DBusString,

    pub body: Body,
}

impl MethodCall {
    pub fn new(
        destination: impl Into<DBusString>,
        path: impl Into<DBusObjectPath>,
        interface: Option<DBusString>,
        member: impl Into<DBusString>,
        body: Body,
    ) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface,
            member: member.into(),
            body,
        }
    }
}

/// A complete message, either composed locally or parsed off the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,

    pub flag_no_reply_expected: bool,
    pub flag_no_auto_start: bool,
    pub flag_allow_interactive_authorization: bool,

    /// Nonzero, unique per sender within a connection lifetime. Used as a
    /// cookie to correlate a method call with its reply.
    pub serial: NonZeroU32,

    pub header_fields: Vec<HeaderField>,

    pub body: Body,
}

impl Message {
    pub fn method_call(method_call: MethodCall, serial: NonZeroU32) -> Self {
        let mut header_fields = vec![
            HeaderField::Path(method_call.path),
            HeaderField::Destination(method_call.destination),
            HeaderField::Member(method_call.member),
        ];
        if let Some(interface) = method_call.interface {
            header_fields.push(HeaderField::Interface(interface));
        }

        Self {
            message_type: MessageType::MethodCall,
            flag_no_reply_expected: false,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial,
            header_fields,
            body: method_call.body,
        }
    }

    pub fn method_return(serial: NonZeroU32, reply_serial: NonZeroU32, body: Body) -> Self {
        Self {
            message_type: MessageType::MethodReturn,
            flag_no_reply_expected: true,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial,
            header_fields: vec![HeaderField::ReplySerial(DBusUint32 {
                u32: reply_serial.get(),
            })],
            body,
        }
    }

    pub fn error(
        serial: NonZeroU32,
        reply_serial: NonZeroU32,
        error_name: impl Into<DBusString>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_type: MessageType::Error,
            flag_no_reply_expected: true,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial,
            header_fields: vec![
                HeaderField::ErrorName(error_name.into()),
                HeaderField::ReplySerial(DBusUint32 {
                    u32: reply_serial.get(),
                }),
            ],
            body: Body::new(vec![DBusString::new(message).into()]),
        }
    }

    pub fn signal(
        serial: NonZeroU32,
        path: impl Into<DBusObjectPath>,
        interface: impl Into<DBusString>,
        member: impl Into<DBusString>,
        body: Body,
    ) -> Self {
        Self {
            message_type: MessageType::Signal,
            flag_no_reply_expected: true,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial,
            header_fields: vec![
                HeaderField::Path(path.into()),
                HeaderField::Interface(interface.into()),
                HeaderField::Member(member.into()),
            ],
            body,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::Path(path) => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn interface(&self) -> Option<&str> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::Interface(s) => Some(s.string.as_str()),
            _ => None,
        })
    }

    pub fn member(&self) -> Option<&str> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::Member(s) => Some(s.string.as_str()),
            _ => None,
        })
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::ErrorName(s) => Some(s.string.as_str()),
            _ => None,
        })
    }

    pub fn destination(&self) -> Option<&str> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::Destination(s) => Some(s.string.as_str()),
            _ => None,
        })
    }

    pub fn sender(&self) -> Option<&str> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::Sender(s) => Some(s.string.as_str()),
            _ => None,
        })
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::ReplySerial(serial) => Some(serial.u32),
            _ => None,
        })
    }

    pub fn signature_field(&self) -> Option<&DBusSignature> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::Signature(signature) => Some(signature),
            _ => None,
        })
    }

    pub fn unix_fds(&self) -> Option<u32> {
        self.header_fields.iter().find_map(|f| match f {
            HeaderField::UnixFds(count) => Some(count.u32),
            _ => None,
        })
    }

    /// Enforce the header fields each message type requires.
    pub fn validate(&self) -> crate::Result<()> {
        let missing = |what: &str| -> crate::Error {
            ProtocolError::Invalid(format!("{:?} message without {}", self.message_type, what))
                .into()
        };

        match self.message_type {
            MessageType::MethodCall => {
                if self.path().is_none() {
                    return Err(missing("a path"));
                }
                if self.member().is_none() {
                    return Err(missing("a member"));
                }
            }
            MessageType::Signal => {
                if self.path().is_none() {
                    return Err(missing("a path"));
                }
                if self.interface().is_none() {
                    return Err(missing("an interface"));
                }
                if self.member().is_none() {
                    return Err(missing("a member"));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial().is_none() {
                    return Err(missing("a reply serial"));
                }
            }
            MessageType::Error => {
                if self.error_name().is_none() {
                    return Err(missing("an error name"));
                }
                if self.reply_serial().is_none() {
                    return Err(missing("a reply serial"));
                }
            }
        }

        Ok(())
    }

    /// Serialise the complete frame. Returns the bytes together with the fd
    /// table extracted from the body, to be sent as ancillary data.
    pub fn marshal(&self, endianness: Endianness) -> crate::Result<(Vec<u8>, Vec<RawFd>)> {
        self.validate()?;

        let mut body_encoder = Encoder::new(endianness);
        for argument in &self.body.arguments {
            body_encoder.marshal(argument)?;
        }
        let (marshalled_body, fds) = body_encoder.finish();

        let mut encoder = Encoder::new(endianness);

        // 1st byte: endianness
        encoder.put_u8(endianness.ascii_code());

        // 2nd byte: message type
        encoder.put_u8(self.message_type.decimal_value());

        // 3rd byte: bitwise OR of flags
        let mut flags = 0;
        if self.flag_no_reply_expected {
            flags |= FLAG_NO_REPLY_EXPECTED;
        }
        if self.flag_no_auto_start {
            flags |= FLAG_NO_AUTO_START;
        }
        if self.flag_allow_interactive_authorization {
            flags |= FLAG_ALLOW_INTERACTIVE_AUTHORIZATION;
        }
        encoder.put_u8(flags);

        // 4th byte: major protocol version
        encoder.put_u8(crate::MAJOR_PROTOCOL_VERSION);

        // 5th to 8th byte: length in bytes of the message body
        encoder.put_u32(u32::try_from(marshalled_body.len())?);

        // 9th to 12th byte: serial
        encoder.put_u32(self.serial.get());

        // Header fields: an array of (code, variant) structs. The signature
        // field is derived from the body and the fd count from the encoder,
        // so neither lives in `header_fields`.
        let mut header_fields = self.header_fields.clone();
        if !self.body.is_empty() {
            header_fields.push(HeaderField::Signature(self.body.signature()));
        }
        if !fds.is_empty() {
            header_fields.push(HeaderField::UnixFds(DBusUint32 {
                u32: u32::try_from(fds.len())?,
            }));
        }

        let mut array = DBusArray::new(HEADER_FIELD_SIGNATURE.clone());
        for header_field in header_fields {
            let code = DBusByte {
                u8: header_field.decimal_code(),
            };
            let variant = header_field.inner_into_variant();
            array
                .items
                .push(DBusStruct::new(vec![code.into(), variant.into()]).into());
        }
        encoder.marshal(&array)?;

        // The header ends padded to an 8-byte boundary; the body follows.
        encoder.align(8);

        if encoder.buf.len() + marshalled_body.len() > crate::MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge.into());
        }

        let (mut message, header_fds) = encoder.finish();
        debug_assert!(header_fds.is_empty());
        message.extend(marshalled_body);

        Ok((message, fds))
    }

    /// Parse one complete frame. `fds` is the ancillary fd table received
    /// alongside the bytes.
    pub fn unmarshal(frame: &[u8], fds: &[RawFd]) -> crate::Result<Message> {
        if frame.len() < MIN_MESSAGE_SIZE {
            return Err(ProtocolError::Truncated.into());
        }
        if frame.len() > crate::MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge.into());
        }

        let endianness = Endianness::from_ascii_code(frame[0]).ok_or_else(|| {
            ProtocolError::Invalid(format!("unknown endianness flag {:#04x}", frame[0]))
        })?;

        let mut decoder = Decoder::new(frame, endianness, fds);

        let _endianness_code = decoder.read_u8()?;

        let message_type = MessageType::from_decimal_value(decoder.read_u8()?)
            .ok_or_else(|| ProtocolError::Invalid("unknown message type".into()))?;

        // Unknown flag bits are ignored.
        let flags = decoder.read_u8()?;

        let version = decoder.read_u8()?;
        if version != crate::MAJOR_PROTOCOL_VERSION {
            return Err(
                ProtocolError::Invalid(format!("unsupported protocol version {}", version)).into(),
            );
        }

        let body_length = decoder.read_u32()? as usize;

        let serial = NonZeroU32::new(decoder.read_u32()?)
            .ok_or_else(|| ProtocolError::Invalid("message serial is zero".into()))?;

        let header_array = decoder.unmarshal(&SingleCompleteTypeSignature::DBusArray(Box::new(
            HEADER_FIELD_SIGNATURE.clone(),
        )))?;
        let malformed =
            || crate::Error::from(ProtocolError::Invalid("malformed header field array".into()));
        let header_items = match header_array {
            Type::Container(ContainerType::DBusArray(array)) => array.items,
            _ => return Err(malformed()),
        };

        let mut header_fields = Vec::with_capacity(header_items.len());
        for item in header_items {
            let mut fields = match item {
                Type::Container(ContainerType::DBusStruct(s)) => s.fields.into_iter(),
                _ => return Err(malformed()),
            };
            let code = match fields.next() {
                Some(Type::Basic(BasicType::DBusByte(code))) => code.u8,
                _ => return Err(malformed()),
            };
            let value = match fields.next() {
                Some(Type::Container(ContainerType::DBusVariant(variant))) => *variant.variant,
                _ => return Err(malformed()),
            };
            if let Some(field) = HeaderField::from_wire(code, value)? {
                header_fields.push(field);
            }
        }

        decoder.advance_to_boundary(8)?;
        if decoder.remaining() != body_length {
            return Err(ProtocolError::Invalid(format!(
                "body length field says {} bytes but {} remain",
                body_length,
                decoder.remaining(),
            ))
            .into());
        }

        let message = Message {
            message_type,
            flag_no_reply_expected: flags & FLAG_NO_REPLY_EXPECTED != 0,
            flag_no_auto_start: flags & FLAG_NO_AUTO_START != 0,
            flag_allow_interactive_authorization: flags & FLAG_ALLOW_INTERACTIVE_AUTHORIZATION != 0,
            serial,
            header_fields,
            body: Body::default(),
        };

        // This message owns the first UNIX_FDS descriptors of the table;
        // any extras arrived for a frame batched behind this one.
        let declared_fds = message.unix_fds().unwrap_or(0) as usize;
        if declared_fds > fds.len() {
            return Err(ProtocolError::Invalid(format!(
                "UNIX_FDS header says {} but only {} descriptors arrived",
                declared_fds,
                fds.len(),
            ))
            .into());
        }
        let fd_table = &fds[..declared_fds];

        // The body aligns from its own start, so it gets its own decoder.
        let body = if body_length > 0 {
            let signature = message.signature_field().ok_or_else(|| {
                ProtocolError::Invalid("non-empty body without a signature field".into())
            })?;

            let body_start = frame.len() - body_length;
            let mut body_decoder = Decoder::new(&frame[body_start..], endianness, fd_table);
            let arguments = body_decoder.unmarshal_values(&signature.vec)?;
            if body_decoder.remaining() != 0 {
                return Err(ProtocolError::Invalid(
                    "body has trailing bytes beyond its signature".into(),
                )
                .into());
            }
            Body::new(arguments)
        } else {
            Body::default()
        };

        let message = Message { body, ..message };
        message.validate()?;

        Ok(message)
    }
}

pub(crate) fn padding_for_8_bytes(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Compute the total frame length from its first [MIN_MESSAGE_SIZE] bytes,
/// so a reader can frame the byte stream before parsing.
pub fn frame_length(head: &[u8]) -> crate::Result<usize> {
    debug_assert!(head.len() >= MIN_MESSAGE_SIZE);

    let endianness = Endianness::from_ascii_code(head[0]).ok_or_else(|| {
        ProtocolError::Invalid(format!("unknown endianness flag {:#04x}", head[0]))
    })?;

    let read_u32 = |bytes: [u8; 4]| match endianness {
        Endianness::BigEndian => u32::from_be_bytes(bytes),
        Endianness::LittleEndian => u32::from_le_bytes(bytes),
    };

    let mut word = [0; 4];
    word.copy_from_slice(&head[4..8]);
    let body_length = read_u32(word) as usize;
    word.copy_from_slice(&head[12..16]);
    let fields_length = read_u32(word) as usize;

    let header_length = MIN_MESSAGE_SIZE + fields_length;
    let total = header_length + padding_for_8_bytes(header_length) + body_length;
    if total > crate::MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge.into());
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn hello() -> Message {
        Message::method_call(
            MethodCall::new(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                Some(DBusString::new("org.freedesktop.DBus")),
                "Hello",
                Body::default(),
            ),
            serial(1),
        )
    }

    #[test]
    fn hello_fixture_bytes() {
        let (bytes, fds) = hello().marshal(Endianness::LittleEndian).unwrap();
        assert!(fds.is_empty());

        let mut expected: Vec<u8> = Vec::new();
        // Prologue: little endian, method call, no flags, version 1, empty
        // body, serial 1.
        expected.extend_from_slice(&[0x6c, 0x01, 0x00, 0x01]);
        expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        expected.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        // Header field array: 109 payload bytes.
        expected.extend_from_slice(&[0x6d, 0x00, 0x00, 0x00]);
        // Path field.
        expected.extend_from_slice(&[0x01, 0x01, b'o', 0x00]);
        expected.extend_from_slice(&21u32.to_le_bytes());
        expected.extend_from_slice(b"/org/freedesktop/DBus\0");
        expected.extend_from_slice(&[0x00, 0x00]);
        // Destination field.
        expected.extend_from_slice(&[0x06, 0x01, b's', 0x00]);
        expected.extend_from_slice(&20u32.to_le_bytes());
        expected.extend_from_slice(b"org.freedesktop.DBus\0");
        expected.extend_from_slice(&[0x00, 0x00, 0x00]);
        // Member field.
        expected.extend_from_slice(&[0x03, 0x01, b's', 0x00]);
        expected.extend_from_slice(&5u32.to_le_bytes());
        expected.extend_from_slice(b"Hello\0");
        expected.extend_from_slice(&[0x00, 0x00]);
        // Interface field.
        expected.extend_from_slice(&[0x02, 0x01, b's', 0x00]);
        expected.extend_from_slice(&20u32.to_le_bytes());
        expected.extend_from_slice(b"org.freedesktop.DBus\0");
        // Header padding to the 8-byte boundary; the body is empty.
        expected.extend_from_slice(&[0x00, 0x00, 0x00]);

        assert_eq!(bytes.len(), 128);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn message_round_trip_both_endiannesses() {
        let mut message = Message::method_call(
            MethodCall::new(
                "org.freedesktop.portal.Desktop",
                "/org/freedesktop/portal/desktop",
                Some(DBusString::new("org.freedesktop.portal.Settings")),
                "ReadOne",
                Body::new(vec![
                    DBusString::new("org.freedesktop.appearance").into(),
                    DBusString::new("color-scheme").into(),
                ]),
            ),
            serial(7),
        );
        message.flag_allow_interactive_authorization = true;

        for endianness in &[Endianness::LittleEndian, Endianness::BigEndian] {
            let (bytes, fds) = message.marshal(*endianness).unwrap();
            let parsed = Message::unmarshal(&bytes, &fds).unwrap();

            assert_eq!(parsed.message_type, MessageType::MethodCall);
            assert_eq!(parsed.serial, serial(7));
            assert!(parsed.flag_allow_interactive_authorization);
            assert!(!parsed.flag_no_reply_expected);
            assert_eq!(parsed.path(), Some("/org/freedesktop/portal/desktop"));
            assert_eq!(parsed.destination(), Some("org.freedesktop.portal.Desktop"));
            assert_eq!(parsed.member(), Some("ReadOne"));
            assert_eq!(
                parsed.interface(),
                Some("org.freedesktop.portal.Settings")
            );
            assert_eq!(parsed.body.arguments, message.body.arguments);

            // The parsed frame re-marshals to the identical bytes.
            let (bytes_again, _) = parsed.marshal(*endianness).unwrap();
            assert_eq!(bytes_again, bytes);
        }
    }

    #[test]
    fn required_fields_are_enforced() {
        let no_member = Message {
            message_type: MessageType::MethodCall,
            flag_no_reply_expected: false,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial: serial(1),
            header_fields: vec![HeaderField::Path(DBusObjectPath::from("/x"))],
            body: Body::default(),
        };
        assert!(no_member.marshal(Endianness::LittleEndian).is_err());

        let no_error_name = Message {
            message_type: MessageType::Error,
            flag_no_reply_expected: true,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial: serial(2),
            header_fields: vec![HeaderField::ReplySerial(DBusUint32 { u32: 1 })],
            body: Body::default(),
        };
        assert!(no_error_name.validate().is_err());

        let no_reply_serial = Message {
            message_type: MessageType::MethodReturn,
            flag_no_reply_expected: true,
            flag_no_auto_start: false,
            flag_allow_interactive_authorization: false,
            serial: serial(3),
            header_fields: vec![],
            body: Body::default(),
        };
        assert!(no_reply_serial.validate().is_err());
    }

    #[test]
    fn unknown_header_codes_are_ignored() {
        // Hand-build a method return whose header array carries an unknown
        // code 200 field next to the required reply serial.
        let endianness = Endianness::LittleEndian;
        let mut encoder = Encoder::new(endianness);
        encoder.put_u8(endianness.ascii_code());
        encoder.put_u8(MessageType::MethodReturn.decimal_value());
        encoder.put_u8(FLAG_NO_REPLY_EXPECTED);
        encoder.put_u8(crate::MAJOR_PROTOCOL_VERSION);
        encoder.put_u32(0); // body length
        encoder.put_u32(9); // serial

        let mut array = DBusArray::new(HEADER_FIELD_SIGNATURE.clone());
        array.items.push(
            DBusStruct::new(vec![
                DBusByte { u8: 200 }.into(),
                DBusVariant::new(DBusUint32 { u32: 0xdead }).into(),
            ])
            .into(),
        );
        array.items.push(
            DBusStruct::new(vec![
                DBusByte { u8: 5 }.into(),
                DBusVariant::new(DBusUint32 { u32: 4 }).into(),
            ])
            .into(),
        );
        encoder.marshal(&array).unwrap();
        encoder.align(8);
        let (bytes, _) = encoder.finish();

        let parsed = Message::unmarshal(&bytes, &[]).unwrap();
        assert_eq!(parsed.reply_serial(), Some(4));
        assert_eq!(parsed.header_fields.len(), 1);
    }

    #[test]
    fn known_header_code_with_wrong_type_is_an_error() {
        let endianness = Endianness::LittleEndian;
        let mut encoder = Encoder::new(endianness);
        encoder.put_u8(endianness.ascii_code());
        encoder.put_u8(MessageType::MethodReturn.decimal_value());
        encoder.put_u8(FLAG_NO_REPLY_EXPECTED);
        encoder.put_u8(crate::MAJOR_PROTOCOL_VERSION);
        encoder.put_u32(0);
        encoder.put_u32(9);

        let mut array = DBusArray::new(HEADER_FIELD_SIGNATURE.clone());
        // Reply serial carrying a string.
        array.items.push(
            DBusStruct::new(vec![
                DBusByte { u8: 5 }.into(),
                DBusVariant::new(DBusString::new("4")).into(),
            ])
            .into(),
        );
        encoder.marshal(&array).unwrap();
        encoder.align(8);
        let (bytes, _) = encoder.finish();

        assert!(Message::unmarshal(&bytes, &[]).is_err());
    }

    #[test]
    fn nonempty_body_requires_signature_field() {
        // A method return declaring 4 body bytes but no signature field.
        let endianness = Endianness::LittleEndian;
        let mut encoder = Encoder::new(endianness);
        encoder.put_u8(endianness.ascii_code());
        encoder.put_u8(MessageType::MethodReturn.decimal_value());
        encoder.put_u8(FLAG_NO_REPLY_EXPECTED);
        encoder.put_u8(crate::MAJOR_PROTOCOL_VERSION);
        encoder.put_u32(4);
        encoder.put_u32(9);

        let mut array = DBusArray::new(HEADER_FIELD_SIGNATURE.clone());
        array.items.push(
            DBusStruct::new(vec![
                DBusByte { u8: 5 }.into(),
                DBusVariant::new(DBusUint32 { u32: 4 }).into(),
            ])
            .into(),
        );
        encoder.marshal(&array).unwrap();
        encoder.align(8);
        encoder.put_u32(77); // the body
        let (bytes, _) = encoder.finish();

        assert!(Message::unmarshal(&bytes, &[]).is_err());
    }

    #[test]
    fn fd_values_travel_through_the_table() {
        let message = Message::method_call(
            MethodCall::new(
                "dest.x",
                "/x",
                None,
                "TakeFd",
                Body::new(vec![DBusUnixFileDescriptor { fd: 3 }.into()]),
            ),
            serial(5),
        );
        let (bytes, fds) = message.marshal(Endianness::LittleEndian).unwrap();
        assert_eq!(fds, vec![3]);

        let parsed = Message::unmarshal(&bytes, &fds).unwrap();
        assert_eq!(parsed.unix_fds(), Some(1));
        assert_eq!(
            parsed.body.arguments[0],
            Type::from(DBusUnixFileDescriptor { fd: 3 })
        );

        // Descriptors beyond the declared count belong to a later frame and
        // are tolerated; a declared count that outruns the table is not.
        assert!(Message::unmarshal(&bytes, &[3, 9]).is_ok());
        assert!(Message::unmarshal(&bytes, &[]).is_err());
    }

    #[test]
    fn zero_serial_is_an_error() {
        let (mut bytes, _) = hello().marshal(Endianness::LittleEndian).unwrap();
        bytes[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(Message::unmarshal(&bytes, &[]).is_err());
    }

    #[test]
    fn frame_length_accounts_for_header_padding() {
        let (bytes, _) = hello().marshal(Endianness::LittleEndian).unwrap();
        assert_eq!(frame_length(&bytes[..MIN_MESSAGE_SIZE]).unwrap(), bytes.len());

        let mut message = hello();
        message.body = Body::new(vec![DBusUint32 { u32: 1 }.into()]);
        let (bytes, _) = message.marshal(Endianness::BigEndian).unwrap();
        assert_eq!(frame_length(&bytes[..MIN_MESSAGE_SIZE]).unwrap(), bytes.len());
    }

    #[test]
    fn signature_override_travels_in_the_header() {
        let mut body = Body::new(vec![DBusUint32 { u32: 1 }.into()]);
        body.signature_override = Some(DBusSignature {
            vec: crate::type_system::signature::parse_signature("i").unwrap(),
        });
        let message = Message::method_call(
            MethodCall::new("dest.x", "/x", None, "M", body),
            serial(3),
        );
        let (bytes, _) = message.marshal(Endianness::LittleEndian).unwrap();

        // The peer sees the overridden signature: the body decodes as an
        // int32, not a uint32.
        let parsed = Message::unmarshal(&bytes, &[]).unwrap();
        assert_eq!(
            parsed.signature_field().unwrap().vec,
            crate::type_system::signature::parse_signature("i").unwrap()
        );
    }
}
