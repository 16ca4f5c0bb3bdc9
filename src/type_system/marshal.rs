//! Type-driven wire encoding.
//!
//! The [Encoder] appends values to a byte buffer, inserting the zero padding
//! the protocol mandates before each value. Alignment is measured from the
//! start of the buffer, which must therefore coincide with the start of the
//! enclosing message body (or header).

use std::convert::TryFrom;
use std::os::unix::io::RawFd;

use crate::type_system::signature::Signature;
use crate::type_system::signature::MAX_SIGNATURE_LENGTH;
use crate::type_system::types::*;
use crate::type_system::Endianness;
use crate::ProtocolError;

#[derive(Debug)]
pub struct Encoder {
    pub endianness: Endianness,
    pub buf: Vec<u8>,
    /// File descriptors extracted from the values encoded so far. On the
    /// wire each `h` value is the index of its descriptor in this table.
    pub fds: Vec<RawFd>,
}

pub trait Marshal<T> {
    fn marshal(&mut self, t: &T) -> crate::Result<()>;
}

impl Encoder {
    pub fn new(endianness: Endianness) -> Self {
        Self {
            endianness,
            buf: Vec::new(),
            fds: Vec::new(),
        }
    }

    pub fn finish(self) -> (Vec<u8>, Vec<RawFd>) {
        (self.buf, self.fds)
    }

    /// Push null bytes until aligned.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!([1, 2, 4, 8].contains(&alignment));

        while self.buf.len() % alignment != 0 {
            self.buf.push(0);
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.align(2);
        let bytes = match self.endianness {
            Endianness::BigEndian => value.to_be_bytes(),
            Endianness::LittleEndian => value.to_le_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.align(4);
        let bytes = match self.endianness {
            Endianness::BigEndian => value.to_be_bytes(),
            Endianness::LittleEndian => value.to_le_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.align(8);
        let bytes = match self.endianness {
            Endianness::BigEndian => value.to_be_bytes(),
            Endianness::LittleEndian => value.to_le_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    /// Overwrite 4 bytes written earlier, for length-value encodings where
    /// the length is only known after the value.
    pub fn set_u32_at(&mut self, index: usize, value: u32) {
        let bytes = match self.endianness {
            Endianness::BigEndian => value.to_be_bytes(),
            Endianness::LittleEndian => value.to_le_bytes(),
        };
        self.buf[index..index + 4].copy_from_slice(&bytes);
    }

    fn put_string(&mut self, string: &str) -> crate::Result<()> {
        if string.contains('\0') {
            return Err(ProtocolError::Invalid("string contains a NUL byte".into()).into());
        }

        // 4-byte length of the UTF-8 bytes, not counting the trailing null.
        let length = u32::try_from(string.len())?;
        self.put_u32(length);
        self.buf.extend_from_slice(string.as_bytes());
        self.buf.push(0x00);

        Ok(())
    }
}

impl Marshal<Type> for Encoder {
    fn marshal(&mut self, t: &Type) -> crate::Result<()> {
        match t {
            Type::Basic(inner) => self.marshal(inner),
            Type::Container(inner) => self.marshal(inner),
        }
    }
}

impl Marshal<BasicType> for Encoder {
    fn marshal(&mut self, t: &BasicType) -> crate::Result<()> {
        match t {
            BasicType::DBusByte(inner) => self.marshal(inner),
            BasicType::DBusBoolean(inner) => self.marshal(inner),
            BasicType::DBusInt16(inner) => self.marshal(inner),
            BasicType::DBusUint16(inner) => self.marshal(inner),
            BasicType::DBusInt32(inner) => self.marshal(inner),
            BasicType::DBusUint32(inner) => self.marshal(inner),
            BasicType::DBusInt64(inner) => self.marshal(inner),
            BasicType::DBusUint64(inner) => self.marshal(inner),
            BasicType::DBusDouble(inner) => self.marshal(inner),
            BasicType::DBusString(inner) => self.marshal(inner),
            BasicType::DBusObjectPath(inner) => self.marshal(inner),
            BasicType::DBusSignature(inner) => self.marshal(inner),
            BasicType::DBusUnixFileDescriptor(inner) => self.marshal(inner),
        }
    }
}

impl Marshal<ContainerType> for Encoder {
    fn marshal(&mut self, t: &ContainerType) -> crate::Result<()> {
        match t {
            ContainerType::DBusArray(inner) => self.marshal(inner),
            ContainerType::DBusStruct(inner) => self.marshal(inner),
            ContainerType::DBusVariant(inner) => self.marshal(inner),
            ContainerType::DBusDictEntry(inner) => self.marshal(inner),
        }
    }
}

impl Marshal<DBusByte> for Encoder {
    fn marshal(&mut self, t: &DBusByte) -> crate::Result<()> {
        self.put_u8(t.u8);
        Ok(())
    }
}

impl Marshal<DBusBoolean> for Encoder {
    fn marshal(&mut self, t: &DBusBoolean) -> crate::Result<()> {
        self.put_u32(if t.bool { 1 } else { 0 });
        Ok(())
    }
}

impl Marshal<DBusInt16> for Encoder {
    fn marshal(&mut self, t: &DBusInt16) -> crate::Result<()> {
        self.put_u16(t.i16 as u16);
        Ok(())
    }
}

impl Marshal<DBusUint16> for Encoder {
    fn marshal(&mut self, t: &DBusUint16) -> crate::Result<()> {
        self.put_u16(t.u16);
        Ok(())
    }
}

impl Marshal<DBusInt32> for Encoder {
    fn marshal(&mut self, t: &DBusInt32) -> crate::Result<()> {
        self.put_u32(t.i32 as u32);
        Ok(())
    }
}

impl Marshal<DBusUint32> for Encoder {
    fn marshal(&mut self, t: &DBusUint32) -> crate::Result<()> {
        self.put_u32(t.u32);
        Ok(())
    }
}

impl Marshal<DBusInt64> for Encoder {
    fn marshal(&mut self, t: &DBusInt64) -> crate::Result<()> {
        self.put_u64(t.i64 as u64);
        Ok(())
    }
}

impl Marshal<DBusUint64> for Encoder {
    fn marshal(&mut self, t: &DBusUint64) -> crate::Result<()> {
        self.put_u64(t.u64);
        Ok(())
    }
}

impl Marshal<DBusDouble> for Encoder {
    fn marshal(&mut self, t: &DBusDouble) -> crate::Result<()> {
        self.put_u64(t.f64.to_bits());
        Ok(())
    }
}

impl Marshal<DBusString> for Encoder {
    fn marshal(&mut self, t: &DBusString) -> crate::Result<()> {
        self.put_string(&t.string)
    }
}

impl Marshal<DBusObjectPath> for Encoder {
    fn marshal(&mut self, t: &DBusObjectPath) -> crate::Result<()> {
        if !validate_object_path(t.as_str()) {
            return Err(ProtocolError::BadObjectPath(t.as_str().to_string()).into());
        }
        // Marshals the same way as DBusString.
        self.marshal(&t.dbus_string)
    }
}

impl Marshal<DBusSignature> for Encoder {
    fn marshal(&mut self, t: &DBusSignature) -> crate::Result<()> {
        let mut serialized = String::new();
        for single_complete_type in &t.vec {
            single_complete_type.write_code(&mut serialized);
        }
        if serialized.len() > MAX_SIGNATURE_LENGTH {
            return Err(ProtocolError::BadSignature(serialized).into());
        }

        // 1-byte length, bytes, terminating null.
        self.put_u8(serialized.len() as u8);
        self.buf.extend_from_slice(serialized.as_bytes());
        self.buf.push(0x00);

        Ok(())
    }
}

impl Marshal<DBusUnixFileDescriptor> for Encoder {
    fn marshal(&mut self, t: &DBusUnixFileDescriptor) -> crate::Result<()> {
        let index = u32::try_from(self.fds.len())?;
        self.fds.push(t.fd);
        self.put_u32(index);
        Ok(())
    }
}

impl Marshal<DBusVariant> for Encoder {
    fn marshal(&mut self, t: &DBusVariant) -> crate::Result<()> {
        // Single complete type signature of the contained value, then the
        // value itself at its own alignment.
        let signature = DBusSignature {
            vec: vec![t.variant.signature()],
        };
        self.marshal(&signature)?;
        self.marshal(&*t.variant)
    }
}

impl Marshal<DBusArray> for Encoder {
    fn marshal(&mut self, t: &DBusArray) -> crate::Result<()> {
        // Length-value encoded; the 4-byte length counts the payload only,
        // excluding the padding between the length and the first item.
        self.align(4);
        let length_index = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);

        self.align(t.item_type.marshalling_boundary());
        let offset_first_item = self.buf.len();

        for item in &t.items {
            if item.signature() != t.item_type {
                return Err(ProtocolError::Invalid(format!(
                    "array element signature {:?} does not match item type {:?}",
                    item.signature().serialize(),
                    t.item_type.serialize(),
                ))
                .into());
            }
            self.marshal(item)?;
        }

        let payload = self.buf.len() - offset_first_item;
        if payload > crate::MAX_ARRAY_LENGTH {
            return Err(ProtocolError::ArrayTooLarge.into());
        }
        self.set_u32_at(length_index, payload as u32);

        Ok(())
    }
}

impl Marshal<DBusStruct> for Encoder {
    fn marshal(&mut self, t: &DBusStruct) -> crate::Result<()> {
        // Structs start on an 8-byte boundary regardless of their fields.
        self.align(8);

        for field in &t.fields {
            self.marshal(field)?;
        }

        Ok(())
    }
}

impl Marshal<DBusDictEntry> for Encoder {
    fn marshal(&mut self, t: &DBusDictEntry) -> crate::Result<()> {
        // Dict entries align like structs.
        self.align(8);

        self.marshal(&t.key)?;
        self.marshal(&*t.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_system::signature::SingleCompleteTypeSignature as Sig;

    fn encode(endianness: Endianness, value: &Type) -> Vec<u8> {
        let mut encoder = Encoder::new(endianness);
        encoder.marshal(value).unwrap();
        encoder.finish().0
    }

    #[test]
    fn integers_both_endiannesses() {
        let value = Type::from(DBusUint16 { u16: 0x0102 });
        assert_eq!(encode(Endianness::BigEndian, &value), vec![1, 2]);
        assert_eq!(encode(Endianness::LittleEndian, &value), vec![2, 1]);
    }

    #[test]
    fn struct_places_fields_at_natural_alignment() {
        // (yt): the byte sits at offset 0, the uint64 at offset 8.
        let value = Type::from(DBusStruct::new(vec![
            DBusByte { u8: 0xaa }.into(),
            DBusUint64 { u64: 1 }.into(),
        ]));
        let bytes = encode(Endianness::BigEndian, &value);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0xaa);
        assert_eq!(&bytes[1..8], &[0; 7]);
        assert_eq!(&bytes[8..16], &1u64.to_be_bytes());
    }

    #[test]
    fn string_is_length_prefixed_and_null_terminated() {
        let value = Type::from(DBusString::new("abc"));
        let bytes = encode(Endianness::LittleEndian, &value);
        assert_eq!(bytes, vec![3, 0, 0, 0, b'a', b'b', b'c', 0]);
    }

    #[test]
    fn string_with_nul_is_rejected() {
        let value = Type::from(DBusString::new("a\0b"));
        let mut encoder = Encoder::new(Endianness::LittleEndian);
        assert!(encoder.marshal(&value).is_err());
    }

    #[test]
    fn invalid_object_path_is_rejected() {
        let value = Type::from(DBusObjectPath::from("/a/"));
        let mut encoder = Encoder::new(Endianness::LittleEndian);
        assert!(encoder.marshal(&value).is_err());
    }

    #[test]
    fn array_length_excludes_leading_padding() {
        // at: length field, then 4 bytes of padding up to the 8-byte item
        // boundary, then one item. The length must count the item only.
        let mut array = DBusArray::new(Sig::DBusUint64);
        array.push(DBusUint64 { u64: 0x1122334455667788 });
        let bytes = encode(Endianness::BigEndian, &array.into());

        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &8u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &[0; 4]);
        assert_eq!(&bytes[8..16], &0x1122334455667788u64.to_be_bytes());
    }

    #[test]
    fn array_length_includes_padding_between_elements() {
        // a(yy): each struct starts on an 8-byte boundary, so the second
        // element's leading padding is part of the payload.
        let element_type = Sig::DBusStruct {
            fields: vec![Sig::DBusByte, Sig::DBusByte],
        };
        let mut array = DBusArray::new(element_type);
        for _ in 0..2 {
            array.push(DBusStruct::new(vec![
                DBusByte { u8: 1 }.into(),
                DBusByte { u8: 2 }.into(),
            ]));
        }
        let bytes = encode(Endianness::LittleEndian, &array.into());

        // 4-byte length, 4 bytes of leading padding up to the struct
        // boundary (not counted), first struct (2 bytes), 6 bytes of
        // padding (counted), second struct (2 bytes).
        assert_eq!(&bytes[0..4], &10u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[0; 4]);
        assert_eq!(&bytes[8..10], &[1, 2]);
        assert_eq!(&bytes[10..16], &[0; 6]);
        assert_eq!(&bytes[16..18], &[1, 2]);
        assert_eq!(bytes.len(), 18);
    }

    #[test]
    fn array_element_type_mismatch_is_rejected() {
        let mut array = DBusArray::new(Sig::DBusUint32);
        array.items.push(DBusString::new("oops").into());
        let mut encoder = Encoder::new(Endianness::LittleEndian);
        assert!(encoder.marshal(&Type::from(array)).is_err());
    }

    #[test]
    fn variant_carries_signature_then_value() {
        let value = Type::from(DBusVariant::new(DBusString::new("hi")));
        let bytes = encode(Endianness::LittleEndian, &value);
        // Signature "s" (1 byte length, code, null), pad to 4, then the
        // string.
        assert_eq!(&bytes[0..3], &[1, b's', 0]);
        assert_eq!(&bytes[3..4], &[0]);
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..11], &[b'h', b'i', 0]);
    }

    #[test]
    fn unix_fd_is_replaced_by_table_index() {
        let mut encoder = Encoder::new(Endianness::LittleEndian);
        encoder
            .marshal(&Type::from(DBusUnixFileDescriptor { fd: 5 }))
            .unwrap();
        encoder
            .marshal(&Type::from(DBusUnixFileDescriptor { fd: 9 }))
            .unwrap();
        let (bytes, fds) = encoder.finish();

        assert_eq!(&bytes[0..4], &0u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(fds, vec![5, 9]);
    }
}
