//! Signature-driven wire decoding.
//!
//! The [Decoder] walks a byte slice with an absolute position so that
//! alignment can be computed relative to the start of the enclosing message
//! body (or header), which the slice must begin at.

use std::convert::TryInto;
use std::os::unix::io::RawFd;

use crate::type_system::signature::{parse_signature, SingleCompleteTypeSignature};
use crate::type_system::types::*;
use crate::type_system::Endianness;
use crate::ProtocolError;

#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    endianness: Endianness,
    /// The out-of-band fd table of the message being decoded. `h` values
    /// are indices into this table and resolve to real descriptors.
    fds: &'a [RawFd],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], endianness: Endianness, fds: &'a [RawFd]) -> Self {
        Self {
            data,
            pos: 0,
            endianness,
            fds,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> crate::Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(ProtocolError::Truncated.into());
        }
        let bytes = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    /// Skip over padding until at an n-byte boundary. Padding must be null
    /// bytes.
    pub fn advance_to_boundary(&mut self, boundary: usize) -> crate::Result<()> {
        debug_assert!([1, 2, 4, 8].contains(&boundary));

        while self.pos % boundary != 0 {
            let byte = self.take(1)?[0];
            if byte != 0 {
                return Err(
                    ProtocolError::Invalid(format!("non-zero padding byte {:#04x}", byte)).into(),
                );
            }
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> crate::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> crate::Result<u16> {
        self.advance_to_boundary(2)?;
        let bytes: [u8; 2] = self.take(2)?.try_into()?;
        Ok(match self.endianness {
            Endianness::BigEndian => u16::from_be_bytes(bytes),
            Endianness::LittleEndian => u16::from_le_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self) -> crate::Result<u32> {
        self.advance_to_boundary(4)?;
        let bytes: [u8; 4] = self.take(4)?.try_into()?;
        Ok(match self.endianness {
            Endianness::BigEndian => u32::from_be_bytes(bytes),
            Endianness::LittleEndian => u32::from_le_bytes(bytes),
        })
    }

    pub fn read_u64(&mut self) -> crate::Result<u64> {
        self.advance_to_boundary(8)?;
        let bytes: [u8; 8] = self.take(8)?.try_into()?;
        Ok(match self.endianness {
            Endianness::BigEndian => u64::from_be_bytes(bytes),
            Endianness::LittleEndian => u64::from_le_bytes(bytes),
        })
    }

    fn read_string(&mut self) -> crate::Result<String> {
        // 4-byte length of the UTF-8 bytes, excluding the terminating null.
        let length = self.read_u32()? as usize;
        let bytes = self.take(length)?;
        let string = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::BadUtf8)?
            .to_string();

        let terminator = self.take(1)?[0];
        if terminator != 0 {
            return Err(ProtocolError::Invalid("string not null-terminated".into()).into());
        }
        if string.contains('\0') {
            return Err(ProtocolError::Invalid("string contains a NUL byte".into()).into());
        }

        Ok(string)
    }

    fn read_signature(&mut self) -> crate::Result<Vec<SingleCompleteTypeSignature>> {
        // 1-byte length, bytes, terminating null.
        let length = self.read_u8()? as usize;
        let bytes = self.take(length)?;
        let string = std::str::from_utf8(bytes).map_err(|_| ProtocolError::BadUtf8)?;
        let parsed = parse_signature(string)?;

        let terminator = self.take(1)?[0];
        if terminator != 0 {
            return Err(ProtocolError::Invalid("signature not null-terminated".into()).into());
        }

        Ok(parsed)
    }

    /// Decode one value of the given type at the current position.
    pub fn unmarshal(&mut self, signature: &SingleCompleteTypeSignature) -> crate::Result<Type> {
        use SingleCompleteTypeSignature as Sig;

        match signature {
            Sig::DBusByte => Ok(DBusByte { u8: self.read_u8()? }.into()),
            Sig::DBusBoolean => {
                // Wire-encoded as a u32; only 0 and 1 are valid.
                match self.read_u32()? {
                    0 => Ok(DBusBoolean { bool: false }.into()),
                    1 => Ok(DBusBoolean { bool: true }.into()),
                    other => Err(ProtocolError::NonCanonicalBoolean(other).into()),
                }
            }
            Sig::DBusInt16 => Ok(DBusInt16 {
                i16: self.read_u16()? as i16,
            }
            .into()),
            Sig::DBusUint16 => Ok(DBusUint16 {
                u16: self.read_u16()?,
            }
            .into()),
            Sig::DBusInt32 => Ok(DBusInt32 {
                i32: self.read_u32()? as i32,
            }
            .into()),
            Sig::DBusUint32 => Ok(DBusUint32 {
                u32: self.read_u32()?,
            }
            .into()),
            Sig::DBusInt64 => Ok(DBusInt64 {
                i64: self.read_u64()? as i64,
            }
            .into()),
            Sig::DBusUint64 => Ok(DBusUint64 {
                u64: self.read_u64()?,
            }
            .into()),
            Sig::DBusDouble => Ok(DBusDouble {
                f64: f64::from_bits(self.read_u64()?),
            }
            .into()),
            Sig::DBusString => Ok(DBusString {
                string: self.read_string()?,
            }
            .into()),
            Sig::DBusObjectPath => {
                let string = self.read_string()?;
                if !validate_object_path(&string) {
                    return Err(ProtocolError::BadObjectPath(string).into());
                }
                Ok(DBusObjectPath::from(string).into())
            }
            Sig::DBusSignature => Ok(DBusSignature {
                vec: self.read_signature()?,
            }
            .into()),
            Sig::DBusUnixFileDescriptor => {
                let index = self.read_u32()?;
                let fd = self
                    .fds
                    .get(index as usize)
                    .copied()
                    .ok_or(ProtocolError::BadFdIndex(index))?;
                Ok(DBusUnixFileDescriptor { fd }.into())
            }
            Sig::DBusVariant => {
                let inner = self.read_signature()?;
                if inner.len() != 1 {
                    return Err(ProtocolError::Invalid(format!(
                        "variant signature must contain exactly one complete type, got {:?}",
                        crate::type_system::signature::signature_string(&inner),
                    ))
                    .into());
                }
                let value = self.unmarshal(&inner[0])?;
                Ok(DBusVariant {
                    variant: Box::new(value),
                }
                .into())
            }
            Sig::DBusArray(item_type) => {
                let byte_length = self.read_u32()? as usize;
                if byte_length > crate::MAX_ARRAY_LENGTH {
                    return Err(ProtocolError::ArrayTooLarge.into());
                }

                // Padding between the length and the first item is not part
                // of the payload.
                self.advance_to_boundary(item_type.marshalling_boundary())?;

                let end = self.pos + byte_length;
                if end > self.data.len() {
                    return Err(ProtocolError::Truncated.into());
                }

                let mut array = DBusArray::new((**item_type).clone());
                while self.pos < end {
                    array.items.push(self.unmarshal(item_type)?);
                }
                if self.pos != end {
                    return Err(ProtocolError::Invalid(
                        "array payload does not end on an element boundary".into(),
                    )
                    .into());
                }

                Ok(array.into())
            }
            Sig::DBusStruct { fields } => {
                self.advance_to_boundary(8)?;
                let mut decoded = Vec::with_capacity(fields.len());
                for field in fields {
                    decoded.push(self.unmarshal(field)?);
                }
                Ok(DBusStruct::new(decoded).into())
            }
            Sig::DBusDictEntry { key, value } => {
                self.advance_to_boundary(8)?;
                let decoded_key = match self.unmarshal(key)? {
                    Type::Basic(basic) => basic,
                    Type::Container(_) => {
                        return Err(
                            ProtocolError::Invalid("dict entry key is not a basic type".into())
                                .into(),
                        )
                    }
                };
                let decoded_value = self.unmarshal(value)?;
                Ok(DBusDictEntry {
                    key: decoded_key,
                    value: Box::new(decoded_value),
                }
                .into())
            }
        }
    }

    /// Decode a full value sequence, one value per single complete type.
    pub fn unmarshal_values(
        &mut self,
        signature: &[SingleCompleteTypeSignature],
    ) -> crate::Result<Vec<Type>> {
        let mut values = Vec::with_capacity(signature.len());
        for single_complete_type in signature {
            values.push(self.unmarshal(single_complete_type)?);
        }
        Ok(values)
    }
}
