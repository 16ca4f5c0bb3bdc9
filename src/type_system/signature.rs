//! Signatures parsed into type trees.
//!
//! A signature string is parsed once into a sequence of
//! [SingleCompleteTypeSignature] trees; the marshaller and unmarshaller are
//! driven by the trees rather than re-scanning the string at every nesting
//! level.

use lazy_static::lazy_static;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{all_consuming, map, value};
use nom::multi::{many0, many1};
use nom::sequence::{delimited, pair, preceded};
use nom::Finish;
use nom::IResult;

use crate::ProtocolError;

/// Signatures may not exceed 255 bytes.
pub const MAX_SIGNATURE_LENGTH: usize = 255;

/// Signature for a "Single Complete Type".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleCompleteTypeSignature {
    DBusByte,
    DBusBoolean,
    DBusInt16,
    DBusUint16,
    DBusInt32,
    DBusUint32,
    DBusInt64,
    DBusUint64,
    DBusDouble,
    DBusString,
    DBusObjectPath,
    DBusSignature,
    DBusUnixFileDescriptor,
    DBusArray(Box<SingleCompleteTypeSignature>),
    DBusStruct {
        fields: Vec<SingleCompleteTypeSignature>,
    },
    DBusVariant,
    /// Occurs only as the element type of an array; the key must be a basic
    /// type. The grammar below enforces both.
    DBusDictEntry {
        key: Box<SingleCompleteTypeSignature>,
        value: Box<SingleCompleteTypeSignature>,
    },
}

lazy_static! {
    /// The element type of the header-field array: a `(yv)` struct.
    pub static ref HEADER_FIELD_SIGNATURE: SingleCompleteTypeSignature =
        SingleCompleteTypeSignature::DBusStruct {
            fields: vec![
                SingleCompleteTypeSignature::DBusByte,
                SingleCompleteTypeSignature::DBusVariant,
            ],
        };
}

/// Types that know the signature of their value.
pub trait Signature {
    fn signature(&self) -> SingleCompleteTypeSignature;
}

impl SingleCompleteTypeSignature {
    /// Alignment of this type on the wire, measured from the start of the
    /// enclosing message body or header.
    pub fn marshalling_boundary(&self) -> usize {
        use SingleCompleteTypeSignature::*;
        match self {
            DBusByte | DBusSignature | DBusVariant => 1,
            DBusInt16 | DBusUint16 => 2,
            DBusBoolean | DBusInt32 | DBusUint32 | DBusString | DBusObjectPath
            | DBusUnixFileDescriptor | DBusArray(_) => 4,
            DBusInt64 | DBusUint64 | DBusDouble | DBusStruct { .. } | DBusDictEntry { .. } => 8,
        }
    }

    /// Append this type's code(s) to `out`.
    pub fn write_code(&self, out: &mut String) {
        use SingleCompleteTypeSignature::*;
        match self {
            DBusByte => out.push('y'),
            DBusBoolean => out.push('b'),
            DBusInt16 => out.push('n'),
            DBusUint16 => out.push('q'),
            DBusInt32 => out.push('i'),
            DBusUint32 => out.push('u'),
            DBusInt64 => out.push('x'),
            DBusUint64 => out.push('t'),
            DBusDouble => out.push('d'),
            DBusString => out.push('s'),
            DBusObjectPath => out.push('o'),
            DBusSignature => out.push('g'),
            DBusUnixFileDescriptor => out.push('h'),
            DBusVariant => out.push('v'),
            DBusArray(item) => {
                out.push('a');
                item.write_code(out);
            }
            DBusStruct { fields } => {
                out.push('(');
                for field in fields {
                    field.write_code(out);
                }
                out.push(')');
            }
            DBusDictEntry { key, value } => {
                out.push('{');
                key.write_code(out);
                value.write_code(out);
                out.push('}');
            }
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write_code(&mut out);
        out
    }
}

/// Render a sequence of single complete types back into a signature string.
pub fn signature_string(types: &[SingleCompleteTypeSignature]) -> String {
    let mut out = String::new();
    for t in types {
        t.write_code(&mut out);
    }
    out
}

/// Parse a signature string into its sequence of single complete types.
///
/// Rejects signatures longer than 255 bytes, incomplete types (`a`, `(i`),
/// bare dict entries, dict entries with non-basic keys or more than two
/// member types, and anything else outside the grammar.
pub fn parse_signature(signature: &str) -> crate::Result<Vec<SingleCompleteTypeSignature>> {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        return Err(ProtocolError::BadSignature(signature.to_string()).into());
    }

    let (_rest, parsed) = all_consuming(many0(single_complete_type))(signature)
        .finish()
        .map_err(|_: nom::error::Error<&str>| ProtocolError::BadSignature(signature.to_string()))?;

    Ok(parsed)
}

/// Like [parse_signature], but requires exactly one single complete type, as
/// found inside a variant.
pub fn parse_single_signature(signature: &str) -> crate::Result<SingleCompleteTypeSignature> {
    let mut parsed = parse_signature(signature)?;
    if parsed.len() != 1 {
        return Err(ProtocolError::BadSignature(signature.to_string()).into());
    }
    Ok(parsed.remove(0))
}

fn basic_type(i: &str) -> IResult<&str, SingleCompleteTypeSignature> {
    use SingleCompleteTypeSignature::*;
    alt((
        value(DBusByte, tag("y")),
        value(DBusBoolean, tag("b")),
        value(DBusInt16, tag("n")),
        value(DBusUint16, tag("q")),
        value(DBusInt32, tag("i")),
        value(DBusUint32, tag("u")),
        value(DBusInt64, tag("x")),
        value(DBusUint64, tag("t")),
        value(DBusDouble, tag("d")),
        value(DBusString, tag("s")),
        value(DBusObjectPath, tag("o")),
        value(DBusSignature, tag("g")),
        value(DBusUnixFileDescriptor, tag("h")),
    ))(i)
}

fn variant_type(i: &str) -> IResult<&str, SingleCompleteTypeSignature> {
    value(SingleCompleteTypeSignature::DBusVariant, tag("v"))(i)
}

fn struct_type(i: &str) -> IResult<&str, SingleCompleteTypeSignature> {
    map(
        delimited(tag("("), many1(single_complete_type), tag(")")),
        |fields| SingleCompleteTypeSignature::DBusStruct { fields },
    )(i)
}

fn dict_entry_type(i: &str) -> IResult<&str, SingleCompleteTypeSignature> {
    map(
        delimited(tag("{"), pair(basic_type, single_complete_type), tag("}")),
        |(key, value)| SingleCompleteTypeSignature::DBusDictEntry {
            key: Box::new(key),
            value: Box::new(value),
        },
    )(i)
}

fn array_type(i: &str) -> IResult<&str, SingleCompleteTypeSignature> {
    map(
        preceded(tag("a"), alt((dict_entry_type, single_complete_type))),
        |item| SingleCompleteTypeSignature::DBusArray(Box::new(item)),
    )(i)
}

fn single_complete_type(i: &str) -> IResult<&str, SingleCompleteTypeSignature> {
    alt((basic_type, variant_type, struct_type, array_type))(i)
}
