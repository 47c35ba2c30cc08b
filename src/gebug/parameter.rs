//! Typed, direction-aware message parameters.
//!
//! Every message declares a static list of [`ParameterSpec`]s. The parameter
//! stream of a packet body is the included parameters in ascending wire index
//! order, with no separators:
//!
//! - fixed parameters are 1, 2 or 4 bytes, big endian;
//! - variable parameters are a length marker followed by the raw bytes.
//!
//! ```text
//! 0xFF len:u8          (len <= 255)
//! 0xFE len:u16 BE      (len <= 65535)
//! 0xFD len:u32 BE      (otherwise)
//! ```

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Marker for a variable block of at most 255 bytes.
pub const MARKER_U8: u8 = 0xFF;
/// Marker for a variable block of at most 65535 bytes.
pub const MARKER_U16: u8 = 0xFE;
/// Marker for larger variable blocks.
pub const MARKER_U32: u8 = 0xFD;

/// Which transfers carry a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Declared for documentation only, never on the wire.
    Never,
    PcToConsole,
    ConsoleToPc,
    Both,
}

impl Direction {
    /// Whether a parameter declared with `self` is written in `transfer`.
    pub fn includes(self, transfer: Direction) -> bool {
        match self {
            Self::Never => false,
            Self::Both => transfer != Self::Never,
            declared => declared == transfer,
        }
    }

    /// The opposite transfer direction.
    pub fn reverse(self) -> Self {
        match self {
            Self::PcToConsole => Self::ConsoleToPc,
            Self::ConsoleToPc => Self::PcToConsole,
            other => other,
        }
    }
}

/// Wire size of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSize {
    /// 1, 2 or 4 bytes.
    Fixed(usize),
    /// Length marker plus raw bytes.
    Variable,
}

/// Static description of one message parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: &'static str,
    /// Position on the wire; lower indices are written first.
    pub wire_index: u8,
    pub size: ParameterSize,
    pub direction: Direction,
}

/// An untyped parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Uint(u32),
    Bytes(Vec<u8>),
}

/// Rust types that can be used as message fields.
pub trait ParameterType: Sized {
    const SIZE: ParameterSize;

    fn to_value(&self) -> ParamValue;

    fn from_value(name: &'static str, value: ParamValue) -> Result<Self, ProtocolError>;
}

macro_rules! uint_parameter {
    ($($ty:ty),*) => {
        $(
            impl ParameterType for $ty {
                const SIZE: ParameterSize = ParameterSize::Fixed(std::mem::size_of::<$ty>());

                fn to_value(&self) -> ParamValue {
                    ParamValue::Uint(u32::from(*self))
                }

                fn from_value(name: &'static str, value: ParamValue) -> Result<Self, ProtocolError> {
                    match value {
                        ParamValue::Uint(v) => <$ty>::try_from(v).map_err(|_| {
                            ProtocolError::ValueTooLarge { name, value: u64::from(v) }
                        }),
                        ParamValue::Bytes(_) => Err(ProtocolError::TypeMismatch { name }),
                    }
                }
            }
        )*
    };
}

uint_parameter!(u8, u16, u32);

impl ParameterType for Vec<u8> {
    const SIZE: ParameterSize = ParameterSize::Variable;

    fn to_value(&self) -> ParamValue {
        ParamValue::Bytes(self.clone())
    }

    fn from_value(name: &'static str, value: ParamValue) -> Result<Self, ProtocolError> {
        match value {
            ParamValue::Bytes(bytes) => Ok(bytes),
            ParamValue::Uint(_) => Err(ProtocolError::TypeMismatch { name }),
        }
    }
}

/// Text is sent as raw bytes; invalid UTF-8 is replaced on receipt.
impl ParameterType for String {
    const SIZE: ParameterSize = ParameterSize::Variable;

    fn to_value(&self) -> ParamValue {
        ParamValue::Bytes(self.as_bytes().to_vec())
    }

    fn from_value(name: &'static str, value: ParamValue) -> Result<Self, ProtocolError> {
        match value {
            ParamValue::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            ParamValue::Uint(_) => Err(ProtocolError::TypeMismatch { name }),
        }
    }
}

/// Append the length marker for a variable block of `len` bytes.
pub fn put_length_marker(out: &mut Vec<u8>, len: usize) -> Result<(), ProtocolError> {
    if len <= u8::MAX as usize {
        out.put_u8(MARKER_U8);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(MARKER_U16);
        out.put_u16(len as u16);
    } else {
        let len = u32::try_from(len).map_err(|_| ProtocolError::ValueTooLarge {
            name: "length",
            value: len as u64,
        })?;
        out.put_u8(MARKER_U32);
        out.put_u32(len);
    }
    Ok(())
}

/// Read a length marker for parameter `name`.
pub fn get_length_marker(input: &mut &[u8], name: &'static str) -> Result<usize, ProtocolError> {
    ensure(input, 1, name)?;
    let marker = input.get_u8();
    let width = match marker {
        MARKER_U8 => 1,
        MARKER_U16 => 2,
        MARKER_U32 => 4,
        _ => return Err(ProtocolError::InvalidLengthMarker { name, marker }),
    };
    ensure(input, width, name)?;
    Ok(input.get_uint(width) as usize)
}

/// Append one parameter value according to its spec.
pub fn write_parameter(
    out: &mut Vec<u8>,
    spec: &ParameterSpec,
    value: &ParamValue,
) -> Result<(), ProtocolError> {
    match (spec.size, value) {
        (ParameterSize::Fixed(width), ParamValue::Uint(v)) => {
            if width < 4 && u64::from(*v) >> (width * 8) != 0 {
                return Err(ProtocolError::ValueTooLarge {
                    name: spec.name,
                    value: u64::from(*v),
                });
            }
            out.put_uint(u64::from(*v), width);
        }
        (ParameterSize::Variable, ParamValue::Bytes(bytes)) => {
            put_length_marker(out, bytes.len())?;
            out.put_slice(bytes);
        }
        _ => return Err(ProtocolError::TypeMismatch { name: spec.name }),
    }
    Ok(())
}

/// Read one parameter value according to its spec.
pub fn read_parameter(input: &mut &[u8], spec: &ParameterSpec) -> Result<ParamValue, ProtocolError> {
    match spec.size {
        ParameterSize::Fixed(width) => {
            ensure(input, width, spec.name)?;
            Ok(ParamValue::Uint(input.get_uint(width) as u32))
        }
        ParameterSize::Variable => {
            let len = get_length_marker(input, spec.name)?;
            ensure(input, len, spec.name)?;
            let bytes = input[..len].to_vec();
            input.advance(len);
            Ok(ParamValue::Bytes(bytes))
        }
    }
}

fn ensure(input: &[u8], needed: usize, name: &'static str) -> Result<(), ProtocolError> {
    if input.len() < needed {
        return Err(ProtocolError::TruncatedParameter {
            name,
            needed,
            available: input.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB: ParameterSpec = ParameterSpec {
        name: "blob",
        wire_index: 1,
        size: ParameterSize::Variable,
        direction: Direction::Both,
    };

    const WORD: ParameterSpec = ParameterSpec {
        name: "word",
        wire_index: 1,
        size: ParameterSize::Fixed(2),
        direction: Direction::Both,
    };

    fn blob_roundtrip(len: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut out = Vec::new();
        write_parameter(&mut out, &BLOB, &ParamValue::Bytes(data.clone())).unwrap();

        let mut input = out.as_slice();
        assert_eq!(read_parameter(&mut input, &BLOB).unwrap(), ParamValue::Bytes(data));
        assert!(input.is_empty());
        out
    }

    #[test]
    fn test_length_marker_boundaries() {
        assert_eq!(&blob_roundtrip(0)[..2], &[0xFF, 0]);
        assert_eq!(&blob_roundtrip(255)[..2], &[0xFF, 255]);
        assert_eq!(&blob_roundtrip(256)[..3], &[0xFE, 0x01, 0x00]);
        assert_eq!(&blob_roundtrip(65_535)[..3], &[0xFE, 0xFF, 0xFF]);
        assert_eq!(&blob_roundtrip(65_536)[..5], &[0xFD, 0, 1, 0, 0]);
    }

    #[test]
    fn test_marker_overhead() {
        assert_eq!(blob_roundtrip(255).len(), 255 + 2);
        assert_eq!(blob_roundtrip(256).len(), 256 + 3);
        assert_eq!(blob_roundtrip(65_536).len(), 65_536 + 5);
    }

    #[test]
    fn test_invalid_marker() {
        let mut input: &[u8] = &[0x10, 1, 2];
        assert_eq!(
            read_parameter(&mut input, &BLOB),
            Err(ProtocolError::InvalidLengthMarker {
                name: "blob",
                marker: 0x10
            })
        );
    }

    #[test]
    fn test_truncated_variable_block() {
        let mut input: &[u8] = &[0xFF, 10, 1, 2, 3];
        assert_eq!(
            read_parameter(&mut input, &BLOB),
            Err(ProtocolError::TruncatedParameter {
                name: "blob",
                needed: 10,
                available: 3
            })
        );
    }

    #[test]
    fn test_fixed_big_endian() {
        let mut out = Vec::new();
        write_parameter(&mut out, &WORD, &ParamValue::Uint(0x1234)).unwrap();
        assert_eq!(out, vec![0x12, 0x34]);
    }

    #[test]
    fn test_fixed_value_too_large() {
        let mut out = Vec::new();
        assert_eq!(
            write_parameter(&mut out, &WORD, &ParamValue::Uint(0x1_0000)),
            Err(ProtocolError::ValueTooLarge {
                name: "word",
                value: 0x1_0000
            })
        );
    }

    #[test]
    fn test_type_mismatch() {
        let mut out = Vec::new();
        assert_eq!(
            write_parameter(&mut out, &WORD, &ParamValue::Bytes(vec![1])),
            Err(ProtocolError::TypeMismatch { name: "word" })
        );
        assert_eq!(
            u16::from_value("word", ParamValue::Bytes(vec![])),
            Err(ProtocolError::TypeMismatch { name: "word" })
        );
    }

    #[test]
    fn test_direction_includes() {
        use Direction::*;
        assert!(Both.includes(PcToConsole));
        assert!(Both.includes(ConsoleToPc));
        assert!(PcToConsole.includes(PcToConsole));
        assert!(!PcToConsole.includes(ConsoleToPc));
        assert!(!Never.includes(PcToConsole));
        assert!(!Never.includes(ConsoleToPc));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(u8::SIZE, ParameterSize::Fixed(1));
        assert_eq!(u16::SIZE, ParameterSize::Fixed(2));
        assert_eq!(u32::SIZE, ParameterSize::Fixed(4));
        assert_eq!(<Vec<u8>>::SIZE, ParameterSize::Variable);
    }
}
