//! Typed messages and the generic parameter codec.
//!
//! Messages are declared with [`gebug_message!`](crate::gebug_message), which
//! generates the struct and its [`GebugCommand`] implementation from a field
//! list annotated with wire index and direction. Encoding and decoding are
//! written once, against the static parameter list.

use super::parameter::{read_parameter, write_parameter, Direction, ParamValue, ParameterSpec};
use super::{Category, GebugMessage};
use crate::error::ProtocolError;

/// A message type with a static parameter schema.
pub trait GebugCommand: Sized {
    const CATEGORY: Category;
    const COMMAND: u8;
    const NAME: &'static str;

    /// Parameters in declaration order.
    fn parameters() -> &'static [ParameterSpec];

    /// Field values in declaration order.
    fn values(&self) -> Vec<ParamValue>;

    /// Rebuild from values in declaration order. `None` marks a parameter
    /// that was not on the wire in this direction; the field takes its
    /// default.
    fn from_values(values: Vec<Option<ParamValue>>) -> Result<Self, ProtocolError>;

    /// Parameter stream for `direction`.
    fn encode_body(&self, direction: Direction) -> Result<Vec<u8>, ProtocolError> {
        encode_parameters(Self::parameters(), &self.values(), direction)
    }

    /// Decode a parameter stream sent in `direction`.
    fn decode_body(body: &[u8], direction: Direction) -> Result<Self, ProtocolError> {
        Self::from_values(decode_parameters(Self::parameters(), body, direction)?)
    }
}

/// Indices into `specs` of the parameters carried in `direction`, in wire order.
fn wire_order(specs: &[ParameterSpec], direction: Direction) -> Vec<usize> {
    let mut order: Vec<usize> = (0..specs.len())
        .filter(|&i| specs[i].direction.includes(direction))
        .collect();
    order.sort_by_key(|&i| specs[i].wire_index);
    order
}

/// Write the parameters included in `direction` in ascending wire index.
pub fn encode_parameters(
    specs: &[ParameterSpec],
    values: &[ParamValue],
    direction: Direction,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    for i in wire_order(specs, direction) {
        let value = values
            .get(i)
            .ok_or(ProtocolError::TypeMismatch { name: specs[i].name })?;
        write_parameter(&mut out, &specs[i], value)?;
    }
    Ok(out)
}

/// Read the parameters included in `direction`.
///
/// The body must be consumed exactly.
pub fn decode_parameters(
    specs: &[ParameterSpec],
    body: &[u8],
    direction: Direction,
) -> Result<Vec<Option<ParamValue>>, ProtocolError> {
    let mut values = vec![None; specs.len()];
    let mut input = body;
    for i in wire_order(specs, direction) {
        values[i] = Some(read_parameter(&mut input, &specs[i])?);
    }
    if !input.is_empty() {
        return Err(ProtocolError::TrailingBytes { count: input.len() });
    }
    Ok(values)
}

/// A decoded message with its correlation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: u16,
    /// Id of the message this one answers.
    pub reply_to: Option<u16>,
    pub message: GebugMessage,
}

impl Envelope {
    /// Whether this envelope answers `message_id`.
    pub fn answers(&self, message_id: u16) -> bool {
        self.reply_to == Some(message_id)
    }
}

/// Declare Gebug message types.
///
/// Each field names its Rust type, wire index and direction. Field types must
/// implement [`ParameterType`](crate::gebug::ParameterType).
///
/// ```
/// use gebug_link::gebug::{Direction, GebugCommand, ParameterSize};
///
/// gebug_link::gebug_message! {
///     /// Read a word of RAM.
///     PeekWord (Memory, 40) {
///         value: u32 => (2, ConsoleToPc),
///         address: u32 => (1, PcToConsole),
///     }
/// }
///
/// assert_eq!(PeekWord::parameters()[0].size, ParameterSize::Fixed(4));
/// let peek = PeekWord { address: 0x8000_0000, value: 0 };
/// assert_eq!(peek.encode_body(Direction::PcToConsole).unwrap(), vec![0x80, 0, 0, 0]);
/// ```
#[macro_export]
macro_rules! gebug_message {
    ($(
        $(#[$meta:meta])*
        $name:ident ($category:ident, $command:expr) {
            $(
                $(#[$field_meta:meta])*
                $field:ident : $ty:ty => ($index:expr, $dir:ident)
            ),* $(,)?
        }
    )*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $crate::gebug::GebugCommand for $name {
            const CATEGORY: $crate::gebug::Category = $crate::gebug::Category::$category;
            const COMMAND: u8 = $command;
            const NAME: &'static str = stringify!($name);

            fn parameters() -> &'static [$crate::gebug::ParameterSpec] {
                const PARAMETERS: &[$crate::gebug::ParameterSpec] = &[$(
                    $crate::gebug::ParameterSpec {
                        name: stringify!($field),
                        wire_index: $index,
                        size: <$ty as $crate::gebug::ParameterType>::SIZE,
                        direction: $crate::gebug::Direction::$dir,
                    },
                )*];
                PARAMETERS
            }

            fn values(&self) -> Vec<$crate::gebug::ParamValue> {
                vec![$($crate::gebug::ParameterType::to_value(&self.$field)),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(
                values: Vec<Option<$crate::gebug::ParamValue>>,
            ) -> Result<Self, $crate::error::ProtocolError> {
                let mut values = values.into_iter();
                Ok(Self {
                    $(
                        $field: match values.next().flatten() {
                            Some(value) => <$ty as $crate::gebug::ParameterType>::from_value(
                                stringify!($field),
                                value,
                            )?,
                            None => Default::default(),
                        },
                    )*
                })
            }
        }
    )*};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gebug::ParameterSize;

    crate::gebug_message! {
        Sample (Debug, 200) {
            blob: Vec<u8> => (3, Both),
            count: u16 => (1, PcToConsole),
            status: u8 => (2, ConsoleToPc),
            internal: u32 => (4, Never),
        }

        Empty (Debug, 201) {}
    }

    fn sample() -> Sample {
        Sample {
            blob: vec![9, 8, 7],
            count: 0x0102,
            status: 0x33,
            internal: 0xDEAD,
        }
    }

    #[test]
    fn test_schema() {
        let params = Sample::parameters();
        assert_eq!(params.len(), 4);
        assert_eq!(params[0].name, "blob");
        assert_eq!(params[0].size, ParameterSize::Variable);
        assert_eq!(params[1].wire_index, 1);
        assert_eq!(Sample::CATEGORY, Category::Debug);
        assert_eq!(Sample::COMMAND, 200);
        assert_eq!(Sample::NAME, "Sample");
    }

    #[test]
    fn test_wire_index_order_not_declaration_order() {
        let body = sample().encode_body(Direction::PcToConsole).unwrap();
        // count (1), then blob (3); status is console-to-pc only.
        assert_eq!(body, vec![0x01, 0x02, 0xFF, 3, 9, 8, 7]);

        let body = sample().encode_body(Direction::ConsoleToPc).unwrap();
        assert_eq!(body, vec![0x33, 0xFF, 3, 9, 8, 7]);
    }

    #[test]
    fn test_roundtrip_each_direction() {
        for direction in [Direction::PcToConsole, Direction::ConsoleToPc] {
            let body = sample().encode_body(direction).unwrap();
            let decoded = Sample::decode_body(&body, direction).unwrap();

            let mut expected = sample();
            expected.internal = 0;
            match direction {
                Direction::PcToConsole => expected.status = 0,
                _ => expected.count = 0,
            }
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_never_parameter_not_written() {
        let body = sample().encode_body(Direction::PcToConsole).unwrap();
        assert!(!body.windows(2).any(|w| w == [0xDE, 0xAD]));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut body = sample().encode_body(Direction::ConsoleToPc).unwrap();
        body.push(0);
        assert_eq!(
            Sample::decode_body(&body, Direction::ConsoleToPc),
            Err(ProtocolError::TrailingBytes { count: 1 })
        );
    }

    #[test]
    fn test_truncated_body_rejected() {
        let body = sample().encode_body(Direction::ConsoleToPc).unwrap();
        assert!(matches!(
            Sample::decode_body(&body[..body.len() - 1], Direction::ConsoleToPc),
            Err(ProtocolError::TruncatedParameter { name: "blob", .. })
        ));
    }

    #[test]
    fn test_empty_message() {
        assert!(Empty::parameters().is_empty());
        assert!(Empty {}.encode_body(Direction::PcToConsole).unwrap().is_empty());
        assert_eq!(Empty::decode_body(&[], Direction::ConsoleToPc).unwrap(), Empty {});
    }
}
