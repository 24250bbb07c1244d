use core::fmt;

/// Errors returned by the codec and discovery layers.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// The input buffer was exhausted in the middle of a field.
    InputTooShort,

    /// A byte-granularity access was attempted while the bit accumulator was
    /// not empty.
    UnalignedBitAccess,

    /// A version field was outside the range accepted by this implementation.
    UnsupportedVersion,

    /// A length or type field was outside its allowed range.
    FieldOutOfRange,

    /// A string field did not hold valid UTF-8.
    InvalidUtf8,

    /// A declared length did not match the number of available bytes.
    LengthMismatch,

    /// An L2CAP command byte was not part of the command enumeration.
    UnknownCommand,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InputTooShort => "input ended in the middle of a field",
            Error::UnalignedBitAccess => "byte access with a non-empty bit accumulator",
            Error::UnsupportedVersion => "unsupported version field",
            Error::FieldOutOfRange => "field value out of range",
            Error::InvalidUtf8 => "string field is not valid UTF-8",
            Error::LengthMismatch => "declared length does not match available bytes",
            Error::UnknownCommand => "unknown command byte",
        })
    }
}

impl std::error::Error for Error {}
