use core::fmt::{Display, Formatter};
use core::sync::atomic::{AtomicU8, Ordering};

/// Failure categories reported by table generation and stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum QutErrorCode {
    #[default]
    None = 0,
    /// A CFI section (or one of its entries) could not be parsed.
    MalformedSection,
    /// Valid unwind info using a form the quicken bytecode can't express.
    UnsupportedEncoding,
    /// A read from image or process memory failed or came back short.
    BadMemoryRead,
    /// The image's architecture doesn't fit the requested operation.
    ArchMismatch,
    /// No compiled entry covers the pc.
    EntryNotFound,
    /// The pc doesn't belong to any registered image.
    InvalidMap,
    /// The recovered stack pointer didn't strictly increase.
    StackCorrupted,
    /// The image has no usable unwind source.
    NoUnwindInfo,
    /// Bytecode in the compiled table failed to decode.
    InvalidProgram,
}

impl QutErrorCode {
    pub fn is_none(self) -> bool {
        self == QutErrorCode::None
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => QutErrorCode::MalformedSection,
            2 => QutErrorCode::UnsupportedEncoding,
            3 => QutErrorCode::BadMemoryRead,
            4 => QutErrorCode::ArchMismatch,
            5 => QutErrorCode::EntryNotFound,
            6 => QutErrorCode::InvalidMap,
            7 => QutErrorCode::StackCorrupted,
            8 => QutErrorCode::NoUnwindInfo,
            9 => QutErrorCode::InvalidProgram,
            _ => QutErrorCode::None,
        }
    }
}

impl Display for QutErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            QutErrorCode::None => "none",
            QutErrorCode::MalformedSection => "malformed unwind section",
            QutErrorCode::UnsupportedEncoding => "unsupported unwind encoding",
            QutErrorCode::BadMemoryRead => "memory read failed",
            QutErrorCode::ArchMismatch => "architecture mismatch",
            QutErrorCode::EntryNotFound => "no quicken entry for pc",
            QutErrorCode::InvalidMap => "pc outside of any known image",
            QutErrorCode::StackCorrupted => "stack pointer did not increase",
            QutErrorCode::NoUnwindInfo => "no usable unwind info",
            QutErrorCode::InvalidProgram => "invalid quicken program",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for QutErrorCode {}

impl From<gimli::Error> for QutErrorCode {
    fn from(err: gimli::Error) -> Self {
        match err {
            gimli::Error::UnsupportedPointerEncoding
            | gimli::Error::UnknownAugmentation
            | gimli::Error::UnknownCallFrameInstruction(_)
            | gimli::Error::UnknownVersion(_)
            | gimli::Error::UnsupportedAddressSize(_)
            | gimli::Error::CfiInstructionInInvalidContext => QutErrorCode::UnsupportedEncoding,
            _ => QutErrorCode::MalformedSection,
        }
    }
}

/// Last error seen by an interface. Shared by concurrent steppers, so it only
/// ever holds the most recent code.
#[derive(Debug, Default)]
pub(crate) struct LastError(AtomicU8);

impl LastError {
    pub(crate) fn set(&self, code: QutErrorCode) {
        self.0.store(code as u8, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> QutErrorCode {
        QutErrorCode::from_u8(self.0.load(Ordering::Relaxed))
    }
}
