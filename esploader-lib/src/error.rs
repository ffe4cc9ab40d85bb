use thiserror::Error;

/// Convenient result type for `esploader-lib`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error("Intel HEX parse error: {0}")]
    IntelHex(#[from] ihex::ReaderError),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("integer parse error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timeout while {0}")]
    Timeout(String),

    #[error("unsupported command: the bootloader rejected {0}")]
    UnsupportedCommand(String),

    #[error("invalid response: no matching reply to {0} after {1} packets")]
    InvalidResponse(String, usize),

    #[error("failed to connect to the bootloader after {attempts} attempts")]
    SyncFailed { attempts: u32 },

    #[error("unknown chip magic value {0:#010x}")]
    UnknownChip(u32),

    #[error("connected chip is {detected}, expected {expected}")]
    ChipMismatch { expected: String, detected: String },

    #[error("stub failed to start: {0}")]
    StubStart(String),

    #[error("{0} is only available once the stub is running")]
    StubRequired(&'static str),

    #[error("MD5 mismatch: expected {expected}, device reported {actual}")]
    Md5Mismatch { expected: String, actual: String },

    #[error("invalid custom reset sequence: {0}")]
    InvalidResetSequence(String),

    #[error(
        "file {index} ending at {end:#010x} does not fit into {flash_size:#x} bytes of flash"
    )]
    FlashFit {
        index: usize,
        end: u64,
        flash_size: u32,
    },

    #[error("unsupported chip: {0}")]
    UnsupportedChip(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
