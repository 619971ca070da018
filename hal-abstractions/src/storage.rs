//! Persisted key-value file store collaborator

/// Identifier of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileId(pub u16);

impl FileId {
    /// Time subsystem variables
    pub const TIME_SYS: Self = Self(0x0010);
}

/// File store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// No record stored under this id
    NotFound,
    /// Record does not fit the caller's buffer or the backing medium
    TooLarge,
    /// Backing medium failed
    Io,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "record not found"),
            Self::TooLarge => write!(f, "record too large"),
            Self::Io => write!(f, "storage I/O error"),
        }
    }
}

impl core::error::Error for StorageError {}

/// Synchronous record store
///
/// Writes are all-or-nothing: a failed write leaves the previous record intact.
pub trait FileStore {
    /// Read the record `id` into `buf`, returning the number of bytes read
    fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Replace the record `id` with `data`
    fn write(&mut self, id: FileId, data: &[u8]) -> Result<(), StorageError>;
}
