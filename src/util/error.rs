use std::fmt;
use std::os::raw::c_int;

/// Every failure an operation can surface, mapped onto classic errno values
/// at the FUSE boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NoEntry,
    Exists,
    IsDirectory,
    NotDirectory,
    NotEmpty,
    NameTooLong,
    NoSpace,
    Io,
    AccessDenied,
    Permission,
    InvalidArgument,
    TooManySymlinks,
    TooLarge,
    NoMemory,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(self) -> c_int {
        match self {
            FsError::NoEntry => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Io => libc::EIO,
            FsError::AccessDenied => libc::EACCES,
            FsError::Permission => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::TooManySymlinks => libc::ELOOP,
            FsError::TooLarge => libc::EFBIG,
            FsError::NoMemory => libc::ENOMEM,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FsError::NoEntry => "no such file or directory",
            FsError::Exists => "file exists",
            FsError::IsDirectory => "is a directory",
            FsError::NotDirectory => "not a directory",
            FsError::NotEmpty => "directory not empty",
            FsError::NameTooLong => "name too long",
            FsError::NoSpace => "no space left on device",
            FsError::Io => "input/output error",
            FsError::AccessDenied => "access denied",
            FsError::Permission => "operation not permitted",
            FsError::InvalidArgument => "invalid argument",
            FsError::TooManySymlinks => "too many levels of symbolic links",
            FsError::TooLarge => "file too large",
            FsError::NoMemory => "out of memory",
        };
        f.write_str(text)
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(_: std::io::Error) -> FsError {
        FsError::Io
    }
}
