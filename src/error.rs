use core::fmt;

/// Error kinds shared by the kernel, the file system server and its
/// clients. The numeric values travel over the IPC wire as negative
/// scalars, so they are part of the ABI and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    Unspecified = 1,
    BadEnv = 2,
    Invalid = 3,
    NoMem = 4,
    NoFreeEnv = 5,
    IpcNotRecv = 6,
    NoDisk = 7,
    MaxOpen = 8,
    NotFound = 9,
    BadPath = 10,
    FileExists = 11,
}

impl Error {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Error> {
        match code {
            1 => Some(Error::Unspecified),
            2 => Some(Error::BadEnv),
            3 => Some(Error::Invalid),
            4 => Some(Error::NoMem),
            5 => Some(Error::NoFreeEnv),
            6 => Some(Error::IpcNotRecv),
            7 => Some(Error::NoDisk),
            8 => Some(Error::MaxOpen),
            9 => Some(Error::NotFound),
            10 => Some(Error::BadPath),
            11 => Some(Error::FileExists),
            _ => None,
        }
    }

    /// Decode an IPC reply scalar: non-negative values pass through,
    /// negative values map back to an error kind.
    pub fn from_ipc(value: i32) -> Result<u32> {
        if value >= 0 {
            Ok(value as u32)
        } else {
            Err(Error::from_code(-value).unwrap_or(Error::Unspecified))
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Unspecified => "unspecified error",
            Error::BadEnv => "bad environment",
            Error::Invalid => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::NoFreeEnv => "out of environments",
            Error::IpcNotRecv => "env is not recving",
            Error::NoDisk => "out of disk blocks",
            Error::MaxOpen => "too many files are open",
            Error::NotFound => "file or block not found",
            Error::BadPath => "bad path",
            Error::FileExists => "file already exists",
        };
        f.write_str(s)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
