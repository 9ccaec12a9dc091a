#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemError {
    Unmapped,
    ReadViolation,
    WriteViolation,
    ExecViolation,
    AddressOverflow,
    Unknown,
}

impl std::str::FromStr for MemError {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Unmapped" => Self::Unmapped,
            "ReadViolation" => Self::ReadViolation,
            "WriteViolation" => Self::WriteViolation,
            "ExecViolation" => Self::ExecViolation,
            "AddressOverflow" => Self::AddressOverflow,
            _ => Self::Unknown,
        })
    }
}

impl MemError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unmapped => "Unmapped",
            Self::ReadViolation => "ReadViolation",
            Self::WriteViolation => "WriteViolation",
            Self::ExecViolation => "ExecViolation",
            Self::AddressOverflow => "AddressOverflow",
            Self::Unknown => "Unknown",
        }
    }

    pub const fn code(self) -> u64 {
        match self {
            Self::Unmapped => 0x1_0000,
            Self::ReadViolation => 0x1_0002,
            Self::WriteViolation => 0x1_0003,
            Self::ExecViolation => 0x1_0004,
            Self::AddressOverflow => 0x1_000b,
            Self::Unknown => 0x1_FFFF,
        }
    }

    pub const fn from_code(code: u64) -> MemError {
        match code {
            0x1_0000 => Self::Unmapped,
            0x1_0002 => Self::ReadViolation,
            0x1_0003 => Self::WriteViolation,
            0x1_0004 => Self::ExecViolation,
            0x1_000b => Self::AddressOverflow,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for MemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for MemError {}

pub type MemResult<T> = Result<T, MemError>;

pub const NONE: u8 = 0b0000_0000;
pub const READ: u8 = 0b0000_0010;
pub const WRITE: u8 = 0b0000_0100;
pub const EXEC: u8 = 0b0000_1000;
pub const MAP: u8 = 0b0001_0000;

/// Set on pages that have had bytes handed to the translator, writes to these pages notify the
/// registered write hooks.
pub const IN_CODE_CACHE: u8 = 0b1000_0000;

pub const RW: u8 = READ | WRITE;
pub const RX: u8 = READ | EXEC;
pub const RWX: u8 = READ | WRITE | EXEC;

/// Checks that the page permission `perm` allows an access requiring `mask`.
#[inline(always)]
pub fn check(perm: u8, mask: u8) -> MemResult<()> {
    let required = mask | MAP;
    if perm & required != required {
        return Err(get_error_kind(perm, mask));
    }
    Ok(())
}

#[inline(never)]
#[cold]
fn get_error_kind(perm: u8, mask: u8) -> MemError {
    let missing = !perm & (mask | MAP);
    if missing & MAP != 0 {
        MemError::Unmapped
    }
    else if missing & READ != 0 {
        MemError::ReadViolation
    }
    else if missing & WRITE != 0 {
        MemError::WriteViolation
    }
    else if missing & EXEC != 0 {
        MemError::ExecViolation
    }
    else {
        MemError::Unknown
    }
}

#[must_use]
pub fn display(value: u8) -> Permission {
    Permission(value)
}

#[derive(PartialEq, Eq)]
pub struct Permission(u8);

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let perm = self.0;

        let mut values = vec![];
        if perm & MAP == 0 {
            return f.write_str("Unmapped");
        }
        if perm & READ != 0 {
            values.push("R");
        }
        if perm & WRITE != 0 {
            values.push("W");
        }
        if perm & EXEC != 0 {
            values.push("X");
        }
        if perm & IN_CODE_CACHE != 0 {
            values.push("Code");
        }

        if values.is_empty() {
            return f.write_str("NONE");
        }

        f.write_str(&values.join(" | "))
    }
}

impl std::fmt::Debug for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
