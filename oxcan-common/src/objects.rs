//! Object attribute definitions
//!

/// Access type enum
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and also will never be changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }
}

/// Indicate the type of data stored in an object
///
/// The discriminants are the CiA-301 data type codes, which are also used as
/// the dtype tag byte in IPC dictionary access messages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum DataType {
    Boolean = 0x01,
    #[default]
    Int8 = 0x02,
    Int16 = 0x03,
    Int32 = 0x04,
    UInt8 = 0x05,
    UInt16 = 0x06,
    UInt32 = 0x07,
    Real32 = 0x08,
    VisibleString = 0x09,
    OctetString = 0x0a,
    Domain = 0x0f,
    Real64 = 0x11,
    Int64 = 0x15,
    UInt64 = 0x1b,
}

impl TryFrom<u8> for DataType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use DataType::*;
        match value {
            0x01 => Ok(Boolean),
            0x02 => Ok(Int8),
            0x03 => Ok(Int16),
            0x04 => Ok(Int32),
            0x05 => Ok(UInt8),
            0x06 => Ok(UInt16),
            0x07 => Ok(UInt32),
            0x08 => Ok(Real32),
            0x09 => Ok(VisibleString),
            0x0a => Ok(OctetString),
            0x0f => Ok(Domain),
            0x11 => Ok(Real64),
            0x15 => Ok(Int64),
            0x1b => Ok(UInt64),
            _ => Err(()),
        }
    }
}

impl DataType {
    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(self, Self::VisibleString | Self::OctetString)
    }

    /// The wire size of a value of this type, or None for variable-length types
    pub fn fixed_size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Real32 => Some(4),
            Int64 | UInt64 | Real64 => Some(8),
            VisibleString | OctetString | Domain => None,
        }
    }
}

/// Information about a sub object
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SubInfo {
    /// The size (or max size) of this sub object, in bytes
    pub size: usize,
    /// The data type of this sub object
    pub data_type: DataType,
    /// Indicates what accesses (i.e. read/write) are allowed on this sub object
    pub access_type: AccessType,
    /// Indicates whether this sub may be mapped to PDOs
    pub pdo_mappable: bool,
}

impl SubInfo {
    /// A shorthand value for sub0 on record and array objects
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        pdo_mappable: false,
    };

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u8() -> Self {
        Self {
            size: 1,
            data_type: DataType::UInt8,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u16() -> Self {
        Self {
            size: 2,
            data_type: DataType::UInt16,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u32() -> Self {
        Self {
            size: 4,
            data_type: DataType::UInt32,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u64() -> Self {
        Self {
            size: 8,
            data_type: DataType::UInt64,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_bool() -> Self {
        Self {
            size: 1,
            data_type: DataType::Boolean,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_visible_str(size: usize) -> Self {
        Self {
            size,
            data_type: DataType::VisibleString,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_domain() -> Self {
        Self {
            size: 0,
            data_type: DataType::Domain,
            access_type: AccessType::Ro,
            pdo_mappable: false,
        }
    }

    /// Convenience function to set the access_type to read-only
    pub const fn ro_access(mut self) -> Self {
        self.access_type = AccessType::Ro;
        self
    }

    /// Convenience function to set the access_type to read-write
    pub const fn rw_access(mut self) -> Self {
        self.access_type = AccessType::Rw;
        self
    }

    /// Convenience function to set the access_type to write-only
    pub const fn wo_access(mut self) -> Self {
        self.access_type = AccessType::Wo;
        self
    }

    /// Convenience function to set the access_type to const
    pub const fn const_access(mut self) -> Self {
        self.access_type = AccessType::Const;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_type() {
        assert!(AccessType::Ro.is_readable());
        assert!(!AccessType::Ro.is_writable());
        assert!(!AccessType::Wo.is_readable());
        assert!(AccessType::Wo.is_writable());
        assert!(AccessType::Rw.is_readable() && AccessType::Rw.is_writable());
        assert!(AccessType::Const.is_readable() && !AccessType::Const.is_writable());
    }

    #[test]
    fn test_data_type_tags() {
        for dt in [
            DataType::Boolean,
            DataType::UInt32,
            DataType::VisibleString,
            DataType::Domain,
            DataType::UInt64,
        ] {
            assert_eq!(Ok(dt), DataType::try_from(dt as u8));
        }
        assert!(DataType::try_from(0x99).is_err());
    }
}
