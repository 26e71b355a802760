//! The object dictionary
//!
//! The dictionary is the node's addressable table of (index, subindex) →
//! typed value. It is exercised from two sides: locally by the IPC responder,
//! and remotely through the SDO server. Entries implement [`ObjectAccess`];
//! simple data entries are built from [`Record`] and the field types here,
//! while special entries (such as the file transfer records) implement the
//! trait directly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::atomic::AtomicCell;
use oxcan_common::objects::{DataType, SubInfo};
use oxcan_common::sdo::AbortCode;

/// Access to one dictionary object and its sub objects
///
/// All errors are reported as abort codes, which is the error currency of
/// both sides that call into the dictionary.
pub trait ObjectAccess: Send + Sync {
    /// Get the attributes of a sub object
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode>;

    /// The number of bytes a read of this sub object will currently return
    fn current_size(&self, sub: u8) -> Result<usize, AbortCode>;

    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns the number of bytes read, which is short only at the end of
    /// the data.
    fn read(&self, sub: u8, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// Replace the value of a sub object
    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode>;

    /// Begin a streamed multi-part write
    ///
    /// Only large (domain) sub objects support this; everything else takes
    /// whole values through [`ObjectAccess::write`].
    fn begin_partial(&self, _sub: u8, _declared_size: Option<u64>) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Append one chunk of a streamed write
    fn write_partial(&self, _sub: u8, _data: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Commit a streamed write
    fn end_partial(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Discard a streamed write without committing it
    fn abort_partial(&self, _sub: u8) {}
}

/// A field holding the bytes of one sub object
pub trait SubField: Send + Sync {
    /// Current value size in bytes
    fn size(&self) -> usize;
    /// Read the value starting at `offset` into `buf`, returning bytes read
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode>;
    /// Replace the value
    fn write(&self, data: &[u8]) -> Result<(), AbortCode>;
}

/// A scalar sub object value
pub struct ScalarCell<T: Copy> {
    value: AtomicCell<T>,
}

impl<T: Copy> ScalarCell<T> {
    /// Create a cell holding `value`
    pub fn new(value: T) -> Self {
        Self {
            value: AtomicCell::new(value),
        }
    }

    /// Read the value
    pub fn load(&self) -> T {
        self.value.load()
    }

    /// Store a new value
    pub fn store(&self, value: T) {
        self.value.store(value);
    }
}

macro_rules! impl_scalar_field {
    ($rust_type: ty) => {
        impl SubField for ScalarCell<$rust_type> {
            fn size(&self) -> usize {
                core::mem::size_of::<$rust_type>()
            }

            fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
                let bytes = self.value.load().to_le_bytes();
                read_from_slice(&bytes, offset, buf)
            }

            fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
                let value = <$rust_type>::from_le_bytes(data.try_into().map_err(|_| {
                    if data.len() < core::mem::size_of::<$rust_type>() {
                        AbortCode::DataTypeMismatchLengthLow
                    } else {
                        AbortCode::DataTypeMismatchLengthHigh
                    }
                })?);
                self.value.store(value);
                Ok(())
            }
        }
    };
}

impl_scalar_field!(u8);
impl_scalar_field!(u16);
impl_scalar_field!(u32);
impl_scalar_field!(u64);
impl_scalar_field!(i8);
impl_scalar_field!(i16);
impl_scalar_field!(i32);
impl_scalar_field!(i64);

// bool has no from_le_bytes, so it gets its own implementation
impl SubField for ScalarCell<bool> {
    fn size(&self) -> usize {
        1
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let byte = [self.value.load() as u8];
        read_from_slice(&byte, offset, buf)
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() != 1 {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.value.store(data[0] != 0);
        Ok(())
    }
}

/// Copy out of a value's byte representation, handling offset and short reads
pub(crate) fn read_from_slice(bytes: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
    let offset = offset as usize;
    if offset >= bytes.len() {
        return Ok(0);
    }
    let read_len = buf.len().min(bytes.len() - offset);
    buf[0..read_len].copy_from_slice(&bytes[offset..offset + read_len]);
    Ok(read_len)
}

/// A variable-length string sub object with a maximum size
pub struct StrField {
    value: Mutex<Vec<u8>>,
    max_size: usize,
}

impl StrField {
    /// Create a field with an initial value and a maximum size
    pub fn new<S: Into<String>>(value: S, max_size: usize) -> Self {
        Self {
            value: Mutex::new(value.into().into_bytes()),
            max_size,
        }
    }

    /// Read the value as a string
    pub fn load_string(&self) -> String {
        String::from_utf8_lossy(&self.value.lock().unwrap()).into()
    }
}

impl SubField for StrField {
    fn size(&self) -> usize {
        self.value.lock().unwrap().len()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
        read_from_slice(&self.value.lock().unwrap(), offset, buf)
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > self.max_size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        // Trailing null terminators are not part of the value
        let len = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        *self.value.lock().unwrap() = data[0..len].to_vec();
        Ok(())
    }
}

/// A constant sub object whose value never changes
pub struct ConstBytes {
    bytes: Vec<u8>,
}

impl ConstBytes {
    /// Create a const field; use `to_le_bytes` for scalar values
    pub fn new<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl SubField for ConstBytes {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
        read_from_slice(&self.bytes, offset, buf)
    }

    fn write(&self, _data: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::ReadOnly)
    }
}

/// A dictionary object assembled from per-sub fields
#[derive(Default)]
pub struct Record {
    subs: BTreeMap<u8, (SubInfo, Box<dyn SubField>)>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sub object
    pub fn sub(mut self, sub: u8, info: SubInfo, field: impl SubField + 'static) -> Self {
        self.subs.insert(sub, (info, Box::new(field)));
        self
    }

    /// Create a single-value object (sub 0 only)
    pub fn var(info: SubInfo, field: impl SubField + 'static) -> Self {
        Self::new().sub(0, info, field)
    }

    fn field(&self, sub: u8) -> Result<&(SubInfo, Box<dyn SubField>), AbortCode> {
        self.subs.get(&sub).ok_or(AbortCode::NoSuchSubIndex)
    }
}

impl ObjectAccess for Record {
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        Ok(self.field(sub)?.0)
    }

    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.field(sub)?.1.size())
    }

    fn read(&self, sub: u8, offset: u64, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.field(sub)?.1.read(offset, buf)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.field(sub)?.1.write(data)
    }
}

/// The node's object dictionary
///
/// Cheap to share: entries use interior mutability, and the table itself is
/// immutable after construction.
pub struct Dictionary {
    entries: BTreeMap<u16, Arc<dyn ObjectAccess>>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register an object at an index
    pub fn insert(&mut self, index: u16, object: Arc<dyn ObjectAccess>) {
        self.entries.insert(index, object);
    }

    /// Look up an object
    pub fn find(&self, index: u16) -> Option<&Arc<dyn ObjectAccess>> {
        self.entries.get(&index)
    }

    fn object(&self, index: u16) -> Result<&Arc<dyn ObjectAccess>, AbortCode> {
        self.entries.get(&index).ok_or(AbortCode::NoSuchObject)
    }

    /// Get the attributes of a sub object
    pub fn sub_info(&self, index: u16, sub: u8) -> Result<SubInfo, AbortCode> {
        self.object(index)?.sub_info(sub)
    }

    /// Read the full current value of a sub object, attribute-checked
    pub fn read_value(&self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        let obj = self.object(index)?;
        let info = obj.sub_info(sub)?;
        if !info.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        let size = obj.current_size(sub)?;
        let mut buf = vec![0u8; size];
        let read = obj.read(sub, 0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Write the value of a sub object, attribute- and size-checked
    pub fn write_value(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let obj = self.object(index)?;
        let info = obj.sub_info(sub)?;
        if !info.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        validate_write_size(&info, data.len())?;
        obj.write(sub, data)
    }

    /// Store a value directly, bypassing the access attribute check
    ///
    /// For the daemon's own internal updates of read-only entries, such as
    /// the error register.
    pub fn store(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.object(index)?.write(sub, data)
    }

    /// Read a u8 sub object
    pub fn read_u8(&self, index: u16, sub: u8) -> Result<u8, AbortCode> {
        let data = self.read_value(index, sub)?;
        if data.len() != 1 {
            return Err(AbortCode::DataTypeMismatch);
        }
        Ok(data[0])
    }

    /// Read a u16 sub object
    pub fn read_u16(&self, index: u16, sub: u8) -> Result<u16, AbortCode> {
        let data = self.read_value(index, sub)?;
        data.try_into()
            .map(u16::from_le_bytes)
            .map_err(|_| AbortCode::DataTypeMismatch)
    }

    /// Read a u32 sub object
    pub fn read_u32(&self, index: u16, sub: u8) -> Result<u32, AbortCode> {
        let data = self.read_value(index, sub)?;
        data.try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| AbortCode::DataTypeMismatch)
    }

    /// Read a string sub object
    pub fn read_string(&self, index: u16, sub: u8) -> Result<String, AbortCode> {
        let data = self.read_value(index, sub)?;
        Ok(String::from_utf8_lossy(&data).into())
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a whole-value write length against a sub object's attributes
///
/// Strings and domains accept shorter writes; all other types require the
/// exact size.
pub fn validate_write_size(info: &SubInfo, len: usize) -> Result<(), AbortCode> {
    if info.data_type.is_str() || info.data_type == DataType::Domain {
        if info.size != 0 && len > info.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    } else if len < info.size {
        return Err(AbortCode::DataTypeMismatchLengthLow);
    } else if len > info.size {
        return Err(AbortCode::DataTypeMismatchLengthHigh);
    }
    Ok(())
}

/// The identity values reported in object 0x1018
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity {
    /// CiA assigned vendor ID
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

/// Build a dictionary holding the standard objects every oxcand node serves
///
/// | Index  | Object |
/// |--------|--------|
/// | 0x1000 | Device type |
/// | 0x1001 | Error register |
/// | 0x1017 | Producer heartbeat time (ms) |
/// | 0x1018 | Identity record |
pub fn standard_dictionary(device_type: u32, identity: Identity, heartbeat_ms: u16) -> Dictionary {
    use oxcan_common::constants::object_ids;

    let mut dict = Dictionary::new();
    dict.insert(
        object_ids::DEVICE_TYPE,
        Arc::new(Record::var(
            SubInfo::new_u32().const_access(),
            ConstBytes::new(device_type.to_le_bytes().to_vec()),
        )),
    );
    dict.insert(
        object_ids::ERROR_REGISTER,
        Arc::new(Record::var(SubInfo::new_u8(), ScalarCell::new(0u8))),
    );
    dict.insert(
        object_ids::HEARTBEAT_PRODUCER_TIME,
        Arc::new(Record::var(
            SubInfo::new_u16().rw_access(),
            ScalarCell::new(heartbeat_ms),
        )),
    );
    dict.insert(
        object_ids::IDENTITY,
        Arc::new(
            Record::new()
                .sub(0, SubInfo::MAX_SUB_NUMBER, ConstBytes::new(vec![4u8]))
                .sub(1, SubInfo::new_u32(), ScalarCell::new(identity.vendor_id))
                .sub(
                    2,
                    SubInfo::new_u32(),
                    ScalarCell::new(identity.product_code),
                )
                .sub(3, SubInfo::new_u32(), ScalarCell::new(identity.revision))
                .sub(4, SubInfo::new_u32(), ScalarCell::new(identity.serial)),
        ),
    );
    dict
}
