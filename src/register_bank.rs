/// Register banks for server-side data storage
///
/// A bank stores one kind of Modbus data (bits or 16-bit words) indexed by a
/// storage index in `0..=65535`. Two layouts share the [`RegisterBank`] capability:
///
/// - [`DenseBank`]: every index exists, unset entries hold the default value.
/// - [`SparseBank`]: only configured indices exist; touching any other index is an
///   `IllegalDataAddress` unless default fill is enabled.
///
/// Banks are not synchronized themselves; the register store wraps each one in
/// its own lock.

use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::{ModbusException, ADDRESS_SPACE};

/// Value stored in a register bank
pub trait RegisterValue: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl RegisterValue for bool {}
impl RegisterValue for u16 {}

/// Storage layout of a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankLayout {
    /// All 65536 indices exist
    Dense,
    /// Only configured indices exist
    Sparse {
        /// Serve the default value for unconfigured indices instead of failing
        default_fill: bool,
    },
}

/// Capability shared by all bank layouts
///
/// `write` is all-or-nothing: either every value is stored or the bank is left
/// untouched and an exception is returned.
pub trait RegisterBank<T: RegisterValue>: Send + Sync + fmt::Debug {
    /// Read `count` consecutive values starting at `index`
    fn read(&self, index: u16, count: u16) -> Result<Vec<T>, ModbusException>;

    /// Store `values` at consecutive indices starting at `index`
    fn write(&mut self, index: u16, values: &[T]) -> Result<(), ModbusException>;

    /// Number of addressable entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn layout(&self) -> BankLayout;

    /// Entries worth persisting, keyed by storage index
    ///
    /// Dense banks report only non-default entries; sparse banks report their
    /// complete configured set.
    fn snapshot(&self) -> BTreeMap<u16, T>;
}

/// Reject empty ranges and ranges running past the last index
fn check_range(index: u16, count: usize) -> Result<(), ModbusException> {
    if count == 0 || index as usize + count > ADDRESS_SPACE {
        return Err(ModbusException::IllegalDataAddress);
    }
    Ok(())
}

/// Bank backed by a fully allocated table
#[derive(Clone)]
pub struct DenseBank<T: RegisterValue> {
    values: Vec<T>,
}

impl<T: RegisterValue> DenseBank<T> {
    /// Create a bank with every entry set to the default value
    pub fn new() -> Self {
        Self {
            values: vec![T::default(); ADDRESS_SPACE],
        }
    }

    /// Create a bank seeded from `seeds`, default elsewhere
    pub fn from_seeds(seeds: &BTreeMap<u16, T>) -> Self {
        let mut bank = Self::new();
        for (&index, &value) in seeds {
            bank.values[index as usize] = value;
        }
        bank
    }
}

impl<T: RegisterValue> Default for DenseBank<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RegisterValue> fmt::Debug for DenseBank<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let populated = self.values.iter().filter(|v| **v != T::default()).count();
        f.debug_struct("DenseBank")
            .field("len", &self.values.len())
            .field("populated", &populated)
            .finish()
    }
}

impl<T: RegisterValue> RegisterBank<T> for DenseBank<T> {
    fn read(&self, index: u16, count: u16) -> Result<Vec<T>, ModbusException> {
        check_range(index, count as usize)?;
        let start = index as usize;
        Ok(self.values[start..start + count as usize].to_vec())
    }

    fn write(&mut self, index: u16, values: &[T]) -> Result<(), ModbusException> {
        check_range(index, values.len())?;
        let start = index as usize;
        self.values[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn layout(&self) -> BankLayout {
        BankLayout::Dense
    }

    fn snapshot(&self) -> BTreeMap<u16, T> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, value)| **value != T::default())
            .map(|(index, value)| (index as u16, *value))
            .collect()
    }
}

/// Bank holding only configured indices
#[derive(Debug, Clone)]
pub struct SparseBank<T: RegisterValue> {
    values: BTreeMap<u16, T>,
    default_fill: bool,
}

impl<T: RegisterValue> SparseBank<T> {
    /// Create a bank with exactly the indices in `seeds`
    pub fn new(seeds: BTreeMap<u16, T>) -> Self {
        Self {
            values: seeds,
            default_fill: false,
        }
    }

    /// Serve default values for unconfigured indices; writes then add them
    pub fn with_default_fill(mut self, default_fill: bool) -> Self {
        self.default_fill = default_fill;
        self
    }

    fn check_configured(&self, index: u16, count: usize) -> Result<(), ModbusException> {
        check_range(index, count)?;
        if self.default_fill {
            return Ok(());
        }
        let end = index as usize + count;
        let configured = self.values.range(index..).take_while(|(k, _)| (**k as usize) < end).count();
        if configured != count {
            return Err(ModbusException::IllegalDataAddress);
        }
        Ok(())
    }
}

impl<T: RegisterValue> RegisterBank<T> for SparseBank<T> {
    fn read(&self, index: u16, count: u16) -> Result<Vec<T>, ModbusException> {
        self.check_configured(index, count as usize)?;
        Ok((0..count)
            .map(|offset| {
                self.values
                    .get(&(index + offset))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    fn write(&mut self, index: u16, values: &[T]) -> Result<(), ModbusException> {
        self.check_configured(index, values.len())?;
        for (offset, value) in values.iter().enumerate() {
            self.values.insert(index + offset as u16, *value);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn layout(&self) -> BankLayout {
        BankLayout::Sparse {
            default_fill: self.default_fill,
        }
    }

    fn snapshot(&self) -> BTreeMap<u16, T> {
        self.values.clone()
    }
}

/// Build a bank of the requested layout from seed values keyed by storage index
pub fn build_bank<T: RegisterValue>(
    layout: BankLayout,
    seeds: BTreeMap<u16, T>,
) -> Box<dyn RegisterBank<T>> {
    match layout {
        BankLayout::Dense => Box::new(DenseBank::from_seeds(&seeds)),
        BankLayout::Sparse { default_fill } => {
            Box::new(SparseBank::new(seeds).with_default_fill(default_fill))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_read_write() {
        let mut bank: DenseBank<u16> = DenseBank::new();
        assert_eq!(bank.len(), ADDRESS_SPACE);

        bank.write(100, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read(100, 3).unwrap(), vec![100, 200, 300]);
        assert_eq!(bank.read(99, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_dense_range_limits() {
        let mut bank: DenseBank<bool> = DenseBank::new();
        assert_eq!(bank.read(65535, 1).unwrap(), vec![false]);
        assert_eq!(bank.read(65535, 2), Err(ModbusException::IllegalDataAddress));
        assert_eq!(bank.read(0, 0), Err(ModbusException::IllegalDataAddress));
        assert_eq!(bank.write(65534, &[true; 3]), Err(ModbusException::IllegalDataAddress));
        // Nothing written by the rejected request
        assert_eq!(bank.read(65534, 2).unwrap(), vec![false, false]);
    }

    #[test]
    fn test_dense_snapshot_skips_defaults() {
        let mut bank: DenseBank<u16> = DenseBank::new();
        bank.write(10, &[300, 0, 7]).unwrap();
        let snapshot = bank.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&10), Some(&300));
        assert_eq!(snapshot.get(&12), Some(&7));
    }

    #[test]
    fn test_sparse_rejects_unconfigured() {
        let seeds: BTreeMap<u16, u16> = [(10, 1), (11, 2), (20, 3)].into_iter().collect();
        let mut bank = SparseBank::new(seeds);

        assert_eq!(bank.read(10, 2).unwrap(), vec![1, 2]);
        assert_eq!(bank.read(10, 3), Err(ModbusException::IllegalDataAddress));
        assert_eq!(bank.read(15, 1), Err(ModbusException::IllegalDataAddress));

        assert_eq!(bank.write(19, &[9, 9]), Err(ModbusException::IllegalDataAddress));
        assert_eq!(bank.read(20, 1).unwrap(), vec![3]);

        bank.write(11, &[42]).unwrap();
        assert_eq!(bank.read(11, 1).unwrap(), vec![42]);
        assert_eq!(bank.len(), 3);
    }

    #[test]
    fn test_sparse_default_fill() {
        let seeds: BTreeMap<u16, bool> = [(5, true)].into_iter().collect();
        let mut bank = SparseBank::new(seeds).with_default_fill(true);

        assert_eq!(bank.read(4, 3).unwrap(), vec![false, true, false]);
        bank.write(6, &[true]).unwrap();
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.layout(), BankLayout::Sparse { default_fill: true });
    }

    #[test]
    fn test_build_bank_layouts() {
        let seeds: BTreeMap<u16, u16> = [(1, 5)].into_iter().collect();
        let dense = build_bank(BankLayout::Dense, seeds.clone());
        assert_eq!(dense.layout(), BankLayout::Dense);
        assert_eq!(dense.read(0, 2).unwrap(), vec![0, 5]);

        let sparse = build_bank(BankLayout::Sparse { default_fill: false }, seeds);
        assert_eq!(sparse.len(), 1);
        assert_eq!(sparse.read(0, 1), Err(ModbusException::IllegalDataAddress));
    }
}
