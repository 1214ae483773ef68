//! Device context: the four register banks of the simulated device.
//!
//! Clients address registers with the numbers they send on the wire. In zero mode
//! those are storage indices; otherwise address `n` lives at index `n - 1` and
//! address 0 does not exist. The same mapping applies to seeds and snapshots, so
//! a snapshot always speaks the client's numbering.
//!
//! Every bank sits behind its own `RwLock`. A request touches exactly one bank and
//! holds that lock for the whole range, so concurrent readers never observe a
//! partially applied multi-register write.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusAddress, ModbusException, RegisterKind, RegisterValues, ADDRESS_SPACE};
use crate::register_bank::{build_bank, BankLayout, RegisterBank, RegisterValue};

type Bank<T> = RwLock<Box<dyn RegisterBank<T>>>;

/// Persistable view of all four banks, keyed by client-visible address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    #[serde(default)]
    pub discrete_inputs: BTreeMap<u16, bool>,
    #[serde(default)]
    pub coils: BTreeMap<u16, bool>,
    #[serde(default)]
    pub holding_registers: BTreeMap<u16, u16>,
    #[serde(default)]
    pub input_registers: BTreeMap<u16, u16>,
}

impl RegisterSnapshot {
    /// Total number of entries across all banks
    pub fn len(&self) -> usize {
        self.discrete_inputs.len()
            + self.coils.len()
            + self.holding_registers.len()
            + self.input_registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Seed for one bank: its layout and initial values by client-visible address
#[derive(Debug, Clone, PartialEq)]
pub struct BankSeed<T> {
    pub layout: BankLayout,
    pub values: BTreeMap<u16, T>,
}

impl<T> BankSeed<T> {
    pub fn new(layout: BankLayout, values: BTreeMap<u16, T>) -> Self {
        Self { layout, values }
    }

    /// Overlay `entries`, replacing seeded values at the same address
    pub fn overlay(&mut self, entries: &BTreeMap<u16, T>)
    where
        T: Copy,
    {
        self.values.extend(entries.iter().map(|(k, v)| (*k, *v)));
    }
}

impl<T> Default for BankSeed<T> {
    fn default() -> Self {
        Self::new(BankLayout::Dense, BTreeMap::new())
    }
}

/// Register store statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterStoreStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}

/// The device context shared by every connection
#[derive(Debug)]
pub struct RegisterStore {
    zero_mode: bool,
    discrete_inputs: Bank<bool>,
    coils: Bank<bool>,
    holding_registers: Bank<u16>,
    input_registers: Bank<u16>,
}

impl RegisterStore {
    /// Create a store with four dense, zero-filled banks
    pub fn new(zero_mode: bool) -> Self {
        Self::builder(zero_mode).build()
    }

    pub fn builder(zero_mode: bool) -> RegisterStoreBuilder {
        RegisterStoreBuilder {
            zero_mode,
            discrete_inputs: BankSeed::default(),
            coils: BankSeed::default(),
            holding_registers: BankSeed::default(),
            input_registers: BankSeed::default(),
        }
    }

    pub fn zero_mode(&self) -> bool {
        self.zero_mode
    }

    /// Translate a client-visible address range to the first storage index
    fn locate(&self, address: ModbusAddress, count: usize) -> Result<u16, ModbusException> {
        if count == 0 || address as usize + count > ADDRESS_SPACE {
            return Err(ModbusException::IllegalDataAddress);
        }
        if self.zero_mode {
            Ok(address)
        } else {
            address
                .checked_sub(1)
                .ok_or(ModbusException::IllegalDataAddress)
        }
    }

    /// Storage index back to client-visible address; `None` if unreachable
    fn external(&self, index: u16) -> Option<u16> {
        if self.zero_mode {
            Some(index)
        } else {
            index.checked_add(1)
        }
    }

    fn read_bank<T: RegisterValue>(
        &self,
        bank: &Bank<T>,
        address: ModbusAddress,
        count: u16,
    ) -> Result<Vec<T>, ModbusException> {
        let index = self.locate(address, count as usize)?;
        let guard = bank.read().map_err(|_| ModbusException::ServerDeviceFailure)?;
        guard.read(index, count)
    }

    fn write_bank<T: RegisterValue>(
        &self,
        bank: &Bank<T>,
        address: ModbusAddress,
        values: &[T],
    ) -> Result<(), ModbusException> {
        let index = self.locate(address, values.len())?;
        let mut guard = bank.write().map_err(|_| ModbusException::ServerDeviceFailure)?;
        guard.write(index, values)
    }

    fn snapshot_bank<T: RegisterValue>(
        &self,
        kind: RegisterKind,
        bank: &Bank<T>,
    ) -> ModbusResult<BTreeMap<u16, T>> {
        let guard = bank.read().map_err(|_| {
            ModbusError::internal(format!("{} register bank lock poisoned", kind.label()))
        })?;
        Ok(guard
            .snapshot()
            .into_iter()
            .filter_map(|(index, value)| self.external(index).map(|address| (address, value)))
            .collect())
    }

    fn bank_len<T: RegisterValue>(bank: &Bank<T>) -> usize {
        bank.read().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Read `count` values of `kind` starting at the client-visible `address`
    pub fn read(
        &self,
        kind: RegisterKind,
        address: ModbusAddress,
        count: u16,
    ) -> Result<RegisterValues, ModbusException> {
        Ok(match kind {
            RegisterKind::DiscreteInputs => {
                RegisterValues::Bits(self.read_bank(&self.discrete_inputs, address, count)?)
            }
            RegisterKind::Coils => RegisterValues::Bits(self.read_bank(&self.coils, address, count)?),
            RegisterKind::HoldingRegisters => {
                RegisterValues::Words(self.read_bank(&self.holding_registers, address, count)?)
            }
            RegisterKind::InputRegisters => {
                RegisterValues::Words(self.read_bank(&self.input_registers, address, count)?)
            }
        })
    }

    /// Write `values` to `kind` starting at the client-visible `address`
    ///
    /// Any bank can be written through this call, including the ones clients
    /// can only read; the protocol layer never routes client writes there.
    pub fn write(
        &self,
        kind: RegisterKind,
        address: ModbusAddress,
        values: &RegisterValues,
    ) -> Result<(), ModbusException> {
        match (kind, values) {
            (RegisterKind::DiscreteInputs, RegisterValues::Bits(bits)) => {
                self.write_bank(&self.discrete_inputs, address, bits)
            }
            (RegisterKind::Coils, RegisterValues::Bits(bits)) => self.write_bank(&self.coils, address, bits),
            (RegisterKind::HoldingRegisters, RegisterValues::Words(words)) => {
                self.write_bank(&self.holding_registers, address, words)
            }
            (RegisterKind::InputRegisters, RegisterValues::Words(words)) => {
                self.write_bank(&self.input_registers, address, words)
            }
            _ => Err(ModbusException::IllegalDataValue),
        }
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: ModbusAddress, quantity: u16) -> Result<Vec<bool>, ModbusException> {
        self.read_bank(&self.coils, address, quantity)
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: ModbusAddress, quantity: u16) -> Result<Vec<bool>, ModbusException> {
        self.read_bank(&self.discrete_inputs, address, quantity)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: ModbusAddress, quantity: u16) -> Result<Vec<u16>, ModbusException> {
        self.read_bank(&self.holding_registers, address, quantity)
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: ModbusAddress, quantity: u16) -> Result<Vec<u16>, ModbusException> {
        self.read_bank(&self.input_registers, address, quantity)
    }

    /// Write coils (function codes 0x05 and 0x0F)
    pub fn write_coils(&self, address: ModbusAddress, values: &[bool]) -> Result<(), ModbusException> {
        self.write_bank(&self.coils, address, values)
    }

    /// Write holding registers (function codes 0x06 and 0x10)
    pub fn write_holding_registers(&self, address: ModbusAddress, values: &[u16]) -> Result<(), ModbusException> {
        self.write_bank(&self.holding_registers, address, values)
    }

    /// Set input register values (for simulation/testing)
    pub fn set_input_registers(&self, address: ModbusAddress, values: &[u16]) -> Result<(), ModbusException> {
        self.write_bank(&self.input_registers, address, values)
    }

    /// Capture every bank's persistable entries
    pub fn snapshot(&self) -> ModbusResult<RegisterSnapshot> {
        Ok(RegisterSnapshot {
            discrete_inputs: self.snapshot_bank(RegisterKind::DiscreteInputs, &self.discrete_inputs)?,
            coils: self.snapshot_bank(RegisterKind::Coils, &self.coils)?,
            holding_registers: self
                .snapshot_bank(RegisterKind::HoldingRegisters, &self.holding_registers)?,
            input_registers: self.snapshot_bank(RegisterKind::InputRegisters, &self.input_registers)?,
        })
    }

    /// Layout of the bank for `kind`
    pub fn layout(&self, kind: RegisterKind) -> Option<BankLayout> {
        match kind {
            RegisterKind::DiscreteInputs => self.discrete_inputs.read().ok().map(|b| b.layout()),
            RegisterKind::Coils => self.coils.read().ok().map(|b| b.layout()),
            RegisterKind::HoldingRegisters => self.holding_registers.read().ok().map(|b| b.layout()),
            RegisterKind::InputRegisters => self.input_registers.read().ok().map(|b| b.layout()),
        }
    }

    /// Get register store statistics
    pub fn get_stats(&self) -> RegisterStoreStats {
        RegisterStoreStats {
            coils_count: Self::bank_len(&self.coils),
            discrete_inputs_count: Self::bank_len(&self.discrete_inputs),
            holding_registers_count: Self::bank_len(&self.holding_registers),
            input_registers_count: Self::bank_len(&self.input_registers),
        }
    }
}

/// Builder collecting one seed per bank
#[derive(Debug, Clone)]
pub struct RegisterStoreBuilder {
    zero_mode: bool,
    discrete_inputs: BankSeed<bool>,
    coils: BankSeed<bool>,
    holding_registers: BankSeed<u16>,
    input_registers: BankSeed<u16>,
}

impl RegisterStoreBuilder {
    pub fn discrete_inputs(mut self, seed: BankSeed<bool>) -> Self {
        self.discrete_inputs = seed;
        self
    }

    pub fn coils(mut self, seed: BankSeed<bool>) -> Self {
        self.coils = seed;
        self
    }

    pub fn holding_registers(mut self, seed: BankSeed<u16>) -> Self {
        self.holding_registers = seed;
        self
    }

    pub fn input_registers(mut self, seed: BankSeed<u16>) -> Self {
        self.input_registers = seed;
        self
    }

    /// Overlay snapshot entries on the seeds; layouts are kept
    pub fn overlay_snapshot(mut self, snapshot: &RegisterSnapshot) -> Self {
        self.discrete_inputs.overlay(&snapshot.discrete_inputs);
        self.coils.overlay(&snapshot.coils);
        self.holding_registers.overlay(&snapshot.holding_registers);
        self.input_registers.overlay(&snapshot.input_registers);
        self
    }

    fn bank<T: RegisterValue>(zero_mode: bool, kind: RegisterKind, seed: BankSeed<T>) -> Bank<T> {
        let mut indexed = BTreeMap::new();
        for (address, value) in seed.values {
            if zero_mode {
                indexed.insert(address, value);
            } else if let Some(index) = address.checked_sub(1) {
                indexed.insert(index, value);
            } else {
                warn!("Ignoring {} seed at address 0: addresses start at 1 outside zero mode", kind);
            }
        }
        RwLock::new(build_bank(seed.layout, indexed))
    }

    pub fn build(self) -> RegisterStore {
        let zero_mode = self.zero_mode;
        RegisterStore {
            zero_mode,
            discrete_inputs: Self::bank(zero_mode, RegisterKind::DiscreteInputs, self.discrete_inputs),
            coils: Self::bank(zero_mode, RegisterKind::Coils, self.coils),
            holding_registers: Self::bank(zero_mode, RegisterKind::HoldingRegisters, self.holding_registers),
            input_registers: Self::bank(zero_mode, RegisterKind::InputRegisters, self.input_registers),
        }
    }
}
