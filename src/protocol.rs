/// Modbus protocol definitions and data structures
///
/// This module contains the core Modbus protocol definitions: function codes,
/// exception codes, the four register kinds and the typed request/response
/// structures the server works with once a PDU has been decoded.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier
pub type UnitId = u8;

/// Number of addresses in each register bank
pub const ADDRESS_SPACE: usize = 0x1_0000;

/// Modbus function codes served by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8, answering `IllegalFunction` for anything unsupported
    pub fn from_u8(value: u8) -> Result<Self, ModbusException> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusException::IllegalFunction),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Register bank the function operates on
    pub fn register_kind(self) -> RegisterKind {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => RegisterKind::Coils,
            ModbusFunction::ReadDiscreteInputs => RegisterKind::DiscreteInputs,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => RegisterKind::HoldingRegisters,
            ModbusFunction::ReadInputRegisters => RegisterKind::InputRegisters,
        }
    }

    /// Snake-case name used in metric labels
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "read_coils",
            ModbusFunction::ReadDiscreteInputs => "read_discrete_inputs",
            ModbusFunction::ReadHoldingRegisters => "read_holding_registers",
            ModbusFunction::ReadInputRegisters => "read_input_registers",
            ModbusFunction::WriteSingleCoil => "write_single_coil",
            ModbusFunction::WriteSingleRegister => "write_single_register",
            ModbusFunction::WriteMultipleCoils => "write_multiple_coils",
            ModbusFunction::WriteMultipleRegisters => "write_multiple_registers",
        }
    }
}

/// Name of a raw function code, `function_<n>` when it is not supported
pub fn function_name(code: u8) -> Cow<'static, str> {
    match ModbusFunction::from_u8(code) {
        Ok(function) => Cow::Borrowed(function.name()),
        Err(_) => Cow::Owned(format!("function_{}", code)),
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Snake-case name used in metric labels
    pub fn name(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "illegal_function",
            ModbusException::IllegalDataAddress => "illegal_data_address",
            ModbusException::IllegalDataValue => "illegal_data_value",
            ModbusException::ServerDeviceFailure => "slave_device_failure",
            ModbusException::Acknowledge => "acknowledge",
            ModbusException::ServerDeviceBusy => "slave_device_busy",
            ModbusException::MemoryParityError => "memory_parity_error",
            ModbusException::GatewayPathUnavailable => "gateway_path_unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => {
                "gateway_target_device_failed_to_respond"
            }
        }
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

impl std::error::Error for ModbusException {}

/// The four register banks of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    /// Read-only bits
    DiscreteInputs,
    /// Read/write bits
    Coils,
    /// Read/write 16-bit words
    HoldingRegisters,
    /// Read-only 16-bit words
    InputRegisters,
}

impl RegisterKind {
    /// `type` label value used by the register access metrics
    pub fn label(self) -> &'static str {
        match self {
            RegisterKind::DiscreteInputs => "discrete_input",
            RegisterKind::Coils => "coil",
            RegisterKind::HoldingRegisters => "holding",
            RegisterKind::InputRegisters => "input",
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::DiscreteInputs => "discrete inputs",
            RegisterKind::Coils => "coils",
            RegisterKind::HoldingRegisters => "holding registers",
            RegisterKind::InputRegisters => "input registers",
        };
        f.write_str(name)
    }
}

/// A run of values read from or written to one bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValues {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl RegisterValues {
    pub fn len(&self) -> usize {
        match self {
            RegisterValues::Bits(bits) => bits.len(),
            RegisterValues::Words(words) => words.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded Modbus request
///
/// Quantity limits and value encodings have already been checked by the codec;
/// address ranges are checked by the register store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: ModbusAddress, quantity: u16 },
    ReadDiscreteInputs { address: ModbusAddress, quantity: u16 },
    ReadHoldingRegisters { address: ModbusAddress, quantity: u16 },
    ReadInputRegisters { address: ModbusAddress, quantity: u16 },
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: ModbusValue },
    WriteMultipleCoils { address: ModbusAddress, values: Vec<bool> },
    WriteMultipleRegisters { address: ModbusAddress, values: Vec<ModbusValue> },
}

impl ModbusRequest {
    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusRequest::ReadCoils { .. } => ModbusFunction::ReadCoils,
            ModbusRequest::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            ModbusRequest::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            ModbusRequest::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            ModbusRequest::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            ModbusRequest::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            ModbusRequest::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            ModbusRequest::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> ModbusAddress {
        match *self {
            ModbusRequest::ReadCoils { address, .. }
            | ModbusRequest::ReadDiscreteInputs { address, .. }
            | ModbusRequest::ReadHoldingRegisters { address, .. }
            | ModbusRequest::ReadInputRegisters { address, .. }
            | ModbusRequest::WriteSingleCoil { address, .. }
            | ModbusRequest::WriteSingleRegister { address, .. }
            | ModbusRequest::WriteMultipleCoils { address, .. }
            | ModbusRequest::WriteMultipleRegisters { address, .. } => address,
        }
    }

    /// Number of addresses the request touches
    pub fn quantity(&self) -> u16 {
        match self {
            ModbusRequest::ReadCoils { quantity, .. }
            | ModbusRequest::ReadDiscreteInputs { quantity, .. }
            | ModbusRequest::ReadHoldingRegisters { quantity, .. }
            | ModbusRequest::ReadInputRegisters { quantity, .. } => *quantity,
            ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => 1,
            ModbusRequest::WriteMultipleCoils { values, .. } => values.len() as u16,
            ModbusRequest::WriteMultipleRegisters { values, .. } => values.len() as u16,
        }
    }

    pub fn register_kind(&self) -> RegisterKind {
        self.function().register_kind()
    }
}

/// Modbus response produced by executing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<ModbusValue>),
    ReadInputRegisters(Vec<ModbusValue>),
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: ModbusValue },
    WriteMultipleCoils { address: ModbusAddress, quantity: u16 },
    WriteMultipleRegisters { address: ModbusAddress, quantity: u16 },
    /// Exception reply for a raw function code
    Exception { function: u8, exception: ModbusException },
}

/// Data conversion utilities
pub mod data_utils {
    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian), ignoring a trailing odd byte
    pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = bits.len().div_ceil(8);
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values, LSB first
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}
