//! Register datastore shared by all sessions.
//!
//! A [`UnitContext`] owns the register banks of one device behind a single
//! mutex, so a multi-register write is never observed half applied.

use mbtcp_common::config::{RegisterLayout, ServerConfig};
use mbtcp_common::error::{ModbusError, ModbusResult};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Register type selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Discrete inputs (read-only bits).
    DiscreteInputs,
    /// Coils (read/write bits).
    Coils,
    /// Input registers (read-only 16-bit).
    InputRegisters,
    /// Holding registers (read/write 16-bit).
    HoldingRegisters,
}

impl RegisterKind {
    /// All selectors, in view order.
    pub const ALL: [Self; 4] = [
        Self::DiscreteInputs,
        Self::Coils,
        Self::InputRegisters,
        Self::HoldingRegisters,
    ];

    fn index(self) -> usize {
        match self {
            Self::DiscreteInputs => 0,
            Self::Coils => 1,
            Self::InputRegisters => 2,
            Self::HoldingRegisters => 3,
        }
    }
}

/// Fixed-length array of 16-bit registers, zero-initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBank {
    values: Vec<u16>,
}

impl RegisterBank {
    /// Create a bank of `len` zeroed registers.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0; len],
        }
    }

    /// Number of registers.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bank has no registers.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn range(&self, address: usize, count: usize) -> ModbusResult<Range<usize>> {
        match address.checked_add(count) {
            Some(end) if end <= self.values.len() => Ok(address..end),
            _ => Err(ModbusError::IllegalDataAddress {
                address,
                count,
                len: self.values.len(),
            }),
        }
    }

    /// Copy `count` registers starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::IllegalDataAddress`] if the range leaves the bank.
    pub fn get(&self, address: usize, count: usize) -> ModbusResult<Vec<u16>> {
        let range = self.range(address, count)?;
        Ok(self.values[range].to_vec())
    }

    /// Overwrite registers starting at `address`.
    ///
    /// Nothing is written unless the whole range fits.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::IllegalDataAddress`] if the range leaves the bank.
    pub fn set(&mut self, address: usize, values: &[u16]) -> ModbusResult<()> {
        let range = self.range(address, values.len())?;
        self.values[range].copy_from_slice(values);
        Ok(())
    }
}

/// Real banks plus the view table mapping each register type onto one.
#[derive(Debug)]
struct Banks {
    storage: Vec<RegisterBank>,
    views: [usize; 4],
}

impl Banks {
    fn view(&self, kind: RegisterKind) -> &RegisterBank {
        &self.storage[self.views[kind.index()]]
    }

    fn view_mut(&mut self, kind: RegisterKind) -> &mut RegisterBank {
        &mut self.storage[self.views[kind.index()]]
    }
}

/// Register memory of one Modbus device.
///
/// With [`RegisterLayout::Independent`] every register type has its own
/// bank. With [`RegisterLayout::Aliased`] a single bank backs all four
/// selectors, so a holding register write is visible as an input register.
#[derive(Debug)]
pub struct UnitContext {
    layout: RegisterLayout,
    bank_size: usize,
    banks: Mutex<Banks>,
}

impl UnitContext {
    /// Create a context with zeroed banks of `bank_size` registers.
    pub fn new(bank_size: usize, layout: RegisterLayout) -> Self {
        let banks = match layout {
            RegisterLayout::Independent => Banks {
                storage: RegisterKind::ALL
                    .iter()
                    .map(|_| RegisterBank::new(bank_size))
                    .collect(),
                views: [0, 1, 2, 3],
            },
            RegisterLayout::Aliased => Banks {
                storage: vec![RegisterBank::new(bank_size)],
                views: [0; 4],
            },
        };

        Self {
            layout,
            bank_size,
            banks: Mutex::new(banks),
        }
    }

    /// Create a context sized and laid out per the server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.bank_size, config.layout)
    }

    /// Storage layout.
    pub fn layout(&self) -> RegisterLayout {
        self.layout
    }

    /// Registers per bank.
    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    fn lock(&self) -> ModbusResult<MutexGuard<'_, Banks>> {
        self.banks
            .lock()
            .map_err(|_| ModbusError::DeviceFailure("register store lock poisoned".into()))
    }

    /// Read `count` registers of type `kind` starting at `address`.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::IllegalDataAddress`] if the range leaves the bank.
    /// - [`ModbusError::DeviceFailure`] if the store lock is poisoned.
    pub fn get(&self, kind: RegisterKind, address: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let banks = self.lock()?;
        let values = banks
            .view(kind)
            .get(usize::from(address), usize::from(count))?;
        trace!(?kind, address, count, "Registers read");
        Ok(values)
    }

    /// Write registers of type `kind` starting at `address`, all or none.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::IllegalDataAddress`] if the range leaves the bank.
    /// - [`ModbusError::DeviceFailure`] if the store lock is poisoned.
    pub fn set(&self, kind: RegisterKind, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut banks = self.lock()?;
        banks.view_mut(kind).set(usize::from(address), values)?;
        trace!(?kind, address, count = values.len(), "Registers written");
        Ok(())
    }
}

impl Default for UnitContext {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}
