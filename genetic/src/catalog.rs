//! Descriptors of the syscalls that can be evolved.

use crate::{population::CHROMOSOME_SLOTS, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What an argument of a syscall means, which decides how values for it are generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    /// Any integer.
    Int,
    /// A file descriptor.
    Fd,
    /// A buffer or structure length.
    Len,
    /// A bit set of flags.
    Flags,
    /// Permission bits.
    Mode,
    /// A user-space address.
    Addr,
    /// A signal number.
    Signal,
    /// A process id.
    Pid,
}

fn enabled() -> bool {
    true
}

/// A syscall that can be evolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallDescriptor {
    pub name: String,
    pub number: u64,
    pub args: Vec<ArgKind>,
    #[serde(default)]
    pub needs_root: bool,
    #[serde(default)]
    pub needs_alarm: bool,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl SyscallDescriptor {
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

/// An ordered, validated set of syscall descriptors.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    syscalls: Vec<SyscallDescriptor>,
    by_number: HashMap<u64, usize>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate numbers and syscalls with more arguments than a
    /// chromosome can hold.
    pub fn new(syscalls: Vec<SyscallDescriptor>) -> Result<Self, Error> {
        let mut by_number = HashMap::with_capacity(syscalls.len());
        for (index, syscall) in syscalls.iter().enumerate() {
            if syscall.arity() > CHROMOSOME_SLOTS {
                return Err(Error::InvalidCatalog(format!(
                    "{} takes {} arguments",
                    syscall.name,
                    syscall.arity()
                )));
            }
            if by_number.insert(syscall.number, index).is_some() {
                return Err(Error::InvalidCatalog(format!(
                    "duplicate syscall number {}",
                    syscall.number
                )));
            }
        }
        Ok(Self {
            syscalls,
            by_number,
        })
    }

    /// Syscalls that take part in evolution, in catalog order.
    pub fn enabled(&self) -> impl Iterator<Item = &SyscallDescriptor> {
        self.syscalls.iter().filter(|syscall| syscall.enabled)
    }

    /// Look up a syscall by number.
    pub fn get(&self, number: u64) -> Option<&SyscallDescriptor> {
        self.by_number.get(&number).map(|&index| &self.syscalls[index])
    }

    pub fn len(&self) -> usize {
        self.syscalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syscalls.is_empty()
    }
}
