//! Load the syscall catalog from YAML.

use evofuzz_genetic::catalog::{Catalog, SyscallDescriptor};
use std::{fs::File, path::Path};
use thiserror::Error;

/// Catalog used when none is given on the command line.
const BUILTIN: &str = include_str!("../catalog.yaml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to open catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("rejected catalog: {0}")]
    Rejected(#[from] evofuzz_genetic::Error),
}

/// The built-in Linux x86_64 catalog.
pub fn builtin() -> Result<Catalog, Error> {
    let syscalls: Vec<SyscallDescriptor> = serde_yaml::from_str(BUILTIN)?;
    Ok(Catalog::new(syscalls)?)
}

/// Read a catalog from the YAML file at `path`.
pub fn load(path: &Path) -> Result<Catalog, Error> {
    let file = File::open(path)?;
    let syscalls: Vec<SyscallDescriptor> = serde_yaml::from_reader(file)?;
    Ok(Catalog::new(syscalls)?)
}
