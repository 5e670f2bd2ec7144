//! Owned capability handles

use tern_platform::{CapAddr, Invocation, Kernel, ObjType, Opcode, Word, CPTR_BITS};

use crate::{CapError, Result};

/// A capability held in one of this domain's slots
///
/// Not `Clone`: duplicating authority takes an explicit [`crate::CSpace::copy`],
/// which yields a second handle in a fresh slot. Deleting a capability
/// consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct Capability {
    addr: CapAddr,
    kind: ObjType,
    valid_bits: u8,
}

impl Capability {
    /// Take ownership of the capability stored at `addr`
    ///
    /// The caller asserts that `addr` holds a capability of type `kind` and
    /// that no other handle names it.
    pub fn from_raw(addr: CapAddr, kind: ObjType) -> Self {
        Self { addr, kind, valid_bits: CPTR_BITS }
    }

    pub fn addr(&self) -> CapAddr {
        self.addr
    }

    pub fn kind(&self) -> ObjType {
        self.kind
    }

    pub fn valid_bits(&self) -> u8 {
        self.valid_bits
    }

    /// Give up the handle without touching the slot
    pub fn into_raw(self) -> CapAddr {
        self.addr
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.addr.is_null() {
            return Err(CapError::InvalidArgument("null capability"));
        }
        if self.valid_bits == 0 || self.valid_bits > CPTR_BITS {
            return Err(CapError::InvalidArgument("valid bits out of range"));
        }
        Ok(())
    }

    pub(crate) fn expect(&self, expected: ObjType) -> Result<()> {
        if self.kind != expected {
            return Err(CapError::TypeMismatch { expected, found: self.kind });
        }
        Ok(())
    }

    /// Issue one invocation on this capability
    pub(crate) fn invoke<K: Kernel + ?Sized>(
        &self,
        kernel: &K,
        op: Opcode,
        args: &[Word],
    ) -> Result<[Word; 2]> {
        self.validate()?;
        let inv = Invocation::with_args(self.addr, self.valid_bits, op, args)?;
        Ok(kernel.invoke(&inv)?)
    }
}

/// An empty slot reserved from a [`crate::CSpace`]
#[derive(Debug, PartialEq, Eq)]
pub struct Slot {
    addr: CapAddr,
}

impl Slot {
    pub(crate) fn new(addr: CapAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> CapAddr {
        self.addr
    }

    /// The slot has been filled by the kernel (e.g. by a message receive)
    pub fn into_capability(self, kind: ObjType) -> Capability {
        Capability::from_raw(self.addr, kind)
    }
}
