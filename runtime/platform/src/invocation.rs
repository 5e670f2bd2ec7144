//! Capability invocation encoding
//!
//! An invocation names a capability, the number of significant address bits,
//! an opcode and up to [`MAX_INVOKE_ARGS`] argument words. It is packed into a
//! single [`TrapFrame`] so that the kernel entry is one atomic trap.
//!
//! Header word layout:
//!
//! ```text
//!  bits 0..8    opcode
//!  bits 8..16   valid address bits
//!  bits 16..24  argument count
//! ```

use crate::abi::{CNodeId, CapAddr, KernelError, Opcode, Word, CPTR_BITS, MAX_INVOKE_ARGS};

/// Words in a trap frame: header, cnode, slot, then the arguments
pub const TRAP_FRAME_WORDS: usize = 3 + MAX_INVOKE_ARGS;

/// A decoded capability invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub cap: CapAddr,
    pub valid_bits: u8,
    pub op: Opcode,
    args: [Word; MAX_INVOKE_ARGS],
    nargs: usize,
}

impl Invocation {
    pub fn new(cap: CapAddr, valid_bits: u8, op: Opcode) -> Self {
        Self {
            cap,
            valid_bits,
            op,
            args: [0; MAX_INVOKE_ARGS],
            nargs: 0,
        }
    }

    /// Append an argument word
    ///
    /// # Errors
    /// Returns `InvalidArgument` once nine words have been pushed
    pub fn push(&mut self, word: Word) -> Result<(), KernelError> {
        if self.nargs == MAX_INVOKE_ARGS {
            return Err(KernelError::InvalidArgument);
        }
        self.args[self.nargs] = word;
        self.nargs += 1;
        Ok(())
    }

    /// Build an invocation from an argument slice
    pub fn with_args(
        cap: CapAddr,
        valid_bits: u8,
        op: Opcode,
        args: &[Word],
    ) -> Result<Self, KernelError> {
        let mut inv = Self::new(cap, valid_bits, op);
        for &arg in args {
            inv.push(arg)?;
        }
        Ok(inv)
    }

    pub fn args(&self) -> &[Word] {
        &self.args[..self.nargs]
    }

    /// Argument `idx`, or `InvalidArgument` if the caller supplied fewer words
    pub fn arg(&self, idx: usize) -> Result<Word, KernelError> {
        self.args().get(idx).copied().ok_or(KernelError::InvalidArgument)
    }

    pub fn encode(&self) -> TrapFrame {
        let mut words = [0; TRAP_FRAME_WORDS];
        words[0] = (self.op as Word) | ((self.valid_bits as Word) << 8) | (self.nargs << 16);
        words[1] = self.cap.cnode.0 as Word;
        words[2] = self.cap.slot as Word;
        words[3..3 + self.nargs].copy_from_slice(self.args());
        TrapFrame { words }
    }

    /// Decode a trap frame, rejecting malformed headers
    pub fn decode(frame: &TrapFrame) -> Result<Self, KernelError> {
        let header = frame.words[0];
        let op = Opcode::from_word(header & 0xFF).ok_or(KernelError::IllegalOperation)?;
        let valid_bits = ((header >> 8) & 0xFF) as u8;
        let nargs = (header >> 16) & 0xFF;
        if nargs > MAX_INVOKE_ARGS || valid_bits == 0 || valid_bits > CPTR_BITS {
            return Err(KernelError::InvalidArgument);
        }
        let cap = CapAddr::new(CNodeId(frame.words[1] as u32), frame.words[2] as u32);
        let mut args = [0; MAX_INVOKE_ARGS];
        args[..nargs].copy_from_slice(&frame.words[3..3 + nargs]);
        Ok(Self {
            cap,
            valid_bits,
            op,
            args,
            nargs,
        })
    }
}

/// Register image handed to the kernel on a trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub words: [Word; TRAP_FRAME_WORDS],
}

/// Kernel return: a result word (zero on success) and two value words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRet {
    pub error: Word,
    pub values: [Word; 2],
}

impl SysRet {
    pub fn ok(values: [Word; 2]) -> Self {
        Self { error: 0, values }
    }

    pub fn err(error: KernelError) -> Self {
        Self {
            error: error.as_word(),
            values: [0; 2],
        }
    }

    pub fn into_result(self) -> Result<[Word; 2], KernelError> {
        match self.error {
            0 => Ok(self.values),
            code => Err(KernelError::from_word(code)),
        }
    }
}

impl From<Result<[Word; 2], KernelError>> for SysRet {
    fn from(result: Result<[Word; 2], KernelError>) -> Self {
        match result {
            Ok(values) => Self::ok(values),
            Err(e) => Self::err(e),
        }
    }
}
