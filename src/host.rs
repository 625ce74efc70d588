//! The execution platform driving synthesis.
//!
//! The symbolic execution host owns the states; this crate only reads
//! from them and asks for a state to be abandoned.

use crate::error::Result;
use crate::types::{StateId, X64Reg};

pub trait ExecutionHost {
    /// The state the current callback runs in.
    fn state_id(&self) -> StateId;

    /// Fill `buf` with guest memory starting at `addr`.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Concrete value of a register in the current state.
    fn read_register(&self, reg: X64Reg) -> Result<u64>;

    /// Abandon the current state. Other states keep running.
    fn terminate_state(&mut self, reason: &str);
}
