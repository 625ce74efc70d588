//! Dynamic constraint queue.
//!
//! Constraints discovered while a state runs are grouped into batches and
//! applied to that state's chain builder one batch at a time, right before
//! each exploit generation attempt.

use std::collections::VecDeque;

use crate::expr::ExprRef;
use crate::host::ExecutionHost;
use crate::rop_chain::RopChainBuilder;
use crate::types::X64Reg;

#[derive(Debug, Clone)]
pub enum Constraint {
    Register { reg: X64Reg, expr: ExprRef },
    Memory { addr: ExprRef, expr: ExprRef },
}

/// Per-state queue of constraint batches.
#[derive(Debug, Clone, Default)]
pub struct DynamicRopState {
    queue: VecDeque<Vec<Constraint>>,
}

impl DynamicRopState {
    pub fn pending_batches(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing was queued.
    Idle,
    Applied,
    /// The batch constrained `rip`; the host must drop translated code
    /// for this state.
    ControlFlowChanged,
    /// A constraint couldn't be applied and the state was terminated.
    Terminated,
}

/// Collects constraints into the batch being assembled.
#[derive(Debug, Default)]
pub struct DynamicRop {
    pending: Vec<Constraint>,
}

impl DynamicRop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> &mut Self {
        self.pending.push(constraint);
        self
    }

    /// Close the current batch and queue it on `state`.
    pub fn schedule_constraints(&mut self, state: &mut DynamicRopState) {
        state.queue.push_back(std::mem::take(&mut self.pending));
    }

    /// Apply the front batch of `state` to `builder`.
    ///
    /// Batches are all-or-nothing: on the first failure the builder is
    /// rolled back and the host terminates the state. A constraint whose
    /// only gadget path overwrites a register set earlier in the same
    /// batch counts as a failure.
    pub fn apply_next_constraint(
        &self,
        state: &mut DynamicRopState,
        builder: &mut RopChainBuilder,
        host: &mut dyn ExecutionHost,
    ) -> ApplyOutcome {
        let Some(batch) = state.queue.pop_front() else {
            log::warn!("state {}: constraint queue empty", host.state_id());
            return ApplyOutcome::Idle;
        };

        log::info!("state {}: applying {} constraints", host.state_id(), batch.len());
        let checkpoint = builder.checkpoint();
        builder.begin_batch();
        let mut control_flow_changed = false;

        for constraint in &batch {
            let ok = match constraint {
                Constraint::Register { reg, expr } => {
                    control_flow_changed |= *reg == X64Reg::Rip;
                    builder.add_register_constraint(*reg, expr.clone())
                }
                Constraint::Memory { addr, expr } => {
                    builder.add_memory_constraint(addr.clone(), expr.clone())
                }
            };
            if !ok {
                log::warn!("state {}: can't apply {:?}", host.state_id(), constraint);
                builder.rollback(checkpoint);
                host.terminate_state("Dynamic ROP failed");
                return ApplyOutcome::Terminated;
            }
        }

        if control_flow_changed {
            ApplyOutcome::ControlFlowChanged
        } else {
            ApplyOutcome::Applied
        }
    }

    /// Host hook fired before each exploit generation attempt.
    pub fn before_exploit_generation(
        &self,
        state: &mut DynamicRopState,
        builder: &mut RopChainBuilder,
        host: &mut dyn ExecutionHost,
    ) -> ApplyOutcome {
        self.apply_next_constraint(state, builder, host)
    }
}
