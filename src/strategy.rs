//! Ordered composition of techniques into one payload.

use crate::error::{Error, Result};
use crate::exploit::Exploit;
use crate::rop_chain::RopSubchain;
use crate::technique::{self, Technique};

/// Everything a generated exploit script needs.
#[derive(Debug, Clone, Default)]
pub struct ExploitPayload {
    pub subchains: Vec<RopSubchain>,
    pub extra: Vec<u64>,
    pub auxiliary: String,
}

#[derive(Default)]
pub struct Strategy {
    techniques: Vec<Box<dyn Technique>>,
}

impl Strategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, resolve and check each named technique, in order.
    pub fn from_names<S: AsRef<str>>(ctx: &mut Exploit, names: &[S]) -> Result<Self> {
        let mut strategy = Strategy::new();
        for name in names {
            let created = technique::create(ctx, name.as_ref())?;
            strategy.push(ctx, created)?;
        }
        Ok(strategy)
    }

    /// The techniques listed in the exploit's configuration.
    pub fn from_config(ctx: &mut Exploit) -> Result<Self> {
        let names = ctx.config().techniques.clone();
        Self::from_names(ctx, &names)
    }

    /// Resolve `technique` against `ctx` and append it. Fails if its
    /// requirements aren't met afterwards.
    pub fn push(&mut self, ctx: &mut Exploit, mut technique: Box<dyn Technique>) -> Result<()> {
        technique.resolve_required_gadgets(ctx);
        if !technique.check_requirements(ctx) {
            return Err(Error::Infeasible {
                technique: technique.name().to_string(),
                reason: "requirements not satisfied".into(),
            });
        }
        log::info!("strategy: using {}", technique.name());
        self.techniques.push(technique);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.techniques.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }

    pub fn payload(&self, ctx: &Exploit) -> Result<ExploitPayload> {
        let mut payload = ExploitPayload::default();
        for technique in &self.techniques {
            payload.subchains.extend(technique.symbolic_rop_payload_list(ctx)?);
            payload.extra.extend(technique.extra_payload(ctx));
            payload.auxiliary.push_str(&technique.auxiliary_functions(ctx));
        }
        Ok(payload)
    }
}
