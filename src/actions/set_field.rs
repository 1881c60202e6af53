use tracing::debug;

use super::{ActionContext, FieldAssignment, Signal, apply_assignments};
use crate::error::ActionError;
use crate::fields::BlockWrite;
use crate::record::Record;

/// Writes evaluated expressions into the record's own fields, then snapshots once.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Default)]
pub struct SetField {
    #[n(0)]
    pub fields: Vec<FieldAssignment>,
    #[n(1)]
    pub block_mode: BlockWrite,
}

impl SetField {
    pub fn new(fields: Vec<FieldAssignment>) -> Self {
        Self {
            fields,
            block_mode: BlockWrite::Replace,
        }
    }

    pub fn set_block_mode(mut self, mode: BlockWrite) -> Self {
        self.block_mode = mode;
        self
    }

    pub(super) fn perform(
        &self,
        action_id: &str,
        record: &mut Record,
        ctx: &mut ActionContext<'_>,
    ) -> Result<Signal, ActionError> {
        let scope = ctx.scope(record);
        let mut data = record.data.clone();
        apply_assignments(
            ctx,
            &scope,
            &record.id,
            action_id,
            ctx.schema,
            "workflow",
            &mut data,
            &self.fields,
            self.block_mode,
        )?;

        let old = std::mem::replace(&mut record.data, data);
        let changed = record.snapshot(&old, ctx.schema, ctx.actor, Some(action_id), ctx.now());
        debug!(record_id = %record.id, action_id, changed, "fields set");
        Ok(Signal::Continue)
    }
}
