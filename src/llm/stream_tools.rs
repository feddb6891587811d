use std::collections::BTreeMap;

use tracing::debug;
use uuid::Uuid;

use crate::llm::stream::ToolCallDelta;
use crate::llm::types::ToolCall;

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Reconstructs tool calls from streamed deltas.
///
/// Deltas sharing an index belong to one call. Argument fragments are
/// concatenated in arrival order; the first non-empty id and name seen for an
/// index win. A call whose name never arrived is still produced (with an empty
/// name) so dispatch can report it instead of silently dropping it.
#[derive(Debug, Default)]
pub struct ToolDeltaBuffer {
    calls: BTreeMap<usize, PartialToolCall>,
}

impl ToolDeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name_delta: Option<&str>,
        args_delta: Option<&str>,
    ) {
        let slot = self.calls.entry(index).or_default();
        if let Some(idv) = id
            && !idv.is_empty()
            && slot.id.is_none()
        {
            slot.id = Some(idv.to_string());
        }
        if let Some(n) = name_delta
            && !n.is_empty()
            && slot.name.is_none()
        {
            slot.name = Some(n.to_string());
        }
        if let Some(a) = args_delta {
            slot.arguments.push_str(a);
        }
    }

    /// Deltas without an index are treated as index 0, which is what
    /// single-call providers send.
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let (name, args) = match &delta.function {
            Some(f) => (f.name.as_deref(), f.arguments.as_deref()),
            None => (None, None),
        };
        self.push_delta(delta.index.unwrap_or(0), delta.id.as_deref(), name, args);
    }

    /// Consumes the buffer, yielding calls ordered by index.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|(index, partial)| {
                let id = partial.id.unwrap_or_else(|| {
                    let generated = format!("call_{}", Uuid::new_v4().simple());
                    debug!(index, id = %generated, "tool call arrived without id");
                    generated
                });
                ToolCall::function(id, partial.name.unwrap_or_default(), partial.arguments)
            })
            .collect()
    }
}
