//! Conversion of an identified future graph into execution plan updates.

use anyhow::{Context, Result};
use proto_api::function_executor_pb::{
    execution_plan_update::Op,
    function_arg::Source,
    ExecutionPlanUpdate,
    ExecutionPlanUpdates,
    FunctionArg,
    FunctionCall,
    FunctionRef,
    ListOperation,
    ListOperationKind,
    ReduceOp,
};

use super::{
    Argument,
    DurableIdAssigner,
    Future,
    FutureRef,
    ListItems,
    ListKind,
    ResolvedArgument,
};
use crate::{
    function::FunctionCallMetadata,
    serialization::{SerializedObjectWriter, Value},
};

/// What the allocation produces for a returned future.
#[derive(Debug)]
pub enum ExecutionPlan {
    /// The graph collapsed into a literal, e.g. a reduce over one value.
    Value(Value),
    /// Calls to schedule. Every literal they reference is in `outputs`,
    /// which must be uploaded as one blob.
    Updates {
        updates: ExecutionPlanUpdates,
        outputs: SerializedObjectWriter,
    },
}

pub struct ExecutionPlanBuilder {
    function_ref: FunctionRef,
    assigner: DurableIdAssigner,
    outputs: SerializedObjectWriter,
}

impl ExecutionPlanBuilder {
    /// `function_ref` supplies namespace, application and version of every
    /// scheduled call. Durable ids chain from `function_call_id`.
    pub fn new(function_ref: FunctionRef, function_call_id: &str) -> Self {
        Self {
            function_ref,
            assigner: DurableIdAssigner::new(function_call_id, function_call_id),
            outputs: SerializedObjectWriter::new(),
        }
    }

    pub fn build(mut self, root: &FutureRef) -> Result<ExecutionPlan> {
        self.assigner.assign(root)?;

        let root_function_call_id = match self.assigner.resolve(&Argument::Future(root.clone()))? {
            ResolvedArgument::Value(value) => return Ok(ExecutionPlan::Value(value)),
            ResolvedArgument::FunctionCall(id) => id,
        };

        let mut updates = Vec::new();
        for future_id in self.assigner.order().to_vec() {
            let info = self
                .assigner
                .infos()
                .get(&future_id)
                .with_context(|| format!("future {} was not identified", future_id))?;
            if info.reduce_output.is_some() {
                continue;
            }
            let future = info.future.clone();
            let durable_id = info.durable_id.clone();
            updates.push(self.update_for(&future, durable_id)?);
        }

        Ok(ExecutionPlan::Updates {
            updates: ExecutionPlanUpdates {
                updates,
                root_function_call_id: Some(root_function_call_id),
            },
            outputs: self.outputs,
        })
    }

    fn update_for(&mut self, future: &Future, durable_id: String) -> Result<ExecutionPlanUpdate> {
        let op = match future {
            Future::FunctionCall(call) => {
                let mut args = Vec::with_capacity(call.args.len() + call.kwargs.len());
                for arg in call.args.iter() {
                    args.push(self.function_arg(arg)?);
                }
                for (_, arg) in call.kwargs.iter() {
                    args.push(self.function_arg(arg)?);
                }
                let metadata = FunctionCallMetadata::FunctionCall {
                    positional_args: call.args.len(),
                    kwarg_names: call.kwargs.iter().map(|(k, _)| k.clone()).collect(),
                };
                Op::FunctionCall(FunctionCall {
                    id: Some(durable_id),
                    target: Some(self.target(&call.function_name)),
                    args,
                    call_metadata: Some(metadata.encode()?),
                })
            }
            Future::List(list) => {
                let items = self.list_items(&list.items)?;
                let (kind, function, call_metadata) = match list.metadata.kind {
                    ListKind::MapOperation => (
                        ListOperationKind::MapOperation,
                        Some(self.target(&list.metadata.function_name)),
                        Some(FunctionCallMetadata::single_arg().encode()?),
                    ),
                    ListKind::Collection => (ListOperationKind::Collection, None, None),
                };
                Op::List(ListOperation {
                    id: Some(durable_id),
                    kind: Some(kind as i32),
                    function,
                    items,
                    call_metadata,
                })
            }
            Future::Reduce(reduce) => {
                let mut collection = Vec::new();
                if let Some(initial) = reduce.initial.as_ref() {
                    collection.push(self.function_arg(initial)?);
                }
                collection.extend(self.list_items(&reduce.items)?);
                Op::Reduce(ReduceOp {
                    id: Some(durable_id),
                    reducer: Some(self.target(&reduce.function_name)),
                    collection,
                    call_metadata: Some(FunctionCallMetadata::Reduce.encode()?),
                })
            }
        };
        Ok(ExecutionPlanUpdate { op: Some(op) })
    }

    fn target(&self, function_name: &str) -> FunctionRef {
        FunctionRef {
            function_name: Some(function_name.to_string()),
            ..self.function_ref.clone()
        }
    }

    fn list_items(&mut self, items: &ListItems) -> Result<Vec<FunctionArg>> {
        match items {
            ListItems::Items(items) => items.iter().map(|item| self.function_arg(item)).collect(),
            ListItems::List(list) => Ok(vec![self.function_arg(&Argument::Future(list.clone()))?]),
        }
    }

    fn function_arg(&mut self, arg: &Argument) -> Result<FunctionArg> {
        let source = match self.assigner.resolve(arg)? {
            ResolvedArgument::Value(value) => Source::Value(
                self.outputs
                    .add(&value)
                    .context("serializing function call argument")?,
            ),
            ResolvedArgument::FunctionCall(id) => Source::FunctionCallId(id),
        };
        Ok(FunctionArg {
            source: Some(source),
        })
    }
}
