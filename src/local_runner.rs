//! In-process evaluation of function calls and the futures they return.
//!
//! Used for local development and tests: no blobs, no control plane. A
//! function returning a future is resolved by a trampoline that keeps
//! evaluating pending calls until a value comes out.

use std::{cell::RefCell, collections::HashMap};

use tracing::debug;

use crate::{
    function::{AllocationError, FunctionArgs, FunctionContext, FunctionOutput, FunctionRegistry},
    future_graph::{Argument, Future, FutureRef, ListItems, ListKind},
    serialization::Value,
};

pub struct LocalRunner {
    registry: FunctionRegistry,
    request_id: String,
    /// Results of already evaluated futures, by future id.
    results: RefCell<HashMap<String, Value>>,
}

impl LocalRunner {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self {
            registry,
            request_id: nanoid::nanoid!(),
            results: RefCell::new(HashMap::new()),
        }
    }

    pub fn run(&self, function_name: &str, args: FunctionArgs) -> Result<Value, AllocationError> {
        let output = self.call(function_name, args)?;
        self.resolve(output)
    }

    fn call(&self, function_name: &str, args: FunctionArgs) -> Result<FunctionOutput, AllocationError> {
        let function = self.registry.get(function_name).ok_or_else(|| {
            AllocationError::function(format!("function {} is not registered", function_name))
        })?;
        let call_id = nanoid::nanoid!();
        debug!(function_name, call_id = %call_id, "running function locally");
        let ctx = FunctionContext::new(&self.request_id, &call_id, &call_id);
        function(&ctx, args)
    }

    fn resolve(&self, mut output: FunctionOutput) -> Result<Value, AllocationError> {
        loop {
            match output {
                FunctionOutput::Value(value) => return Ok(value),
                FunctionOutput::PendingCall(future) => {
                    if let Some(value) = self.results.borrow().get(future.id()) {
                        return Ok(value.clone());
                    }
                    output = self.evaluate(&future)?;
                }
            }
        }
    }

    fn evaluate(&self, future: &FutureRef) -> Result<FunctionOutput, AllocationError> {
        match future.as_ref() {
            Future::FunctionCall(call) => {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in call.args.iter() {
                    args.push(self.argument(arg)?);
                }
                let mut kwargs = std::collections::BTreeMap::new();
                for (name, arg) in call.kwargs.iter() {
                    kwargs.insert(name.clone(), self.argument(arg)?);
                }
                self.call(&call.function_name, FunctionArgs { args, kwargs })
            }
            Future::List(_) => {
                let items = self.list_values(future)?;
                let value = collect_values(items)?;
                self.remember(future, &value);
                Ok(FunctionOutput::Value(value))
            }
            Future::Reduce(reduce) => {
                let mut inputs = Vec::new();
                if let Some(initial) = reduce.initial.as_ref() {
                    inputs.push(self.argument(initial)?);
                }
                inputs.extend(self.items(&reduce.items)?);

                let mut inputs = inputs.into_iter();
                let mut accumulator = inputs.next().ok_or_else(|| {
                    AllocationError::function("reduce of empty iterable with no initial value")
                })?;
                for item in inputs {
                    let output = self.call(
                        &reduce.function_name,
                        FunctionArgs::positional(vec![accumulator, item]),
                    )?;
                    accumulator = self.resolve(output)?;
                }
                self.remember(future, &accumulator);
                Ok(FunctionOutput::Value(accumulator))
            }
        }
    }

    fn argument(&self, argument: &Argument) -> Result<Value, AllocationError> {
        match argument {
            Argument::Value(value) => Ok(value.clone()),
            Argument::Future(future) => {
                let value = self.resolve(FunctionOutput::PendingCall(future.clone()))?;
                self.remember(future, &value);
                Ok(value)
            }
        }
    }

    fn items(&self, items: &ListItems) -> Result<Vec<Value>, AllocationError> {
        match items {
            ListItems::Items(items) => items.iter().map(|item| self.argument(item)).collect(),
            ListItems::List(list) => self.list_values(list),
        }
    }

    /// Elements of a list future, without collecting them into one value.
    fn list_values(&self, future: &FutureRef) -> Result<Vec<Value>, AllocationError> {
        let Future::List(list) = future.as_ref() else {
            return match self.argument(&Argument::Future(future.clone()))? {
                Value::Data(serde_json::Value::Array(items)) => {
                    Ok(items.into_iter().map(Value::Data).collect())
                }
                other => Err(AllocationError::function(format!(
                    "expected a list, got {:?}",
                    other
                ))),
            };
        };

        let items = self.items(&list.items)?;
        match list.metadata.kind {
            ListKind::Collection => Ok(items),
            ListKind::MapOperation => items
                .into_iter()
                .map(|item| {
                    let output =
                        self.call(&list.metadata.function_name, FunctionArgs::positional(vec![item]))?;
                    self.resolve(output)
                })
                .collect(),
        }
    }

    fn remember(&self, future: &FutureRef, value: &Value) {
        self.results
            .borrow_mut()
            .insert(future.id().to_string(), value.clone());
    }
}

fn collect_values(values: Vec<Value>) -> Result<Value, AllocationError> {
    let items = values
        .into_iter()
        .map(|value| match value {
            Value::Data(v) => Ok(v),
            Value::Text(s) => Ok(serde_json::Value::String(s)),
            Value::File(_) => Err(AllocationError::function(
                "files can't be collected into a list",
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Data(serde_json::Value::Array(items)))
}
