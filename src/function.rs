//! User functions and the values flowing in and out of them.
//!
//! Functions are plain Rust closures registered by name in a
//! [`FunctionRegistry`]. A function either returns a final [`Value`] or
//! hands back a future graph to be scheduled in its place.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::{
    future_graph::FutureRef,
    serialization::{SerializationError, Value},
};

// ============================================================================
// Errors and outputs
// ============================================================================

/// Failure of a user function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The request must fail with exactly this message.
    RequestError(String),
    /// Any other failure, carrying its diagnostic text.
    FunctionError(String),
}

impl AllocationError {
    pub fn request(message: impl Into<String>) -> Self {
        AllocationError::RequestError(message.into())
    }

    pub fn function(message: impl Into<String>) -> Self {
        AllocationError::FunctionError(message.into())
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::RequestError(message) => write!(f, "request error: {}", message),
            AllocationError::FunctionError(message) => write!(f, "function error: {}", message),
        }
    }
}

impl std::error::Error for AllocationError {}

impl From<anyhow::Error> for AllocationError {
    fn from(error: anyhow::Error) -> Self {
        AllocationError::FunctionError(format!("{:#}", error))
    }
}

impl From<SerializationError> for AllocationError {
    fn from(error: SerializationError) -> Self {
        AllocationError::FunctionError(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum FunctionOutput {
    Value(Value),
    /// Work to schedule; its result becomes the function's result.
    PendingCall(FutureRef),
}

impl From<Value> for FunctionOutput {
    fn from(value: Value) -> Self {
        FunctionOutput::Value(value)
    }
}

impl From<serde_json::Value> for FunctionOutput {
    fn from(value: serde_json::Value) -> Self {
        FunctionOutput::Value(Value::Data(value))
    }
}

impl From<FutureRef> for FunctionOutput {
    fn from(future: FutureRef) -> Self {
        FunctionOutput::PendingCall(future)
    }
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl FunctionArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Result<&Value, AllocationError> {
        self.args.get(index).ok_or_else(|| {
            AllocationError::function(format!(
                "missing positional argument {} (got {})",
                index,
                self.args.len()
            ))
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument `index` as an integer.
    pub fn i64_arg(&self, index: usize) -> Result<i64, AllocationError> {
        let value = self.arg(index)?;
        value.as_i64().ok_or_else(|| {
            AllocationError::function(format!("argument {} is not an integer: {:?}", index, value))
        })
    }
}

/// How the inputs of a call made by another function map to its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionCallMetadata {
    /// The first `positional_args` inputs are positional, the rest are
    /// keyword arguments named by `kwarg_names` in order.
    FunctionCall {
        positional_args: usize,
        kwarg_names: Vec<String>,
    },
    /// Two inputs: the accumulator and the next item.
    Reduce,
}

impl FunctionCallMetadata {
    pub fn single_arg() -> Self {
        FunctionCallMetadata::FunctionCall {
            positional_args: 1,
            kwarg_names: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(self).map_err(|e| SerializationError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        serde_json::from_slice(bytes)
            .map_err(|e| SerializationError::Malformed(format!("function call metadata: {}", e)))
    }

    pub fn apply(&self, inputs: Vec<Value>) -> Result<FunctionArgs> {
        match self {
            FunctionCallMetadata::FunctionCall {
                positional_args,
                kwarg_names,
            } => {
                if inputs.len() != positional_args + kwarg_names.len() {
                    bail!(
                        "call expects {} positional and {} keyword arguments, got {} inputs",
                        positional_args,
                        kwarg_names.len(),
                        inputs.len()
                    );
                }
                let mut inputs = inputs.into_iter();
                let args = inputs.by_ref().take(*positional_args).collect();
                let kwargs = kwarg_names.iter().cloned().zip(inputs).collect();
                Ok(FunctionArgs { args, kwargs })
            }
            FunctionCallMetadata::Reduce => {
                if inputs.len() != 2 {
                    bail!("reducer call expects 2 inputs, got {}", inputs.len());
                }
                Ok(FunctionArgs::positional(inputs))
            }
        }
    }
}

/// Arguments of an allocation. Calls scheduled by the application API carry
/// no metadata and receive the request payload as their only argument.
pub fn reconstruct_args(metadata: Option<&[u8]>, inputs: Vec<Value>) -> Result<FunctionArgs> {
    match metadata {
        Some(bytes) => FunctionCallMetadata::decode(bytes)?.apply(inputs),
        None => {
            let payload = inputs
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("application function call has no arguments"))?;
            Ok(FunctionArgs::positional(vec![payload]))
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Captured output stream of a function.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::other("output buffer lock poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type ProgressFn = Arc<dyn Fn(f64, f64) + Send + Sync>;

/// Per-call handle passed to a user function.
#[derive(Clone)]
pub struct FunctionContext {
    request_id: String,
    allocation_id: String,
    function_call_id: String,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    progress: ProgressFn,
}

impl FunctionContext {
    pub fn new(request_id: &str, allocation_id: &str, function_call_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            allocation_id: allocation_id.to_string(),
            function_call_id: function_call_id.to_string(),
            stdout: OutputBuffer::default(),
            stderr: OutputBuffer::default(),
            progress: Arc::new(|_, _| {}),
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(f64, f64) + Send + Sync + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn allocation_id(&self) -> &str {
        &self.allocation_id
    }

    pub fn function_call_id(&self) -> &str {
        &self.function_call_id
    }

    pub fn update_progress(&self, current: f64, total: f64) {
        (self.progress)(current, total);
    }

    pub fn stdout(&self) -> OutputBuffer {
        self.stdout.clone()
    }

    pub fn stderr(&self) -> OutputBuffer {
        self.stderr.clone()
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("request_id", &self.request_id)
            .field("allocation_id", &self.allocation_id)
            .field("function_call_id", &self.function_call_id)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type FunctionHandler =
    Arc<dyn Fn(&FunctionContext, FunctionArgs) -> Result<FunctionOutput, AllocationError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionHandler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, function: F) -> &mut Self
    where
        F: Fn(&FunctionContext, FunctionArgs) -> Result<FunctionOutput, AllocationError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<FunctionHandler> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data(v: serde_json::Value) -> Value {
        Value::Data(v)
    }

    #[test]
    fn test_metadata_splits_positional_and_keyword_inputs() {
        let metadata = FunctionCallMetadata::FunctionCall {
            positional_args: 1,
            kwarg_names: vec!["b".to_string(), "a".to_string()],
        };
        let args = metadata
            .apply(vec![data(json!(1)), data(json!(2)), data(json!(3))])
            .unwrap();
        assert_eq!(args.args, vec![data(json!(1))]);
        assert_eq!(args.kwarg("b"), Some(&data(json!(2))));
        assert_eq!(args.kwarg("a"), Some(&data(json!(3))));
    }

    #[test]
    fn test_metadata_rejects_input_count_mismatch() {
        assert!(FunctionCallMetadata::single_arg().apply(vec![]).is_err());
        assert!(FunctionCallMetadata::Reduce
            .apply(vec![data(json!(1))])
            .is_err());
    }

    #[test]
    fn test_metadata_wire_format() {
        let encoded = FunctionCallMetadata::Reduce.encode().unwrap();
        assert_eq!(encoded, br#"{"kind":"reduce"}"#.to_vec());

        let decoded = FunctionCallMetadata::decode(
            br#"{"kind":"function_call","positional_args":2,"kwarg_names":[]}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            FunctionCallMetadata::FunctionCall {
                positional_args: 2,
                kwarg_names: vec![],
            }
        );
        assert!(FunctionCallMetadata::decode(b"not json").is_err());
    }

    #[test]
    fn test_application_call_takes_first_input_as_payload() {
        let args = reconstruct_args(None, vec![data(json!({"a": 3}))]).unwrap();
        assert_eq!(args.args, vec![data(json!({"a": 3}))]);
        assert!(reconstruct_args(None, vec![]).is_err());
    }

    #[test]
    fn test_context_reports_progress_and_captures_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = FunctionContext::new("req", "alloc", "call")
            .with_progress(move |current, total| sink.lock().unwrap().push((current, total)));

        ctx.update_progress(1.0, 4.0);
        writeln!(ctx.stdout(), "hello").unwrap();
        write!(ctx.stderr(), "oops").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1.0, 4.0)]);
        assert_eq!(ctx.stdout().contents(), "hello\n");
        assert_eq!(ctx.stderr().contents(), "oops");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = FunctionRegistry::new();
        registry
            .register("double", |_, args| Ok(json!(args.i64_arg(0)? * 2).into()))
            .register("fail", |_, _| Err(AllocationError::request("bad input")));

        assert_eq!(registry.names(), vec!["double", "fail"]);
        let ctx = FunctionContext::new("r", "a", "c");
        let double = registry.get("double").unwrap();
        let out = double(&ctx, FunctionArgs::positional(vec![data(json!(21))])).unwrap();
        assert!(matches!(out, FunctionOutput::Value(Value::Data(v)) if v == json!(42)));
        assert!(registry.get("missing").is_none());
    }
}
