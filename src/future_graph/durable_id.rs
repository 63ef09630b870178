//! Durable ids of futures.
//!
//! A durable id is a SHA-256 over an ordered list of string components: the
//! enclosing function call id, the durable id of the future resolved just
//! before this one, the future's kind and function name, then the durable
//! ids of the futures it depends on. Literal arguments and items contribute
//! nothing. Each component is hashed as its UTF-8 bytes followed by a single
//! NUL byte. Changing any of this changes every id a replay produces.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use sha2::{Digest, Sha256};

use super::{Argument, Future, FutureRef, ListItems};
use crate::serialization::Value;

const COMPONENT_SEPARATOR: &[u8] = b"\0";

pub fn sha256_hash_strings<S: AsRef<str>>(components: &[S]) -> String {
    let mut hasher = Sha256::new();
    for component in components {
        hasher.update(component.as_ref().as_bytes());
        hasher.update(COMPONENT_SEPARATOR);
    }
    hex::encode(hasher.finalize())
}

/// Resolution-time annotation of a future.
#[derive(Debug, Clone)]
pub struct FutureInfo {
    pub future: FutureRef,
    pub durable_id: String,
    /// Set for a reduce over a single input: the reduce is that input and
    /// never gets scheduled.
    pub reduce_output: Option<Argument>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A child was not identified before its parent.
    MissingFutureInfo { parent_id: String, child_id: String },
    /// The future is reachable from itself.
    Cycle { future_id: String },
    /// Items of a list or reduce point at a future that is not a list.
    InvalidListItems { parent_id: String, child_id: String },
    /// Reduce without initial value over no items.
    EmptyReduce { future_id: String },
}

impl GraphError {
    /// Mistakes in the function's own output rather than in the runtime.
    pub fn is_user_error(&self) -> bool {
        matches!(self, GraphError::EmptyReduce { .. })
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::MissingFutureInfo {
                parent_id,
                child_id,
            } => write!(
                f,
                "future {} references future {} which has no durable id yet",
                parent_id, child_id
            ),
            GraphError::Cycle { future_id } => {
                write!(f, "future {} is part of a cycle", future_id)
            }
            GraphError::InvalidListItems {
                parent_id,
                child_id,
            } => write!(
                f,
                "future {} uses future {} as its items but it is not a list",
                parent_id, child_id
            ),
            GraphError::EmptyReduce { future_id } => write!(
                f,
                "reduce of empty iterable with no initial value (future {})",
                future_id
            ),
        }
    }
}

impl std::error::Error for GraphError {}

fn child_durable_id(
    parent: &Future,
    child: &Future,
    future_infos: &HashMap<String, FutureInfo>,
) -> Result<String, GraphError> {
    future_infos
        .get(child.id())
        .map(|info| info.durable_id.clone())
        .ok_or_else(|| GraphError::MissingFutureInfo {
            parent_id: parent.id().to_string(),
            child_id: child.id().to_string(),
        })
}

fn push_item_ids(
    parent: &Future,
    items: &ListItems,
    future_infos: &HashMap<String, FutureInfo>,
    components: &mut Vec<String>,
) -> Result<(), GraphError> {
    match items {
        ListItems::Items(items) => {
            for item in items.iter().filter_map(Argument::as_future) {
                components.push(child_durable_id(parent, item, future_infos)?);
            }
        }
        ListItems::List(list) => {
            if !matches!(list.as_ref(), Future::List(_)) {
                return Err(GraphError::InvalidListItems {
                    parent_id: parent.id().to_string(),
                    child_id: list.id().to_string(),
                });
            }
            components.push(child_durable_id(parent, list, future_infos)?);
        }
    }
    Ok(())
}

/// Computes the durable id of `future`. Every future it references must
/// already have an entry in `future_infos`.
pub fn future_durable_id(
    future: &Future,
    parent_function_call_id: &str,
    previous_future_durable_id: &str,
    future_infos: &HashMap<String, FutureInfo>,
) -> Result<String, GraphError> {
    let mut components = vec![
        parent_function_call_id.to_string(),
        previous_future_durable_id.to_string(),
    ];

    match future {
        Future::FunctionCall(call) => {
            components.push("FunctionCall".to_string());
            components.push(call.function_name.clone());
            for arg in call.args.iter().filter_map(Argument::as_future) {
                components.push(child_durable_id(future, arg, future_infos)?);
            }
            // Byte-wise key order; a stable sort keeps duplicate keys in
            // insertion order.
            let mut kwargs: Vec<_> = call.kwargs.iter().collect();
            kwargs.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
            for (_, arg) in kwargs {
                if let Some(child) = arg.as_future() {
                    components.push(child_durable_id(future, child, future_infos)?);
                }
            }
        }
        Future::List(list) => {
            components.push(format!(
                "{}:{}",
                list.metadata.kind.tag(),
                list.metadata.function_name
            ));
            push_item_ids(future, &list.items, future_infos, &mut components)?;
        }
        Future::Reduce(reduce) => {
            components.push("ReduceOperation".to_string());
            components.push(reduce.function_name.clone());
            if let Some(initial) = reduce.initial.as_ref().and_then(Argument::as_future) {
                components.push(child_durable_id(future, initial, future_infos)?);
            }
            push_item_ids(future, &reduce.items, future_infos, &mut components)?;
        }
    }

    Ok(sha256_hash_strings(&components))
}

/// What an argument stands for once reduce shortcuts are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedArgument {
    Value(Value),
    FunctionCall(String),
}

/// Assigns durable ids to a whole graph, children before parents.
///
/// Each future is identified once, keyed by its id, no matter how many
/// parents reference it. The previous durable id advances after every
/// future so the ids depend on the resolution order.
pub struct DurableIdAssigner {
    parent_function_call_id: String,
    previous_durable_id: String,
    infos: HashMap<String, FutureInfo>,
    order: Vec<String>,
    visiting: HashSet<String>,
}

impl DurableIdAssigner {
    pub fn new(parent_function_call_id: &str, previous_durable_id: &str) -> Self {
        Self {
            parent_function_call_id: parent_function_call_id.to_string(),
            previous_durable_id: previous_durable_id.to_string(),
            infos: HashMap::new(),
            order: Vec::new(),
            visiting: HashSet::new(),
        }
    }

    /// Identifies `root` and everything it depends on. Returns the root's
    /// durable id.
    pub fn assign(&mut self, root: &FutureRef) -> Result<String, GraphError> {
        self.visit(root)?;
        self.durable_id(root)
    }

    fn visit(&mut self, future: &FutureRef) -> Result<(), GraphError> {
        let id = future.id();
        if self.infos.contains_key(id) {
            return Ok(());
        }
        if !self.visiting.insert(id.to_string()) {
            return Err(GraphError::Cycle {
                future_id: id.to_string(),
            });
        }

        for child in future.children() {
            self.visit(child)?;
        }

        let durable_id = future_durable_id(
            future,
            &self.parent_function_call_id,
            &self.previous_durable_id,
            &self.infos,
        )?;
        let reduce_output = match future.as_ref() {
            Future::Reduce(reduce) => single_reduce_input(future, reduce)?,
            _ => None,
        };

        self.visiting.remove(id);
        self.previous_durable_id = durable_id.clone();
        self.infos.insert(
            id.to_string(),
            FutureInfo {
                future: future.clone(),
                durable_id,
                reduce_output,
            },
        );
        self.order.push(id.to_string());
        Ok(())
    }

    pub fn durable_id(&self, future: &Future) -> Result<String, GraphError> {
        self.info(future).map(|info| info.durable_id.clone())
    }

    pub fn info(&self, future: &Future) -> Result<&FutureInfo, GraphError> {
        self.infos
            .get(future.id())
            .ok_or_else(|| GraphError::MissingFutureInfo {
                parent_id: self.parent_function_call_id.clone(),
                child_id: future.id().to_string(),
            })
    }

    /// Follows reduce shortcuts until a literal or a schedulable call.
    pub fn resolve(&self, argument: &Argument) -> Result<ResolvedArgument, GraphError> {
        let mut current = argument.clone();
        loop {
            match current {
                Argument::Value(value) => return Ok(ResolvedArgument::Value(value)),
                Argument::Future(future) => {
                    let info = self.info(&future)?;
                    match &info.reduce_output {
                        Some(output) => current = output.clone(),
                        None => return Ok(ResolvedArgument::FunctionCall(info.durable_id.clone())),
                    }
                }
            }
        }
    }

    /// Future ids in the order they were identified.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn infos(&self) -> &HashMap<String, FutureInfo> {
        &self.infos
    }

    pub fn previous_durable_id(&self) -> &str {
        &self.previous_durable_id
    }
}

fn single_reduce_input(
    future: &FutureRef,
    reduce: &super::ReduceOperationFuture,
) -> Result<Option<Argument>, GraphError> {
    let ListItems::Items(items) = &reduce.items else {
        return Ok(None);
    };
    let mut inputs = reduce.initial.iter().chain(items.iter());
    match (inputs.next(), inputs.next()) {
        (None, _) => Err(GraphError::EmptyReduce {
            future_id: future.id().to_string(),
        }),
        (Some(only), None) => Ok(Some(only.clone())),
        _ => Ok(None),
    }
}
