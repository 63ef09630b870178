//! In-memory call graph produced by a function that returns pending work
//! instead of a final value.
//!
//! Futures are shared through [`FutureRef`] so one node may be referenced by
//! several parents. Each allocation builds and owns its own graph.

mod durable_id;
mod execution_plan;

use std::sync::Arc;

pub use durable_id::{
    future_durable_id,
    sha256_hash_strings,
    DurableIdAssigner,
    FutureInfo,
    GraphError,
    ResolvedArgument,
};
pub use execution_plan::{ExecutionPlan, ExecutionPlanBuilder};

use crate::serialization::Value;

pub type FutureRef = Arc<Future>;

#[derive(Debug)]
pub enum Future {
    FunctionCall(FunctionCallFuture),
    List(ListFuture),
    Reduce(ReduceOperationFuture),
}

#[derive(Debug, Clone)]
pub enum Argument {
    Value(Value),
    Future(FutureRef),
}

#[derive(Debug)]
pub struct FunctionCallFuture {
    pub id: String,
    pub function_name: String,
    pub args: Vec<Argument>,
    /// Insertion order is kept; hashing sorts by key.
    pub kwargs: Vec<(String, Argument)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// Output of applying `function_name` to every item.
    MapOperation,
    /// The items themselves.
    Collection,
}

impl ListKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ListKind::MapOperation => "MAP_OPERATION",
            ListKind::Collection => "COLLECTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMetadata {
    pub kind: ListKind,
    pub function_name: String,
}

#[derive(Debug, Clone)]
pub enum ListItems {
    Items(Vec<Argument>),
    /// Items produced by another list future.
    List(FutureRef),
}

#[derive(Debug)]
pub struct ListFuture {
    pub id: String,
    pub items: ListItems,
    pub metadata: ListMetadata,
}

#[derive(Debug)]
pub struct ReduceOperationFuture {
    pub id: String,
    pub function_name: String,
    pub initial: Option<Argument>,
    pub items: ListItems,
}

impl Future {
    pub fn function_call(
        function_name: impl Into<String>,
        args: Vec<Argument>,
        kwargs: Vec<(String, Argument)>,
    ) -> FutureRef {
        Arc::new(Future::FunctionCall(FunctionCallFuture {
            id: new_future_id(),
            function_name: function_name.into(),
            args,
            kwargs,
        }))
    }

    /// Applies `function_name` to every item.
    pub fn map(function_name: impl Into<String>, items: impl Into<ListItems>) -> FutureRef {
        Arc::new(Future::List(ListFuture {
            id: new_future_id(),
            items: items.into(),
            metadata: ListMetadata {
                kind: ListKind::MapOperation,
                function_name: function_name.into(),
            },
        }))
    }

    pub fn collection(items: impl Into<ListItems>) -> FutureRef {
        Arc::new(Future::List(ListFuture {
            id: new_future_id(),
            items: items.into(),
            metadata: ListMetadata {
                kind: ListKind::Collection,
                function_name: String::new(),
            },
        }))
    }

    /// Folds `items` with `function_name(accumulator, item)`.
    pub fn reduce(
        function_name: impl Into<String>,
        items: impl Into<ListItems>,
        initial: Option<Argument>,
    ) -> FutureRef {
        Arc::new(Future::Reduce(ReduceOperationFuture {
            id: new_future_id(),
            function_name: function_name.into(),
            initial,
            items: items.into(),
        }))
    }

    pub fn id(&self) -> &str {
        match self {
            Future::FunctionCall(f) => &f.id,
            Future::List(f) => &f.id,
            Future::Reduce(f) => &f.id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Future::FunctionCall(_) => "FunctionCall",
            Future::List(_) => "List",
            Future::Reduce(_) => "ReduceOperation",
        }
    }

    /// Futures this one depends on, in hashing order of their positions.
    pub fn children(&self) -> Vec<&FutureRef> {
        fn from_items<'a>(items: &'a ListItems, out: &mut Vec<&'a FutureRef>) {
            match items {
                ListItems::Items(items) => out.extend(items.iter().filter_map(Argument::as_future)),
                ListItems::List(list) => out.push(list),
            }
        }

        let mut children = Vec::new();
        match self {
            Future::FunctionCall(call) => {
                children.extend(call.args.iter().filter_map(Argument::as_future));
                children.extend(call.kwargs.iter().filter_map(|(_, a)| a.as_future()));
            }
            Future::List(list) => from_items(&list.items, &mut children),
            Future::Reduce(reduce) => {
                children.extend(reduce.initial.iter().filter_map(Argument::as_future));
                from_items(&reduce.items, &mut children);
            }
        }
        children
    }
}

impl Argument {
    pub fn as_future(&self) -> Option<&FutureRef> {
        match self {
            Argument::Future(f) => Some(f),
            Argument::Value(_) => None,
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

impl From<serde_json::Value> for Argument {
    fn from(value: serde_json::Value) -> Self {
        Argument::Value(Value::Data(value))
    }
}

impl From<FutureRef> for Argument {
    fn from(future: FutureRef) -> Self {
        Argument::Future(future)
    }
}

impl From<Vec<Argument>> for ListItems {
    fn from(items: Vec<Argument>) -> Self {
        ListItems::Items(items)
    }
}

impl From<FutureRef> for ListItems {
    fn from(list: FutureRef) -> Self {
        ListItems::List(list)
    }
}

fn new_future_id() -> String {
    nanoid::nanoid!()
}
