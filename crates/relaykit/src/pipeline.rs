//! Staged pipeline - ordered sync/async stages over a running value.
//!
//! A [`PipelineBuilder<TIn, K>`] threads the current value type `K` through
//! its methods, so stage *i*'s output always matches stage *i + 1*'s input.
//! [`PipelineBuilder::build`] freezes the stage list into an immutable,
//! reusable [`Pipeline<TIn, TOut>`].
//!
//! Stages come in four kinds:
//! - sync effect (`pipe`) and sync transform (`transform`, `try_transform`)
//! - async effect (`pipe_async`) and async transform (`transform_async`)
//!
//! Both drivers accept every kind. [`Pipeline::run`] blocks on async stages
//! and therefore refuses to do so from inside a tokio runtime.

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type Value = Box<dyn Any + Send>;

type EffectFn = dyn Fn(&mut Value) -> std::result::Result<(), Fault> + Send + Sync;
type TransformFn = dyn Fn(Value) -> std::result::Result<Value, Fault> + Send + Sync;
type AsyncEffectFn =
    dyn Fn(&Value) -> std::result::Result<BoxFuture<'static, ()>, Fault> + Send + Sync;
type AsyncTransformFn =
    dyn Fn(Value) -> std::result::Result<BoxFuture<'static, Value>, Fault> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    SyncEffect,
    SyncTransform,
    AsyncEffect,
    AsyncTransform,
}

impl StageKind {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::AsyncEffect | Self::AsyncTransform)
    }
}

/// Stage failure before the stage index is known.
enum Fault {
    Type(&'static str),
    Failed(String),
}

impl Fault {
    fn at(self, index: usize) -> Error {
        match self {
            Fault::Type(expected) => Error::StageType { index, expected },
            Fault::Failed(message) => Error::Stage { index, message },
        }
    }
}

#[derive(Clone)]
enum Stage {
    SyncEffect(Arc<EffectFn>),
    SyncTransform(Arc<TransformFn>),
    AsyncEffect(Arc<AsyncEffectFn>),
    AsyncTransform(Arc<AsyncTransformFn>),
}

impl Stage {
    fn kind(&self) -> StageKind {
        match self {
            Stage::SyncEffect(_) => StageKind::SyncEffect,
            Stage::SyncTransform(_) => StageKind::SyncTransform,
            Stage::AsyncEffect(_) => StageKind::AsyncEffect,
            Stage::AsyncTransform(_) => StageKind::AsyncTransform,
        }
    }
}

/// Typed builder. Every method consumes the builder and returns a new one;
/// clone it to reuse a prefix.
pub struct PipelineBuilder<TIn, K> {
    stages: Vec<Stage>,
    _types: PhantomData<fn(TIn) -> K>,
}

impl<TIn, K> Clone for PipelineBuilder<TIn, K> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            _types: PhantomData,
        }
    }
}

impl<T> PipelineBuilder<T, T>
where
    T: Send + 'static,
{
    /// Empty builder; `build` on it yields the identity pipeline.
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            _types: PhantomData,
        }
    }

    /// Builder seeded with one synchronous side-effect stage.
    pub fn create<F>(initial: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::new().pipe(initial)
    }
}

impl<T> Default for PipelineBuilder<T, T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<TIn, K> PipelineBuilder<TIn, K>
where
    TIn: Send + 'static,
    K: Send + 'static,
{
    fn push<U>(mut self, stage: Stage) -> PipelineBuilder<TIn, U> {
        self.stages.push(stage);
        PipelineBuilder {
            stages: self.stages,
            _types: PhantomData,
        }
    }

    /// Observe or mutate the current value in place.
    pub fn pipe<F>(self, f: F) -> Self
    where
        F: Fn(&mut K) + Send + Sync + 'static,
    {
        self.push(Stage::SyncEffect(Arc::new(
            move |value: &mut Value| -> std::result::Result<(), Fault> {
                let value = value
                    .downcast_mut::<K>()
                    .ok_or(Fault::Type(type_name::<K>()))?;
                f(value);
                Ok(())
            },
        )))
    }

    /// Run an async side effect on a clone of the current value.
    pub fn pipe_async<F, Fut>(self, f: F) -> Self
    where
        K: Clone,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push(Stage::AsyncEffect(Arc::new(
            move |value: &Value| -> std::result::Result<BoxFuture<'static, ()>, Fault> {
                let value = value
                    .downcast_ref::<K>()
                    .ok_or(Fault::Type(type_name::<K>()))?
                    .clone();
                Ok(f(value).boxed())
            },
        )))
    }

    /// Replace the current value with `f(value)`.
    pub fn transform<U, F>(self, f: F) -> PipelineBuilder<TIn, U>
    where
        U: Send + 'static,
        F: Fn(K) -> U + Send + Sync + 'static,
    {
        self.try_transform(move |value| Ok::<_, std::convert::Infallible>(f(value)))
    }

    /// Like [`transform`](Self::transform); an `Err` stops the run with
    /// [`Error::Stage`].
    pub fn try_transform<U, E, F>(self, f: F) -> PipelineBuilder<TIn, U>
    where
        U: Send + 'static,
        E: fmt::Display,
        F: Fn(K) -> std::result::Result<U, E> + Send + Sync + 'static,
    {
        self.push(Stage::SyncTransform(Arc::new(
            move |value: Value| -> std::result::Result<Value, Fault> {
                let value = value
                    .downcast::<K>()
                    .map_err(|_| Fault::Type(type_name::<K>()))?;
                let next = f(*value).map_err(|e| Fault::Failed(e.to_string()))?;
                Ok(Box::new(next))
            },
        )))
    }

    /// Replace the current value with the output of an async function.
    pub fn transform_async<U, F, Fut>(self, f: F) -> PipelineBuilder<TIn, U>
    where
        U: Send + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        self.push(Stage::AsyncTransform(Arc::new(
            move |value: Value| -> std::result::Result<BoxFuture<'static, Value>, Fault> {
                let value = value
                    .downcast::<K>()
                    .map_err(|_| Fault::Type(type_name::<K>()))?;
                let next = f(*value);
                Ok(async move { Box::new(next.await) as Value }.boxed())
            },
        )))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Freeze the stage list.
    pub fn build(self) -> Pipeline<TIn, K> {
        Pipeline {
            stages: self.stages.into(),
            _types: PhantomData,
        }
    }

    /// Freeze the stage list, rejecting async stages up front.
    pub fn build_sync(self) -> Result<Pipeline<TIn, K>> {
        if let Some(index) = self.stages.iter().position(|s| s.kind().is_async()) {
            return Err(Error::misuse(format!(
                "stage {index} is async; a synchronous pipeline cannot contain it"
            )));
        }
        Ok(self.build())
    }
}

/// Immutable, reusable stage sequence.
pub struct Pipeline<TIn, TOut> {
    stages: Arc<[Stage]>,
    _types: PhantomData<fn(TIn) -> TOut>,
}

impl<TIn, TOut> Clone for Pipeline<TIn, TOut> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
            _types: PhantomData,
        }
    }
}

impl<TIn, TOut> fmt::Debug for Pipeline<TIn, TOut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("input", &type_name::<TIn>())
            .field("output", &type_name::<TOut>())
            .field("stages", &self.stage_kinds())
            .finish()
    }
}

impl<TIn, TOut> Pipeline<TIn, TOut> {
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// True if no stage is async.
    pub fn is_sync(&self) -> bool {
        !self.stages.iter().any(|s| s.kind().is_async())
    }
}

impl<TIn, TOut> Pipeline<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Send + 'static,
{
    /// Run every stage on the calling thread.
    ///
    /// Async stages are driven to completion with a minimal executor, so
    /// they must not rely on the tokio reactor (timers, sockets). Calling
    /// this from inside a tokio runtime on a pipeline with async stages is
    /// rejected with [`Error::Misuse`]; use [`run_async`](Self::run_async).
    pub fn run(&self, input: TIn) -> Result<TOut> {
        if !self.is_sync() && tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::misuse(
                "blocking run of a pipeline with async stages inside a tokio runtime; use run_async",
            ));
        }

        let mut value: Value = Box::new(input);
        for (index, stage) in self.stages.iter().enumerate() {
            tracing::trace!(stage = index, kind = ?stage.kind(), "Running stage");
            value = match stage {
                Stage::SyncEffect(f) => {
                    f(&mut value).map_err(|e| e.at(index))?;
                    value
                }
                Stage::SyncTransform(f) => f(value).map_err(|e| e.at(index))?,
                Stage::AsyncEffect(f) => {
                    let effect = f(&value).map_err(|e| e.at(index))?;
                    futures::executor::block_on(effect);
                    value
                }
                Stage::AsyncTransform(f) => {
                    futures::executor::block_on(f(value).map_err(|e| e.at(index))?)
                }
            };
        }
        self.finish(value)
    }

    /// Run every stage, awaiting async ones.
    ///
    /// `cancel` is checked before each stage; a fired token fails the run
    /// with [`Error::Cancelled`] without starting the next stage.
    pub async fn run_async(&self, input: TIn, cancel: &CancellationToken) -> Result<TOut> {
        let mut value: Value = Box::new(input);
        for (index, stage) in self.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::debug!(stage = index, "Pipeline cancelled");
                return Err(Error::Cancelled);
            }
            tracing::trace!(stage = index, kind = ?stage.kind(), "Running stage");
            value = match stage {
                Stage::SyncEffect(f) => {
                    f(&mut value).map_err(|e| e.at(index))?;
                    value
                }
                Stage::SyncTransform(f) => f(value).map_err(|e| e.at(index))?,
                Stage::AsyncEffect(f) => {
                    f(&value).map_err(|e| e.at(index))?.await;
                    value
                }
                Stage::AsyncTransform(f) => f(value).map_err(|e| e.at(index))?.await,
            };
        }
        self.finish(value)
    }

    fn finish(&self, value: Value) -> Result<TOut> {
        value
            .downcast::<TOut>()
            .map(|out| *out)
            .map_err(|_| Error::StageType {
                index: self.stages.len(),
                expected: type_name::<TOut>(),
            })
    }
}
