//! Routes received messages to the handlers registered for their type.
//!
//! The [`DispatchRegistry`] maps type tags to [`ReceivePipeline`]s. A pipeline is created on first
//! [`register`](DispatchRegistry::register) and shared by every later registration of the same type. Routing
//! matches the envelope's tag exactly; a received envelope with no pipeline goes to the default handlers, and
//! with no default handlers it is undeliverable.
//!
//! Pipelines never run on the task that read the bytes: [`trigger`](DispatchRegistry::trigger) decodes the payload
//! and spawns the run on its own Tokio task.

mod pipeline;

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, warn, Instrument};

pub use pipeline::{
    handler_fn, HandlerRef, Predicate, ReceiveHandler, ReceivePipeline, ReceivePipelineCondition,
    ReceivePipelineHandlerPolicy,
};

use crate::{
    context::ConnectionContext,
    error::{BoxError, DispatchError},
    message::{Envelope, Message},
    session::Session,
};

/// Handler invoked for envelopes no pipeline is registered for.
pub type DefaultHandler =
    Arc<dyn Fn(&ConnectionContext, &Session, &Envelope) -> Result<(), BoxError> + Send + Sync>;

trait ErasedPipeline: Send + Sync + 'static {
    fn is_sealed(&self) -> bool;

    fn is_empty(&self) -> bool;

    fn schedule(
        self: Arc<Self>,
        context: ConnectionContext,
        session: Session,
        envelope: Envelope,
    ) -> Result<JoinHandle<()>, DispatchError>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<M: Message> ErasedPipeline for ReceivePipeline<M> {
    fn is_sealed(&self) -> bool {
        ReceivePipeline::is_sealed(self)
    }

    fn is_empty(&self) -> bool {
        ReceivePipeline::is_empty(self)
    }

    fn schedule(
        self: Arc<Self>,
        context: ConnectionContext,
        session: Session,
        envelope: Envelope,
    ) -> Result<JoinHandle<()>, DispatchError> {
        let message = envelope
            .open::<M>()
            .map_err(|source| DispatchError::Decode {
                tag: envelope.tag,
                source,
            })?;

        let span = debug_span!("pipeline", tag = M::TAG);
        Ok(tokio::spawn(
            async move { self.run(&context, &session, &message).await }.instrument(span),
        ))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The outcome of a successful [`trigger`](DispatchRegistry::trigger).
#[derive(Debug)]
pub enum Delivery {
    /// A pipeline run was spawned.
    Scheduled(JoinHandle<()>),
    /// No pipeline was registered; the default handlers ran.
    Fallback {
        /// Number of default handlers invoked.
        handlers: usize,
    },
}

impl Delivery {
    /// Waits for the pipeline run to complete.
    pub async fn finished(self) {
        if let Delivery::Scheduled(handle) = self {
            if let Err(err) = handle.await {
                error!(error = %err, "pipeline task failed");
            }
        }
    }
}

/// The table of receive pipelines by type tag.
pub struct DispatchRegistry {
    pipelines: Mutex<HashMap<&'static str, Arc<dyn ErasedPipeline>>>,
    default_handlers: Mutex<Vec<DefaultHandler>>,
}

impl DispatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        DispatchRegistry {
            pipelines: Mutex::new(HashMap::new()),
            default_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the pipeline for `M`, creating it if needed.
    ///
    /// Every call for the same type returns the same pipeline. If the tag is already registered for another type,
    /// a [`DispatchError::TagConflict`] error is returned.
    pub fn register<M: Message>(&self) -> Result<Arc<ReceivePipeline<M>>, DispatchError> {
        let mut pipelines = self.pipelines();
        if let Some(existing) = pipelines.get(M::TAG) {
            return existing
                .clone()
                .as_any()
                .downcast::<ReceivePipeline<M>>()
                .map_err(|_| DispatchError::TagConflict { tag: M::TAG });
        }

        let pipeline = Arc::new(ReceivePipeline::<M>::new());
        pipelines.insert(M::TAG, pipeline.clone());
        debug!(tag = M::TAG, "registered receive pipeline");
        Ok(pipeline)
    }

    /// Returns the pipeline registered for `M`.
    pub fn get<M: Message>(&self) -> Option<Arc<ReceivePipeline<M>>> {
        let pipeline = self.pipelines().get(M::TAG).cloned()?;
        pipeline.as_any().downcast().ok()
    }

    /// Returns `true` if a pipeline is registered for `M`.
    pub fn is_registered<M: Message>(&self) -> bool {
        self.is_tag_registered(M::TAG)
    }

    /// Returns `true` if a pipeline is registered for `tag`.
    pub fn is_tag_registered(&self, tag: &str) -> bool {
        self.pipelines().contains_key(tag)
    }

    /// Removes the pipeline for `M`.
    pub fn unregister<M: Message>(&self) -> bool {
        self.unregister_tag(M::TAG)
    }

    /// Removes the pipeline for `tag`, warning if there is none.
    pub fn unregister_tag(&self, tag: &str) -> bool {
        if self.pipelines().remove(tag).is_some() {
            debug!(tag, "unregistered receive pipeline");
            true
        } else {
            warn!(tag, "tried to unregister a type that is not registered");
            false
        }
    }

    /// Adds a handler for envelopes no pipeline is registered for.
    pub fn add_default_handler(
        &self,
        handler: impl Fn(&ConnectionContext, &Session, &Envelope) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    ) {
        self.default_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Routes a received envelope.
    ///
    /// If a pipeline is registered for the envelope's tag, the payload is decoded and the pipeline runs on a new
    /// task. Otherwise every default handler is invoked in registration order on the calling task, with failures
    /// logged and isolated from one another.
    pub fn trigger(
        &self,
        context: &ConnectionContext,
        session: &Session,
        envelope: Envelope,
    ) -> Result<Delivery, DispatchError> {
        let pipeline = self.pipelines().get(envelope.tag()).cloned();
        if let Some(pipeline) = pipeline {
            return pipeline
                .schedule(context.clone(), session.clone(), envelope)
                .map(Delivery::Scheduled);
        }

        let handlers = self
            .default_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if handlers.is_empty() {
            return Err(DispatchError::NotSpecified { tag: envelope.tag });
        }

        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(context, session, &envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(tag = %envelope.tag, error = %err, "default handler failed"),
                Err(_) => error!(tag = %envelope.tag, "default handler panicked"),
            }
        }

        Ok(Delivery::Fallback {
            handlers: handlers.len(),
        })
    }

    /// Unregisters every pipeline that is empty and not sealed, returning how many were removed.
    pub fn clear_all_empty_pipelines(&self) -> usize {
        let mut pipelines = self.pipelines();
        let before = pipelines.len();
        pipelines.retain(|_, pipeline| pipeline.is_sealed() || !pipeline.is_empty());
        let removed = before - pipelines.len();
        if removed > 0 {
            debug!(removed, "cleared empty receive pipelines");
        }
        removed
    }

    /// Returns the number of registered pipelines.
    pub fn len(&self) -> usize {
        self.pipelines().len()
    }

    /// Returns `true` if no pipeline is registered.
    pub fn is_empty(&self) -> bool {
        self.pipelines().is_empty()
    }

    fn pipelines(&self) -> MutexGuard<'_, HashMap<&'static str, Arc<dyn ErasedPipeline>>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        DispatchRegistry::new()
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.pipelines().keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("DispatchRegistry")
            .field("pipelines", &tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Barrier,
    };

    use super::*;
    use crate::{id::ClientId, protocol::Ping, test_support::context};

    fn ping_envelope() -> Envelope {
        Envelope::wrap(&Ping {
            client_id: ClientId::generate(),
        })
        .unwrap()
    }

    #[derive(Serialize, Deserialize)]
    struct Impostor;

    impl Message for Impostor {
        const TAG: &'static str = "Ping";
    }

    #[test]
    fn register_is_idempotent() {
        let registry = DispatchRegistry::new();
        let first = registry.register::<Ping>().unwrap();
        let second = registry.register::<Ping>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_tags_are_rejected() {
        let registry = DispatchRegistry::new();
        registry.register::<Ping>().unwrap();
        assert!(matches!(
            registry.register::<Impostor>(),
            Err(DispatchError::TagConflict { tag: "Ping" })
        ));
        assert!(registry.get::<Impostor>().is_none());
        assert!(registry.get::<Ping>().is_some());
    }

    #[test]
    fn unregister_reports_absence() {
        let registry = DispatchRegistry::new();
        assert!(!registry.unregister::<Ping>());
        registry.register::<Ping>().unwrap();
        assert!(registry.unregister::<Ping>());
        assert!(!registry.is_registered::<Ping>());
    }

    #[test]
    fn housekeeping_keeps_sealed_and_populated_pipelines() {
        #[derive(Serialize, Deserialize)]
        struct Kept;
        impl Message for Kept {
            const TAG: &'static str = "Kept";
        }

        #[derive(Serialize, Deserialize)]
        struct Sealed;
        impl Message for Sealed {
            const TAG: &'static str = "Sealed";
        }

        let registry = DispatchRegistry::new();
        registry.register::<Ping>().unwrap();
        registry
            .register::<Kept>()
            .unwrap()
            .add_last(handler_fn(|_, _, _: &Kept| Ok(())));
        registry.register::<Sealed>().unwrap().seal();

        assert_eq!(registry.clear_all_empty_pipelines(), 1);
        assert!(!registry.is_registered::<Ping>());
        assert!(registry.is_registered::<Kept>());
        assert!(registry.is_registered::<Sealed>());
    }

    #[test]
    fn concurrent_first_registration_yields_one_pipeline() {
        const THREADS: usize = 8;
        let registry = DispatchRegistry::new();
        let barrier = Barrier::new(THREADS);

        let pipelines: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.register::<Ping>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert!(pipelines.iter().all(|pipeline| Arc::ptr_eq(pipeline, &pipelines[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unrouted_tag_without_default_handlers_is_not_specified() {
        let (context, _remote) = context().await;
        let registry = DispatchRegistry::new();

        let result = registry.trigger(&context, &context.session(), ping_envelope());
        assert!(matches!(
            result,
            Err(DispatchError::NotSpecified { tag }) if tag == "Ping"
        ));
    }

    #[tokio::test]
    async fn default_handlers_are_isolated_from_each_other() {
        let (context, _remote) = context().await;
        let registry = DispatchRegistry::new();
        let reached = Arc::new(AtomicUsize::new(0));

        registry.add_default_handler(|_, _, _| Err("refused".into()));
        registry.add_default_handler(|_, _, _| panic!("default handler exploded"));
        let counter = reached.clone();
        registry.add_default_handler(move |_, _, envelope| {
            assert_eq!(envelope.tag(), "Ping");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let delivery = registry
            .trigger(&context, &context.session(), ping_envelope())
            .unwrap();
        assert!(matches!(delivery, Delivery::Fallback { handlers: 3 }));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }
}
