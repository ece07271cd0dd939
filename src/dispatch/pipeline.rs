use std::{
    collections::VecDeque,
    fmt,
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{error, trace, warn};

use crate::{
    context::ConnectionContext,
    error::{BoxError, PipelineError},
    message::Message,
    session::Session,
};

/// Handles received messages of type `M`.
pub trait ReceiveHandler<M: Message>: Send + Sync + 'static {
    /// Called for every received `M` whose predicates all hold.
    ///
    /// Errors are logged and do not affect other handlers of the pipeline.
    fn on_receive(
        &self,
        context: &ConnectionContext,
        session: &Session,
        message: &M,
    ) -> Result<(), BoxError>;

    /// Called instead of adding the handler when the pipeline is closed.
    fn on_add_failed(&self) {}
}

/// A shared handler. Two handler refs are equal when they point to the same allocation.
pub type HandlerRef<M> = Arc<dyn ReceiveHandler<M>>;

/// A condition attached to a pipeline entry. An entry runs only if all of its predicates hold.
pub type Predicate<M> = Arc<dyn Fn(&ConnectionContext, &Session, &M) -> bool + Send + Sync>;

/// Wraps a closure as a [`HandlerRef`].
///
/// # Example
///
/// ```ignore
/// let handler = handler_fn(|context, _session, line: &ChatLine| {
///     context.send(line)?;
///     Ok(())
/// });
/// registry.register::<ChatLine>()?.add_last(handler);
/// ```
pub fn handler_fn<M, F>(f: F) -> HandlerRef<M>
where
    M: Message,
    F: Fn(&ConnectionContext, &Session, &M) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        f,
        phantom: PhantomData,
    })
}

struct FnHandler<M, F> {
    f: F,
    phantom: PhantomData<fn(&M)>,
}

impl<M, F> ReceiveHandler<M> for FnHandler<M, F>
where
    M: Message,
    F: Fn(&ConnectionContext, &Session, &M) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn on_receive(
        &self,
        context: &ConnectionContext,
        session: &Session,
        message: &M,
    ) -> Result<(), BoxError> {
        (self.f)(context, session, message)
    }
}

fn same_handler<M: Message>(a: &HandlerRef<M>, b: &HandlerRef<M>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct Entry<M: Message> {
    handler: HandlerRef<M>,
    predicates: Mutex<Vec<Predicate<M>>>,
}

impl<M: Message> Entry<M> {
    fn new(handler: HandlerRef<M>) -> Arc<Self> {
        Arc::new(Entry {
            handler,
            predicates: Mutex::new(Vec::new()),
        })
    }

    fn accepts(&self, context: &ConnectionContext, session: &Session, message: &M) -> bool {
        let predicates = self
            .predicates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        predicates
            .iter()
            .all(|predicate| predicate(context, session, message))
    }
}

/// Attaches further predicates to the entry that was just added.
///
/// Returned detached when nothing was added, in which case predicates are discarded.
pub struct ReceivePipelineCondition<M: Message> {
    entry: Option<Arc<Entry<M>>>,
}

impl<M: Message> ReceivePipelineCondition<M> {
    fn attached(entry: Arc<Entry<M>>) -> Self {
        ReceivePipelineCondition { entry: Some(entry) }
    }

    fn detached() -> Self {
        ReceivePipelineCondition { entry: None }
    }

    /// Requires `predicate` to hold for the entry to run.
    pub fn require(
        self,
        predicate: impl Fn(&ConnectionContext, &Session, &M) -> bool + Send + Sync + 'static,
    ) -> Self {
        if let Some(entry) = &self.entry {
            entry
                .predicates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::new(predicate));
        }
        self
    }

    /// Requires the session to be identified for the entry to run.
    pub fn require_identified(self) -> Self {
        self.require(|_, session, _| session.is_identified())
    }

    /// Returns `true` if the handler was actually added.
    pub fn is_attached(&self) -> bool {
        self.entry.is_some()
    }
}

impl<M: Message> fmt::Debug for ReceivePipelineCondition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivePipelineCondition")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Admission policy for handlers bound with [`ReceivePipeline::to`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceivePipelineHandlerPolicy {
    /// Binding is rejected.
    NotAllowed,
    /// The bound handler replaces every entry, then the pipeline is closed and sealed.
    #[default]
    AllowSingle,
    /// Any number of handlers can be bound.
    AllowMultiple,
}

impl ReceivePipelineHandlerPolicy {
    fn prepare<M: Message>(self, state: &mut PipelineState<M>) -> Result<(), PipelineError> {
        match self {
            ReceivePipelineHandlerPolicy::NotAllowed => {
                Err(PipelineError::HandlerNotAllowed { tag: M::TAG })
            }
            ReceivePipelineHandlerPolicy::AllowSingle => {
                state.entries.clear();
                Ok(())
            }
            ReceivePipelineHandlerPolicy::AllowMultiple => Ok(()),
        }
    }

    fn after_adding<M: Message>(self, state: &mut PipelineState<M>) {
        match self {
            ReceivePipelineHandlerPolicy::AllowSingle => {
                state.closed = true;
                state.sealed = true;
            }
            ReceivePipelineHandlerPolicy::NotAllowed
            | ReceivePipelineHandlerPolicy::AllowMultiple => {}
        }
    }
}

struct PipelineState<M: Message> {
    entries: VecDeque<Arc<Entry<M>>>,
    closed: bool,
    sealed: bool,
    policy: ReceivePipelineHandlerPolicy,
}

/// The ordered handlers registered for one message type.
///
/// Entries run in order for each received message. Every message is dispatched on its own task, but runs of the
/// same pipeline wait on a shared gate, so one message is processed at a time.
pub struct ReceivePipeline<M: Message> {
    state: Mutex<PipelineState<M>>,
    gate: tokio::sync::Mutex<()>,
}

impl<M: Message> ReceivePipeline<M> {
    /// Creates an empty, open pipeline.
    pub fn new() -> Self {
        ReceivePipeline {
            state: Mutex::new(PipelineState {
                entries: VecDeque::new(),
                closed: false,
                sealed: false,
                policy: ReceivePipelineHandlerPolicy::default(),
            }),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the type tag this pipeline handles.
    pub fn tag(&self) -> &'static str {
        M::TAG
    }

    /// Inserts a handler before every existing entry.
    pub fn add_first(&self, handler: HandlerRef<M>) -> ReceivePipelineCondition<M> {
        self.add(handler, false, true)
    }

    /// Inserts a handler after every existing entry.
    pub fn add_last(&self, handler: HandlerRef<M>) -> ReceivePipelineCondition<M> {
        self.add(handler, false, false)
    }

    /// Like [`add_first`](ReceivePipeline::add_first), but does nothing if the handler is already present.
    pub fn add_first_if_not_contained(&self, handler: HandlerRef<M>) -> ReceivePipelineCondition<M> {
        self.add(handler, true, true)
    }

    /// Like [`add_last`](ReceivePipeline::add_last), but does nothing if the handler is already present.
    pub fn add_last_if_not_contained(&self, handler: HandlerRef<M>) -> ReceivePipelineCondition<M> {
        self.add(handler, true, false)
    }

    fn add(&self, handler: HandlerRef<M>, unique: bool, first: bool) -> ReceivePipelineCondition<M> {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            trace!(tag = M::TAG, "pipeline is closed, rejecting handler");
            handler.on_add_failed();
            return ReceivePipelineCondition::detached();
        }
        if unique && contains(&state, &handler) {
            return ReceivePipelineCondition::detached();
        }

        let entry = Entry::new(handler);
        if first {
            state.entries.push_front(entry.clone());
        } else {
            state.entries.push_back(entry.clone());
        }
        ReceivePipelineCondition::attached(entry)
    }

    /// Binds a handler according to the pipeline's [`ReceivePipelineHandlerPolicy`].
    pub fn to(&self, handler: HandlerRef<M>) -> Result<ReceivePipelineCondition<M>, PipelineError> {
        let mut state = self.lock();
        if state.closed {
            let sealed = state.sealed;
            drop(state);
            handler.on_add_failed();
            return Err(if sealed {
                PipelineError::Sealed { tag: M::TAG }
            } else {
                PipelineError::Closed { tag: M::TAG }
            });
        }

        let policy = state.policy;
        policy.prepare(&mut *state)?;
        let entry = Entry::new(handler);
        state.entries.push_back(entry.clone());
        policy.after_adding(&mut *state);

        Ok(ReceivePipelineCondition::attached(entry))
    }

    /// Removes a handler, returning whether it was present.
    pub fn remove(&self, handler: &HandlerRef<M>) -> bool {
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|entry| !same_handler(&entry.handler, handler));
        state.entries.len() != before
    }

    /// Returns `true` if the handler is present.
    pub fn contains(&self, handler: &HandlerRef<M>) -> bool {
        contains(&self.lock(), handler)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Rejects further handlers.
    pub fn close(&self) -> Result<(), PipelineError> {
        self.set_closed(true)
    }

    /// Accepts handlers again.
    pub fn open(&self) -> Result<(), PipelineError> {
        self.set_closed(false)
    }

    fn set_closed(&self, closed: bool) -> Result<(), PipelineError> {
        let mut state = self.lock();
        if state.sealed {
            return Err(PipelineError::Sealed { tag: M::TAG });
        }
        state.closed = closed;
        Ok(())
    }

    /// Freezes the open/closed state and the policy. Sealed pipelines survive
    /// [`DispatchRegistry::clear_all_empty_pipelines`](crate::dispatch::DispatchRegistry::clear_all_empty_pipelines).
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    /// Returns `true` if the pipeline rejects new handlers.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns `true` if the pipeline is sealed.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Returns the admission policy.
    pub fn handler_policy(&self) -> ReceivePipelineHandlerPolicy {
        self.lock().policy
    }

    /// Changes the admission policy.
    pub fn set_handler_policy(&self, policy: ReceivePipelineHandlerPolicy) -> Result<(), PipelineError> {
        let mut state = self.lock();
        if state.sealed {
            return Err(PipelineError::Sealed { tag: M::TAG });
        }
        state.policy = policy;
        Ok(())
    }

    /// Runs every matching entry for a received message.
    ///
    /// Runs are serialized by the pipeline's gate and iterate a snapshot of the entries, so handlers may modify the
    /// pipeline. Errors and panics of one handler are logged and do not stop the remaining entries.
    pub async fn run(&self, context: &ConnectionContext, session: &Session, message: &M) {
        let _gate = self.gate.lock().await;
        let entries: Vec<_> = self.lock().entries.iter().cloned().collect();

        for entry in entries {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if !entry.accepts(context, session, message) {
                    return Ok(());
                }
                entry.handler.on_receive(context, session, message)
            }));

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(tag = M::TAG, error = %err, "receive handler failed"),
                Err(_) => error!(tag = M::TAG, "receive handler panicked"),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn contains<M: Message>(state: &PipelineState<M>, handler: &HandlerRef<M>) -> bool {
    state
        .entries
        .iter()
        .any(|entry| same_handler(&entry.handler, handler))
}

impl<M: Message> Default for ReceivePipeline<M> {
    fn default() -> Self {
        ReceivePipeline::new()
    }
}

impl<M: Message> fmt::Debug for ReceivePipeline<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ReceivePipeline")
            .field("tag", &M::TAG)
            .field("entries", &state.entries.len())
            .field("closed", &state.closed)
            .field("sealed", &state.sealed)
            .field("policy", &state.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::test_support::context;

    #[derive(Debug, Serialize, Deserialize)]
    struct Note {
        value: u32,
    }

    impl Message for Note {
        const TAG: &'static str = "Note";
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> HandlerRef<Note> {
        let log = log.clone();
        handler_fn(move |_, _, _: &Note| {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    struct Rejected(Arc<AtomicUsize>);

    impl ReceiveHandler<Note> for Rejected {
        fn on_receive(&self, _: &ConnectionContext, _: &Session, _: &Note) -> Result<(), BoxError> {
            Ok(())
        }

        fn on_add_failed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn entries_run_in_insertion_order() {
        let (context, _remote) = context().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        let a = recording(&log, "A");
        let b = recording(&log, "B");
        let c = recording(&log, "C");
        let d = recording(&log, "D");
        pipeline.add_last(a);
        pipeline.add_last(b.clone());
        pipeline.add_last(c);
        pipeline.add_first(d);

        pipeline.run(&context, &context.session(), &Note { value: 1 }).await;
        assert_eq!(*log.lock().unwrap(), vec!["D", "A", "B", "C"]);

        log.lock().unwrap().clear();
        assert!(pipeline.remove(&b));
        assert!(!pipeline.remove(&b));
        pipeline.run(&context, &context.session(), &Note { value: 1 }).await;
        assert_eq!(*log.lock().unwrap(), vec!["D", "A", "C"]);
    }

    #[tokio::test]
    async fn predicates_use_and_semantics() {
        let (context, _remote) = context().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline
            .add_last(recording(&log, "both"))
            .require(|_, _, note| note.value > 1)
            .require(|_, _, note| note.value % 2 == 0);
        pipeline.add_last(recording(&log, "always"));

        for value in [2, 3, 4] {
            pipeline.run(&context, &context.session(), &Note { value }).await;
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["both", "always", "always", "both", "always"]
        );
    }

    #[tokio::test]
    async fn failing_handlers_do_not_stop_siblings() {
        let (context, _remote) = context().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline.add_last(handler_fn(|_, _, _: &Note| Err("nope".into())));
        pipeline.add_last(handler_fn(|_, _, _: &Note| panic!("boom")));
        pipeline.add_last(recording(&log, "survivor"));

        pipeline.run(&context, &context.session(), &Note { value: 0 }).await;
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn if_not_contained_is_a_no_op_for_present_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        let handler = recording(&log, "A");
        assert!(pipeline.add_last_if_not_contained(handler.clone()).is_attached());
        assert!(!pipeline.add_first_if_not_contained(handler.clone()).is_attached());
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.contains(&handler));
    }

    #[test]
    fn closed_pipelines_reject_handlers() {
        let failures = Arc::new(AtomicUsize::new(0));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline.close().unwrap();

        let condition = pipeline.add_last(Arc::new(Rejected(failures.clone())));
        assert!(!condition.is_attached());
        assert!(pipeline.is_empty());
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        pipeline.open().unwrap();
        assert!(pipeline.add_last(Arc::new(Rejected(failures))).is_attached());
    }

    #[test]
    fn allow_single_seals_after_binding() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline.add_last(recording(&log, "old"));

        pipeline.to(recording(&log, "single")).unwrap();
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.is_closed());
        assert!(pipeline.is_sealed());

        assert_eq!(
            pipeline.to(recording(&log, "second")).unwrap_err(),
            PipelineError::Sealed { tag: "Note" }
        );
        assert_eq!(pipeline.open(), Err(PipelineError::Sealed { tag: "Note" }));
        assert_eq!(
            pipeline.set_handler_policy(ReceivePipelineHandlerPolicy::AllowMultiple),
            Err(PipelineError::Sealed { tag: "Note" })
        );
    }

    #[test]
    fn allow_multiple_layers_bindings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline
            .set_handler_policy(ReceivePipelineHandlerPolicy::AllowMultiple)
            .unwrap();
        pipeline.to(recording(&log, "A")).unwrap();
        pipeline.to(recording(&log, "B")).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert!(!pipeline.is_sealed());
    }

    #[test]
    fn not_allowed_rejects_bindings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline
            .set_handler_policy(ReceivePipelineHandlerPolicy::NotAllowed)
            .unwrap();
        assert_eq!(
            pipeline.to(recording(&log, "A")).unwrap_err(),
            PipelineError::HandlerNotAllowed { tag: "Note" }
        );
        assert!(pipeline.is_empty());
    }

    #[test]
    fn closed_but_unsealed_binding_reports_closed() {
        let failures = Arc::new(AtomicUsize::new(0));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline.close().unwrap();
        assert_eq!(
            pipeline.to(Arc::new(Rejected(failures.clone()))).unwrap_err(),
            PipelineError::Closed { tag: "Note" }
        );
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sealed_binding_notifies_the_rejected_handler() {
        let failures = Arc::new(AtomicUsize::new(0));
        let pipeline = ReceivePipeline::<Note>::new();
        pipeline.to(handler_fn(|_, _, _: &Note| Ok(()))).unwrap();
        assert!(pipeline.is_sealed());

        assert_eq!(
            pipeline.to(Arc::new(Rejected(failures.clone()))).unwrap_err(),
            PipelineError::Sealed { tag: "Note" }
        );
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.len(), 1);
    }
}
