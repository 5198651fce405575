//! The container hierarchy: engine → virtual host → context → servlet
//! wrapper. Each container owns one pipeline of valves; request dispatch
//! walks child containers through the basic valves.

pub mod pipeline;
pub mod valves;

use crate::http::request::{Request, Response};
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState, LifecycleSupport};
use arc_swap::ArcSwap;
use flue::logging;
use indexmap::IndexMap;
use pipeline::{Pipeline, PipelineError, Valve};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// External collaborators attached per container. Only the capabilities
/// the core touches are modeled.
pub trait Realm: Send + Sync {
    fn start(&self) {}
    fn stop(&self) {}
    fn background_process(&self) {}
}

pub trait Cluster: Send + Sync {
    fn start(&self) {}
    fn stop(&self) {}
    fn background_process(&self) {}
}

/// The terminal request handler a wrapper runs (the "servlet").
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContainerEvent {
    AddChild,
    RemoveChild,
    AddValve,
    RemoveValve,
    Start,
    Stop,
}

pub trait ContainerListener: Send + Sync {
    fn container_event(&self, container: &Arc<Container>, event: ContainerEvent);
}

#[derive(Debug)]
pub enum ContainerError {
    DuplicateChild(String),
    Lifecycle(LifecycleError),
}

impl From<LifecycleError> for ContainerError {
    fn from(err: LifecycleError) -> Self {
        ContainerError::Lifecycle(err)
    }
}

/// Kind-specific state. The concrete container kinds differ only in
/// their basic valve and their child-key semantics (host: name; context:
/// path; wrapper: servlet name).
pub enum ContainerKind {
    Engine {
        default_host: Mutex<String>,
    },
    Host,
    Context {
        path: String,
        /// Servlet mappings: pattern → wrapper name. Exact, "/prefix/*",
        /// "*.ext" and the "/" default pattern are understood.
        mappings: Mutex<Vec<(String, String)>>,
    },
    Wrapper {
        handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    },
}

pub struct Container {
    kind: ContainerKind,
    name: String,
    self_ref: Weak<Container>,
    parent: RwLock<Weak<Container>>,
    children: Mutex<IndexMap<String, Arc<Container>>>,
    pipeline: Pipeline,
    listeners: ArcSwap<Vec<Arc<dyn ContainerListener>>>,
    lifecycle: LifecycleSupport,

    /// Seconds between background ticks; values <= 0 leave this
    /// container to its parent's walk.
    background_delay: AtomicI64,
    background_stop: Arc<(Mutex<bool>, Condvar)>,
    background_thread: Mutex<Option<JoinHandle<()>>>,

    realm: RwLock<Option<Arc<dyn Realm>>>,
    cluster: RwLock<Option<Arc<dyn Cluster>>>,

    log: logging::Logger,
}

impl Container {
    fn build(kind: ContainerKind, name: String, log: logging::Logger) -> Arc<Container> {
        Arc::new_cyclic(|self_ref| {
            let basic: Arc<dyn Valve> = match &kind {
                ContainerKind::Engine { .. } => Arc::new(valves::EngineValve::new(self_ref.clone())),
                ContainerKind::Host => Arc::new(valves::HostValve::new(self_ref.clone())),
                ContainerKind::Context { .. } => {
                    Arc::new(valves::ContextValve::new(self_ref.clone()))
                }
                ContainerKind::Wrapper { .. } => {
                    Arc::new(valves::WrapperValve::new(self_ref.clone(), log.clone()))
                }
            };

            Container {
                kind,
                name,
                self_ref: self_ref.clone(),
                parent: RwLock::new(Weak::new()),
                children: Mutex::new(IndexMap::new()),
                pipeline: Pipeline::new(basic),
                listeners: ArcSwap::from_pointee(Vec::new()),
                lifecycle: LifecycleSupport::new(),
                background_delay: AtomicI64::new(-1),
                background_stop: Arc::new((Mutex::new(false), Condvar::new())),
                background_thread: Mutex::new(None),
                realm: RwLock::new(None),
                cluster: RwLock::new(None),
                log,
            }
        })
    }

    pub fn new_engine<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        default_host: &str,
        log: L,
    ) -> Arc<Container> {
        let log = logging::child_of(log).new(logging::o!("engine" => name.to_string()));
        Self::build(
            ContainerKind::Engine {
                default_host: Mutex::new(default_host.to_string()),
            },
            name.to_string(),
            log,
        )
    }

    pub fn new_host<'a, L: Into<Option<&'a logging::Logger>>>(name: &str, log: L) -> Arc<Container> {
        let log = logging::child_of(log).new(logging::o!("host" => name.to_string()));
        Self::build(ContainerKind::Host, name.to_string(), log)
    }

    /// A context is keyed by its URI path; the root context has path "".
    pub fn new_context<'a, L: Into<Option<&'a logging::Logger>>>(
        path: &str,
        log: L,
    ) -> Arc<Container> {
        let log = logging::child_of(log).new(logging::o!("context" => path.to_string()));
        Self::build(
            ContainerKind::Context {
                path: path.to_string(),
                mappings: Mutex::new(Vec::new()),
            },
            path.to_string(),
            log,
        )
    }

    pub fn new_wrapper<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        handler: Arc<dyn RequestHandler>,
        log: L,
    ) -> Arc<Container> {
        let log = logging::child_of(log).new(logging::o!("wrapper" => name.to_string()));
        Self::build(
            ContainerKind::Wrapper {
                handler: RwLock::new(Some(handler)),
            },
            name.to_string(),
            log,
        )
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &ContainerKind {
        &self.kind
    }

    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.read().expect("Container lock poisoned").upgrade()
    }

    // ---- tree ------------------------------------------------------------

    /// Adds a child; names must be unique within a parent. A child joins
    /// a started parent started.
    pub fn add_child(&self, child: Arc<Container>) -> Result<(), ContainerError> {
        {
            let mut children = self.children.lock().expect("Container lock poisoned");

            if children.contains_key(child.name()) {
                return Err(ContainerError::DuplicateChild(child.name().to_string()));
            }

            *child.parent.write().expect("Container lock poisoned") = self.self_ref.clone();
            children.insert(child.name().to_string(), Arc::clone(&child));
        }

        if self.lifecycle.state() == LifecycleState::Started {
            child.init_and_start()?;
        }

        self.fire(ContainerEvent::AddChild);
        Ok(())
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Container>> {
        let removed = self
            .children
            .lock()
            .expect("Container lock poisoned")
            .shift_remove(name);

        if let Some(child) = &removed {
            *child.parent.write().expect("Container lock poisoned") = Weak::new();
            if child.lifecycle.state() == LifecycleState::Started {
                let _ = child.stop();
            }
            self.fire(ContainerEvent::RemoveChild);
        }

        removed
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Container>> {
        self.children
            .lock()
            .expect("Container lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn children(&self) -> Vec<Arc<Container>> {
        self.children
            .lock()
            .expect("Container lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    // ---- kind accessors --------------------------------------------------

    pub fn default_host(&self) -> Option<String> {
        match &self.kind {
            ContainerKind::Engine { default_host } => {
                Some(default_host.lock().expect("Container lock poisoned").clone())
            }
            _ => None,
        }
    }

    pub fn set_default_host(&self, name: &str) {
        if let ContainerKind::Engine { default_host } = &self.kind {
            *default_host.lock().expect("Container lock poisoned") = name.to_string();
        }
    }

    pub fn context_path(&self) -> Option<&str> {
        match &self.kind {
            ContainerKind::Context { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Registers a servlet mapping on a context.
    pub fn add_servlet_mapping(&self, pattern: &str, wrapper_name: &str) {
        if let ContainerKind::Context { mappings, .. } = &self.kind {
            mappings
                .lock()
                .expect("Container lock poisoned")
                .push((pattern.to_string(), wrapper_name.to_string()));
        }
    }

    pub fn servlet_mappings(&self) -> Vec<(String, String)> {
        match &self.kind {
            ContainerKind::Context { mappings, .. } => {
                mappings.lock().expect("Container lock poisoned").clone()
            }
            _ => Vec::new(),
        }
    }

    pub fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        match &self.kind {
            ContainerKind::Wrapper { handler } => {
                handler.read().expect("Container lock poisoned").clone()
            }
            _ => None,
        }
    }

    // ---- collaborators ---------------------------------------------------

    pub fn set_realm(&self, realm: Arc<dyn Realm>) {
        *self.realm.write().expect("Container lock poisoned") = Some(realm);
    }

    pub fn realm(&self) -> Option<Arc<dyn Realm>> {
        self.realm.read().expect("Container lock poisoned").clone()
    }

    pub fn set_cluster(&self, cluster: Arc<dyn Cluster>) {
        *self.cluster.write().expect("Container lock poisoned") = Some(cluster);
    }

    pub fn cluster(&self) -> Option<Arc<dyn Cluster>> {
        self.cluster.read().expect("Container lock poisoned").clone()
    }

    // ---- listeners -------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn ContainerListener>) {
        self.listeners.rcu(|current| {
            let mut next = (**current).clone();
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ContainerListener>) {
        self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|other| !Arc::ptr_eq(other, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn fire(&self, event: ContainerEvent) {
        if let Some(this) = self.self_ref.upgrade() {
            let listeners = self.listeners.load();
            for listener in listeners.iter() {
                listener.container_event(&this, event);
            }
        }
    }

    /// Adds a valve ahead of the basic valve and notifies listeners.
    pub fn add_valve(&self, valve: Arc<dyn Valve>) {
        self.pipeline.add_valve(valve);
        self.fire(ContainerEvent::AddValve);
    }

    pub fn remove_valve(&self, valve: &Arc<dyn Valve>) {
        self.pipeline.remove_valve(valve);
        self.fire(ContainerEvent::RemoveValve);
    }

    // ---- dispatch --------------------------------------------------------

    /// Entry point used by the protocol processor: runs the request
    /// through this container's pipeline.
    pub fn invoke(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        self.pipeline.invoke(request, response)
    }

    // ---- background processing -------------------------------------------

    pub fn set_background_delay(&self, seconds: i64) {
        self.background_delay.store(seconds, Ordering::Release);
    }

    pub fn background_delay(&self) -> i64 {
        self.background_delay.load(Ordering::Acquire)
    }

    /// One housekeeping pass over this container's collaborators and
    /// valves.
    pub fn background_process(&self) {
        if let Some(cluster) = self.cluster() {
            cluster.background_process();
        }
        if let Some(realm) = self.realm() {
            realm.background_process();
        }
        self.pipeline.background_process();
    }

    /// Walks the subtree, processing each level that does not run its own
    /// schedule.
    fn background_walk(container: &Arc<Container>) {
        container.background_process();

        for child in container.children() {
            if child.background_delay() <= 0 {
                Self::background_walk(&child);
            }
        }
    }

    fn start_background_thread(&self) {
        let delay = self.background_delay();
        if delay <= 0 {
            return;
        }

        let Some(this) = self.self_ref.upgrade() else { return };

        {
            let (stopped, _) = &*self.background_stop;
            *stopped.lock().expect("Container lock poisoned") = false;
        }

        let stop = Arc::clone(&self.background_stop);
        let interval = Duration::from_secs(delay as u64);
        let log = self.log.clone();

        let handle = std::thread::Builder::new()
            .name("container-background".to_string())
            .spawn(move || {
                logging::debug!(log, "background processor started";
                                "interval_secs" => interval.as_secs());

                let (stopped, condvar) = &*stop;
                let mut guard = stopped.lock().expect("Container lock poisoned");

                loop {
                    let (next, timeout) = condvar
                        .wait_timeout(guard, interval)
                        .expect("Container lock poisoned");
                    guard = next;

                    if *guard {
                        break;
                    }

                    if timeout.timed_out() {
                        drop(guard);
                        Self::background_walk(&this);
                        guard = stopped.lock().expect("Container lock poisoned");
                    }
                }

                logging::debug!(log, "background processor stopped");
            })
            .expect("Background thread spawn failed");

        *self
            .background_thread
            .lock()
            .expect("Container lock poisoned") = Some(handle);
    }

    fn stop_background_thread(&self) {
        {
            let (stopped, condvar) = &*self.background_stop;
            *stopped.lock().expect("Container lock poisoned") = true;
            condvar.notify_all();
        }

        if let Some(handle) = self
            .background_thread
            .lock()
            .expect("Container lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }

    // ---- lifecycle template ----------------------------------------------

    /// Init + start in one call, for children joining a running parent.
    pub fn init_and_start(&self) -> Result<(), ContainerError> {
        if self.lifecycle.state() == LifecycleState::New {
            self.init()?;
        }
        self.start()?;
        Ok(())
    }

    /// Starts children in parallel, aggregating failures; the first
    /// failure is reported only after every child was attempted.
    fn start_children(&self) -> Result<(), LifecycleError> {
        let children = self.children();
        let mut failures: Vec<LifecycleError> = Vec::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = children
                .iter()
                .map(|child| {
                    scope.spawn(move || {
                        if child.lifecycle.state() == LifecycleState::New {
                            child.init()?;
                        }
                        child.start()
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failures.push(err),
                    Err(_) => failures.push(LifecycleError::Failed(
                        "child start panicked".to_string(),
                    )),
                }
            }
        });

        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn stop_children(&self) -> Result<(), LifecycleError> {
        let children = self.children();
        let mut failures: Vec<LifecycleError> = Vec::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = children
                .iter()
                .map(|child| scope.spawn(move || child.stop()))
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failures.push(err),
                    Err(_) => failures.push(LifecycleError::Failed(
                        "child stop panicked".to_string(),
                    )),
                }
            }
        });

        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}

impl Lifecycle for Container {
    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn init(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::Initialized)
    }

    /// Start order: cluster → realm → children (parallel) → pipeline →
    /// STARTED.
    fn start(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::StartingPrep)?;
        self.lifecycle.advance(LifecycleState::Starting)?;

        if let Some(cluster) = self.cluster() {
            cluster.start();
        }
        if let Some(realm) = self.realm() {
            realm.start();
        }

        if let Err(err) = self.start_children() {
            self.lifecycle.fail();
            return Err(err);
        }

        self.fire(ContainerEvent::Start);
        self.lifecycle.advance(LifecycleState::Started)?;

        self.start_background_thread();

        logging::info!(self.log, "container started"; "name" => %self.name);
        Ok(())
    }

    /// Stop order: pipeline → children → realm → cluster → STOPPED.
    fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::StoppingPrep)?;
        self.lifecycle.advance(LifecycleState::Stopping)?;

        self.stop_background_thread();
        self.fire(ContainerEvent::Stop);

        let children_result = self.stop_children();

        if let Some(realm) = self.realm() {
            realm.stop();
        }
        if let Some(cluster) = self.cluster() {
            cluster.stop();
        }

        if let Err(err) = children_result {
            self.lifecycle.fail();
            return Err(err);
        }

        self.lifecycle.advance(LifecycleState::Stopped)?;

        logging::info!(self.log, "container stopped"; "name" => %self.name);
        Ok(())
    }

    fn destroy(&self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::Destroying)?;

        for child in self.children() {
            let _ = child.destroy();
        }
        self.children.lock().expect("Container lock poisoned").clear();

        self.lifecycle.advance(LifecycleState::Destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NullHandler;

    impl RequestHandler for NullHandler {
        fn handle(&self, _request: &mut Request, _response: &mut Response) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    struct CountingListener {
        events: AtomicUsize,
    }

    impl ContainerListener for CountingListener {
        fn container_event(&self, _container: &Arc<Container>, _event: ContainerEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_child_names_unique() {
        let host = Container::new_host("localhost", None);

        host.add_child(Container::new_context("/app", None)).unwrap();
        let duplicate = host.add_child(Container::new_context("/app", None));

        assert!(matches!(
            duplicate,
            Err(ContainerError::DuplicateChild(_))
        ));
        assert_eq!(host.children().len(), 1);
    }

    #[test]
    fn test_parent_back_reference() {
        let engine = Container::new_engine("engine", "localhost", None);
        let host = Container::new_host("localhost", None);

        engine.add_child(Arc::clone(&host)).unwrap();

        assert_eq!(host.parent().unwrap().name(), "engine");
        engine.remove_child("localhost");
        assert!(host.parent().is_none());
    }

    #[test]
    fn test_tree_start_stop_order() {
        let engine = Container::new_engine("engine", "localhost", None);
        let host = Container::new_host("localhost", None);
        let context = Container::new_context("", None);

        context
            .add_child(Container::new_wrapper("default", Arc::new(NullHandler), None))
            .unwrap();
        host.add_child(context).unwrap();
        engine.add_child(host).unwrap();

        engine.init().unwrap();
        engine.start().unwrap();

        for child in engine.children() {
            assert_eq!(child.state(), LifecycleState::Started);
            for grandchild in child.children() {
                assert_eq!(grandchild.state(), LifecycleState::Started);
            }
        }

        engine.stop().unwrap();
        for child in engine.children() {
            assert_eq!(child.state(), LifecycleState::Stopped);
        }
    }

    #[test]
    fn test_child_joining_started_parent_starts() {
        let host = Container::new_host("localhost", None);
        host.init().unwrap();
        host.start().unwrap();

        let context = Container::new_context("/late", None);
        host.add_child(Arc::clone(&context)).unwrap();

        assert_eq!(context.state(), LifecycleState::Started);
        host.stop().unwrap();
    }

    #[test]
    fn test_listener_events() {
        let host = Container::new_host("localhost", None);
        let listener = Arc::new(CountingListener {
            events: AtomicUsize::new(0),
        });
        host.add_listener(listener.clone());

        host.add_child(Container::new_context("/a", None)).unwrap();
        host.remove_child("/a");

        assert_eq!(listener.events.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_background_walk_skips_self_scheduled() {
        struct TickingRealm {
            ticks: AtomicUsize,
        }
        impl Realm for TickingRealm {
            fn background_process(&self) {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
        }

        let engine = Container::new_engine("engine", "h", None);
        let child = Container::new_host("h", None);
        let grandchild = Container::new_context("", None);

        let engine_realm = Arc::new(TickingRealm {
            ticks: AtomicUsize::new(0),
        });
        let child_realm = Arc::new(TickingRealm {
            ticks: AtomicUsize::new(0),
        });
        let grandchild_realm = Arc::new(TickingRealm {
            ticks: AtomicUsize::new(0),
        });

        engine.set_realm(engine_realm.clone());
        child.set_realm(child_realm.clone());
        grandchild.set_realm(grandchild_realm.clone());

        child.add_child(Arc::clone(&grandchild)).unwrap();
        engine.add_child(Arc::clone(&child)).unwrap();

        // The child runs its own schedule; the walk must not descend
        // into it.
        child.set_background_delay(10);

        let engine_arc = engine.clone();
        Container::background_walk(&engine_arc);

        assert_eq!(engine_realm.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(child_realm.ticks.load(Ordering::SeqCst), 0);
        assert_eq!(grandchild_realm.ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_background_thread_ticks() {
        struct TickingRealm {
            ticks: AtomicUsize,
        }
        impl Realm for TickingRealm {
            fn background_process(&self) {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
        }

        let host = Container::new_host("bg", None);
        let realm = Arc::new(TickingRealm {
            ticks: AtomicUsize::new(0),
        });
        host.set_realm(realm.clone());
        host.set_background_delay(1);

        host.init().unwrap();
        host.start().unwrap();

        std::thread::sleep(Duration::from_millis(2500));
        host.stop().unwrap();

        assert!(realm.ticks.load(Ordering::SeqCst) >= 1);
    }
}
