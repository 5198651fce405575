use crate::http::request::{HttpError, Request, Response};
use arc_swap::ArcSwap;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub enum PipelineError {
    /// The response state machine was violated (already committed).
    IllegalState,
    Handler(String),
}

impl From<HttpError> for PipelineError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::IllegalState => PipelineError::IllegalState,
        }
    }
}

/// One request-processing stage. Valves form a chain of responsibility:
/// each decides whether to pass the request on through `next`.
pub trait Valve: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        next: &Next<'_>,
    ) -> Result<(), PipelineError>;

    /// Periodic housekeeping driven by the background processor.
    fn background_process(&self) {}
}

/// Continuation pointing at the remaining valves of a pipeline, ending in
/// the basic valve.
pub struct Next<'a> {
    valves: &'a [Arc<dyn Valve>],
    basic: Option<&'a Arc<dyn Valve>>,
    index: usize,
}

impl Next<'_> {
    pub fn invoke(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        if self.index < self.valves.len() {
            let valve = &self.valves[self.index];
            let next = Next {
                valves: self.valves,
                basic: self.basic,
                index: self.index + 1,
            };
            return valve.invoke(request, response, &next);
        }

        if let Some(basic) = self.basic {
            let next = Next {
                valves: &[],
                basic: None,
                index: 0,
            };
            return basic.invoke(request, response, &next);
        }

        Ok(())
    }
}

/// Ordered valve chain owned by one container. The basic valve is fixed
/// at construction and never removed by configuration changes; added
/// valves run ahead of it. Reads are lock-free over copy-on-write lists.
pub struct Pipeline {
    valves: ArcSwap<Vec<Arc<dyn Valve>>>,
    basic: RwLock<Option<Arc<dyn Valve>>>,
}

impl Pipeline {
    pub fn new(basic: Arc<dyn Valve>) -> Pipeline {
        Pipeline {
            valves: ArcSwap::from_pointee(Vec::new()),
            basic: RwLock::new(Some(basic)),
        }
    }

    pub fn add_valve(&self, valve: Arc<dyn Valve>) {
        self.valves.rcu(|current| {
            let mut next = (**current).clone();
            next.push(Arc::clone(&valve));
            next
        });
    }

    /// Removes a previously added valve. The basic valve is not
    /// removable.
    pub fn remove_valve(&self, valve: &Arc<dyn Valve>) {
        self.valves.rcu(|current| {
            current
                .iter()
                .filter(|other| !Arc::ptr_eq(other, valve))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn set_basic(&self, valve: Arc<dyn Valve>) {
        *self.basic.write().unwrap() = Some(valve);
    }

    pub fn basic(&self) -> Option<Arc<dyn Valve>> {
        self.basic.read().unwrap().clone()
    }

    /// Snapshot of the chain, basic valve last.
    pub fn valves(&self) -> Vec<Arc<dyn Valve>> {
        let mut snapshot: Vec<Arc<dyn Valve>> = (**self.valves.load()).clone();
        if let Some(basic) = self.basic.read().unwrap().clone() {
            snapshot.push(basic);
        }
        snapshot
    }

    /// Dispatches a request through the chain starting at the first
    /// valve.
    pub fn invoke(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        let valves = self.valves.load();
        let basic = self.basic.read().unwrap().clone();

        let next = Next {
            valves: &valves,
            basic: basic.as_ref(),
            index: 0,
        };

        next.invoke(request, response)
    }

    pub fn background_process(&self) {
        for valve in self.valves() {
            valve.background_process();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TraceValve {
        tag: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        background_runs: AtomicUsize,
        terminal: bool,
    }

    impl TraceValve {
        fn new(
            tag: &'static str,
            order: &Arc<std::sync::Mutex<Vec<&'static str>>>,
            terminal: bool,
        ) -> Arc<TraceValve> {
            Arc::new(TraceValve {
                tag,
                order: Arc::clone(order),
                background_runs: AtomicUsize::new(0),
                terminal,
            })
        }
    }

    impl Valve for TraceValve {
        fn name(&self) -> &str {
            self.tag
        }

        fn invoke(
            &self,
            request: &mut Request,
            response: &mut Response,
            next: &Next<'_>,
        ) -> Result<(), PipelineError> {
            self.order.lock().unwrap().push(self.tag);
            if self.terminal {
                return Ok(());
            }
            next.invoke(request, response)
        }

        fn background_process(&self) {
            self.background_runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_chain_runs_in_order_with_basic_last() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let basic = TraceValve::new("basic", &order, true);
        let pipeline = Pipeline::new(basic);

        pipeline.add_valve(TraceValve::new("first", &order, false));
        pipeline.add_valve(TraceValve::new("second", &order, false));

        let mut request = Request::new();
        let mut response = Response::new();
        pipeline.invoke(&mut request, &mut response).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "basic"]);
    }

    #[test]
    fn test_terminal_valve_short_circuits() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let basic = TraceValve::new("basic", &order, true);
        let pipeline = Pipeline::new(basic);

        pipeline.add_valve(TraceValve::new("gate", &order, true));
        pipeline.add_valve(TraceValve::new("unreached", &order, false));

        let mut request = Request::new();
        let mut response = Response::new();
        pipeline.invoke(&mut request, &mut response).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["gate"]);
    }

    #[test]
    fn test_remove_valve_keeps_basic() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let basic = TraceValve::new("basic", &order, true);
        let pipeline = Pipeline::new(basic);

        let removable = TraceValve::new("removable", &order, false);
        let as_valve: Arc<dyn Valve> = removable;
        pipeline.add_valve(Arc::clone(&as_valve));
        assert_eq!(pipeline.valves().len(), 2);

        pipeline.remove_valve(&as_valve);
        assert_eq!(pipeline.valves().len(), 1);
        assert_eq!(pipeline.valves()[0].name(), "basic");
    }

    #[test]
    fn test_background_reaches_all_valves() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let basic = TraceValve::new("basic", &order, true);
        let held = Arc::clone(&basic);
        let pipeline = Pipeline::new(basic);

        pipeline.background_process();
        assert_eq!(held.background_runs.load(Ordering::SeqCst), 1);
    }
}
