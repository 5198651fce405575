//! The container-specific basic valves and the access-log valve. Basic
//! valves perform each level's dispatch: engine → host by name, host →
//! context by URI prefix, context → wrapper by servlet mapping, wrapper →
//! the request handler itself.

use crate::container::pipeline::{Next, PipelineError, Valve};
use crate::container::Container;
use crate::http::request::{reason_phrase, Request, Response};
use flue::logging;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Best-effort error response; quietly gives up on a committed response.
fn send_error(response: &mut Response, status: u16) {
    if response.is_committed() {
        return;
    }

    let _ = response.set_status(status);
    let _ = response.set_header("content-type", "text/plain");
    let _ = response.write(format!("{} {}\n", status, reason_phrase(status)).as_bytes());
}

/// Engine basic valve: selects a virtual host by the request's server
/// name, falling back to the engine's default host.
pub struct EngineValve {
    container: Weak<Container>,
}

impl EngineValve {
    pub fn new(container: Weak<Container>) -> EngineValve {
        EngineValve { container }
    }
}

impl Valve for EngineValve {
    fn name(&self) -> &str {
        "engine-valve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: &Next<'_>,
    ) -> Result<(), PipelineError> {
        let Some(engine) = self.container.upgrade() else {
            send_error(response, 503);
            return Ok(());
        };

        let server_name = request.server_name().to_ascii_lowercase();

        let host = engine.find_child(&server_name).or_else(|| {
            engine
                .default_host()
                .and_then(|name| engine.find_child(&name))
        });

        match host {
            Some(host) => host.invoke(request, response),
            None => {
                send_error(response, 404);
                Ok(())
            }
        }
    }
}

/// Host basic valve: selects a context by the longest URI prefix match
/// over the child context paths.
pub struct HostValve {
    container: Weak<Container>,
}

impl HostValve {
    pub fn new(container: Weak<Container>) -> HostValve {
        HostValve { container }
    }

    fn context_matches(path: &str, uri: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        uri == path || (uri.starts_with(path) && uri.as_bytes().get(path.len()) == Some(&b'/'))
    }
}

impl Valve for HostValve {
    fn name(&self) -> &str {
        "host-valve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: &Next<'_>,
    ) -> Result<(), PipelineError> {
        let Some(host) = self.container.upgrade() else {
            send_error(response, 503);
            return Ok(());
        };

        let mut selected: Option<Arc<Container>> = None;
        let mut selected_len = 0usize;

        for child in host.children() {
            let path = child.name();
            if Self::context_matches(path, &request.uri)
                && (selected.is_none() || path.len() > selected_len)
            {
                selected_len = path.len();
                selected = Some(child);
            }
        }

        match selected {
            Some(context) => context.invoke(request, response),
            None => {
                send_error(response, 404);
                Ok(())
            }
        }
    }
}

/// Context basic valve: maps the context-relative URI to a wrapper via
/// exact, prefix ("/x/*"), extension ("*.ext") and default ("/")
/// patterns, in that precedence order.
pub struct ContextValve {
    container: Weak<Container>,
}

impl ContextValve {
    pub fn new(container: Weak<Container>) -> ContextValve {
        ContextValve { container }
    }

    fn map(context: &Container, relative: &str) -> Option<String> {
        let mappings = context.servlet_mappings();

        // Exact match first.
        for (pattern, wrapper) in &mappings {
            if pattern == relative {
                return Some(wrapper.clone());
            }
        }

        // Longest prefix pattern.
        let mut best: Option<(&str, &str)> = None;
        for (pattern, wrapper) in &mappings {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                let hit = relative == prefix
                    || (relative.starts_with(prefix)
                        && relative.as_bytes().get(prefix.len()) == Some(&b'/'));
                if hit && best.map(|(b, _)| prefix.len() > b.len()).unwrap_or(true) {
                    best = Some((prefix, wrapper));
                }
            }
        }
        if let Some((_, wrapper)) = best {
            return Some(wrapper.to_string());
        }

        // Extension.
        if let Some(dot) = relative.rfind('.') {
            let extension = &relative[dot + 1..];
            for (pattern, wrapper) in &mappings {
                if let Some(mapped) = pattern.strip_prefix("*.") {
                    if mapped == extension {
                        return Some(wrapper.clone());
                    }
                }
            }
        }

        // Default servlet.
        for (pattern, wrapper) in &mappings {
            if pattern == "/" {
                return Some(wrapper.clone());
            }
        }

        None
    }
}

impl Valve for ContextValve {
    fn name(&self) -> &str {
        "context-valve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: &Next<'_>,
    ) -> Result<(), PipelineError> {
        let Some(context) = self.container.upgrade() else {
            send_error(response, 503);
            return Ok(());
        };

        let context_path = context.context_path().unwrap_or("");
        let relative = request
            .uri
            .strip_prefix(context_path)
            .filter(|rest| rest.starts_with('/') || rest.is_empty())
            .unwrap_or(&request.uri);
        let relative = if relative.is_empty() { "/" } else { relative };

        let wrapper = Self::map(&context, relative).and_then(|name| context.find_child(&name));

        match wrapper {
            Some(wrapper) => wrapper.invoke(request, response),
            None => {
                send_error(response, 404);
                Ok(())
            }
        }
    }
}

/// Wrapper basic valve: runs the request handler itself.
pub struct WrapperValve {
    container: Weak<Container>,
    log: logging::Logger,
}

impl WrapperValve {
    pub fn new(container: Weak<Container>, log: logging::Logger) -> WrapperValve {
        WrapperValve { container, log }
    }
}

impl Valve for WrapperValve {
    fn name(&self) -> &str {
        "wrapper-valve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: &Next<'_>,
    ) -> Result<(), PipelineError> {
        let Some(wrapper) = self.container.upgrade() else {
            send_error(response, 503);
            return Ok(());
        };

        let Some(handler) = wrapper.handler() else {
            send_error(response, 404);
            return Ok(());
        };

        match handler.handle(request, response) {
            Ok(()) => Ok(()),
            Err(PipelineError::IllegalState) => Err(PipelineError::IllegalState),
            Err(PipelineError::Handler(message)) => {
                logging::warn!(self.log, "request handler failed";
                               "uri" => %request.uri, "error" => %message);
                send_error(response, 500);
                Ok(())
            }
        }
    }
}

/// Per-request access logging. Wraps the rest of the chain and records
/// the outcome after downstream valves return.
pub struct AccessLogValve {
    log: logging::Logger,
}

impl AccessLogValve {
    pub fn new(log: logging::Logger) -> AccessLogValve {
        AccessLogValve { log }
    }
}

impl Valve for AccessLogValve {
    fn name(&self) -> &str {
        "access-log"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        next: &Next<'_>,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let result = next.invoke(request, response);

        logging::info!(self.log, "access";
                       "remote" => request.remote_addr.map(|addr| addr.to_string()),
                       "method" => %request.method,
                       "uri" => %request.uri,
                       "query" => %request.query,
                       "status" => response.status(),
                       "bytes" => response.body_len(),
                       "millis" => started.elapsed().as_millis() as u64);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::RequestHandler;

    struct TagHandler(&'static str);

    impl RequestHandler for TagHandler {
        fn handle(&self, _request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
            response.write(self.0.as_bytes())?;
            Ok(())
        }
    }

    struct FailingHandler;

    impl RequestHandler for FailingHandler {
        fn handle(&self, _request: &mut Request, _response: &mut Response) -> Result<(), PipelineError> {
            Err(PipelineError::Handler("boom".to_string()))
        }
    }

    fn tree() -> Arc<Container> {
        let engine = Container::new_engine("engine", "localhost", None);
        let host = Container::new_host("localhost", None);
        let context = Container::new_context("", None);

        context
            .add_child(Container::new_wrapper("hello", Arc::new(TagHandler("hello")), None))
            .unwrap();
        context
            .add_child(Container::new_wrapper("files", Arc::new(TagHandler("files")), None))
            .unwrap();
        context
            .add_child(Container::new_wrapper("jsp", Arc::new(TagHandler("jsp")), None))
            .unwrap();
        context
            .add_child(Container::new_wrapper("default", Arc::new(TagHandler("default")), None))
            .unwrap();

        context.add_servlet_mapping("/hello", "hello");
        context.add_servlet_mapping("/files/*", "files");
        context.add_servlet_mapping("*.jsp", "jsp");
        context.add_servlet_mapping("/", "default");

        host.add_child(context).unwrap();
        engine.add_child(host).unwrap();
        engine
    }

    fn dispatch(engine: &Arc<Container>, host: &str, uri: &str) -> (u16, Vec<u8>) {
        let mut request = Request::new();
        request.method = "GET".to_string();
        request.uri = uri.to_string();
        request.protocol = "HTTP/1.1".to_string();
        request
            .headers
            .add("host".to_string(), host.as_bytes().to_vec());

        let mut response = Response::new();
        engine.invoke(&mut request, &mut response).unwrap();

        (response.status(), response.body().to_vec())
    }

    #[test]
    fn test_exact_mapping() {
        let engine = tree();
        assert_eq!(dispatch(&engine, "localhost", "/hello"), (200, b"hello".to_vec()));
    }

    #[test]
    fn test_prefix_mapping() {
        let engine = tree();
        assert_eq!(
            dispatch(&engine, "localhost", "/files/a/b.txt"),
            (200, b"files".to_vec())
        );
    }

    #[test]
    fn test_extension_mapping() {
        let engine = tree();
        assert_eq!(
            dispatch(&engine, "localhost", "/pages/index.jsp"),
            (200, b"jsp".to_vec())
        );
    }

    #[test]
    fn test_default_mapping() {
        let engine = tree();
        assert_eq!(
            dispatch(&engine, "localhost", "/anything/else"),
            (200, b"default".to_vec())
        );
    }

    #[test]
    fn test_unknown_host_falls_back_to_default() {
        let engine = tree();
        assert_eq!(
            dispatch(&engine, "unknown.example", "/hello"),
            (200, b"hello".to_vec())
        );
    }

    #[test]
    fn test_longest_context_wins() {
        let engine = Container::new_engine("engine", "localhost", None);
        let host = Container::new_host("localhost", None);

        let root = Container::new_context("", None);
        root.add_child(Container::new_wrapper("d", Arc::new(TagHandler("root")), None))
            .unwrap();
        root.add_servlet_mapping("/", "d");

        let app = Container::new_context("/app", None);
        app.add_child(Container::new_wrapper("d", Arc::new(TagHandler("app")), None))
            .unwrap();
        app.add_servlet_mapping("/", "d");

        host.add_child(root).unwrap();
        host.add_child(app).unwrap();
        engine.add_child(host).unwrap();

        assert_eq!(dispatch(&engine, "localhost", "/app/x").1, b"app".to_vec());
        assert_eq!(dispatch(&engine, "localhost", "/other").1, b"root".to_vec());
        // "/apple" must not match the "/app" context.
        assert_eq!(dispatch(&engine, "localhost", "/apple").1, b"root".to_vec());
    }

    #[test]
    fn test_handler_failure_yields_500() {
        let engine = Container::new_engine("engine", "localhost", None);
        let host = Container::new_host("localhost", None);
        let context = Container::new_context("", None);

        context
            .add_child(Container::new_wrapper("bad", Arc::new(FailingHandler), None))
            .unwrap();
        context.add_servlet_mapping("/", "bad");

        host.add_child(context).unwrap();
        engine.add_child(host).unwrap();

        let (status, _) = dispatch(&engine, "localhost", "/x");
        assert_eq!(status, 500);
    }

    #[test]
    fn test_no_context_404() {
        let engine = Container::new_engine("engine", "localhost", None);
        let host = Container::new_host("localhost", None);
        host.add_child(Container::new_context("/only", None)).unwrap();
        engine.add_child(host).unwrap();

        let (status, _) = dispatch(&engine, "localhost", "/elsewhere");
        assert_eq!(status, 404);
    }

    #[test]
    fn test_access_log_passes_through() {
        let engine = tree();
        engine.add_valve(Arc::new(AccessLogValve::new(logging::null_logger())));

        assert_eq!(dispatch(&engine, "localhost", "/hello").0, 200);
    }
}
