use flue::logging;
use hearth::config::EndpointConfig;
use hearth::container::pipeline::PipelineError;
use hearth::container::valves::AccessLogValve;
use hearth::container::{Container, RequestHandler};
use hearth::http::processor::Http11ConnectionHandler;
use hearth::http::request::{Request, Response};
use hearth::lifecycle::Lifecycle;
use hearth::net::endpoint::Endpoint;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerConfig {
    /// sloggers TOML snippet; the default logs to stderr.
    logging: Option<String>,
    /// Virtual host name served by default.
    host: String,
    /// Serve files from this directory instead of the built-in handler.
    static_root: Option<PathBuf>,
    endpoint: EndpointConfig,
}

struct HelloHandler;

impl RequestHandler for HelloHandler {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        response.set_header("content-type", "text/plain")?;
        response.write(b"hearth: ")?;
        response.write(request.uri.as_bytes())?;
        response.write(b"\n")?;
        Ok(())
    }
}

/// Serves files below a root directory through the zero-copy send-file
/// path.
struct StaticHandler {
    root: PathBuf,
}

impl RequestHandler for StaticHandler {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        // Normalize and refuse traversal.
        let relative = request.uri.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            response.set_status(403)?;
            return Ok(());
        }

        let mut path = self.root.join(relative);
        if path.is_dir() {
            path = path.join("index.html");
        }

        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                response.set_header("content-type", content_type(&path))?;
                response.send_file(path, 0, meta.len())?;
                Ok(())
            }
            _ => {
                response.set_status(404)?;
                response.write(b"not found\n")?;
                Ok(())
            }
        }
    }
}

fn content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn load_config() -> ServerConfig {
    let path = std::env::args().nth(1);

    match path {
        Some(path) => match serdeconv::from_toml_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to read config {}: {}", path, err);
                std::process::exit(1);
            }
        },
        None => ServerConfig {
            host: "localhost".to_string(),
            ..ServerConfig::default()
        },
    }
}

fn main() {
    let mut config = load_config();
    if config.host.is_empty() {
        config.host = "localhost".to_string();
    }

    let log = match logging::root_logger(config.logging.as_deref()) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("failed to build logger: {:?}", err);
            std::process::exit(1);
        }
    };

    // Container tree: engine → host → root context → default wrapper.
    let engine = Container::new_engine("hearth", &config.host, &log);
    let host = Container::new_host(&config.host, &log);
    let context = Container::new_context("", &log);

    let handler: Arc<dyn RequestHandler> = match &config.static_root {
        Some(root) => Arc::new(StaticHandler { root: root.clone() }),
        None => Arc::new(HelloHandler),
    };

    context
        .add_child(Container::new_wrapper("default", handler, &log))
        .expect("Fresh context cannot have a duplicate child");
    context.add_servlet_mapping("/", "default");

    host.add_valve(Arc::new(AccessLogValve::new(
        log.new(logging::o!("log" => "access")),
    )));
    host.add_child(context).expect("Fresh host cannot have a duplicate child");
    engine.add_child(host).expect("Fresh engine cannot have a duplicate child");

    let http = Http11ConnectionHandler::new(Arc::clone(&engine), config.endpoint.clone(), &log);
    let endpoint = Endpoint::new(config.endpoint, Arc::new(http), &log);

    if let Err(err) = engine.init().and_then(|_| engine.start()) {
        logging::crit!(log, "container start failed"; "error" => ?err);
        std::process::exit(1);
    }

    if let Err(err) = endpoint.init().and_then(|_| endpoint.start()) {
        logging::crit!(log, "endpoint start failed"; "error" => ?err);
        std::process::exit(1);
    }

    logging::info!(log, "serving"; "address" => ?endpoint.local_addr());

    let handler_ptr = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler_ptr);
        libc::signal(libc::SIGTERM, handler_ptr);
    }

    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    logging::info!(log, "shutting down");

    if let Err(err) = endpoint.stop() {
        logging::warn!(log, "endpoint stop failed"; "error" => ?err);
    }
    let _ = endpoint.destroy();
    if let Err(err) = engine.stop() {
        logging::warn!(log, "container stop failed"; "error" => ?err);
    }
}
