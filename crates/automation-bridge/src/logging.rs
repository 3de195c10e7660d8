//! Subscriber setup for binaries embedding the bridge.

use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type OutputLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Initialize tracing with BRIDGE_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence over `BRIDGE_LOG`. Output goes to stderr.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(filter_directives(std::env::var("BRIDGE_LOG").ok().as_deref())),
    };
    let json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(output_layer(json))
        .try_init();
}

fn output_layer(json: bool) -> OutputLayer {
    let layer = fmt::layer().with_writer(std::io::stderr);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("automation_bridge={level}")
}
