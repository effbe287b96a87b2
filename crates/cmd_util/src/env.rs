use std::{
    env,
    fmt::Debug,
    fs::File,
    io,
    str::FromStr,
};

use tracing::Level;
use tracing_subscriber::{
    fmt::{
        format::format,
        MakeWriter,
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Typed environment override for a tunable, falling back to `default` when
/// the variable is unset or unparsable.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => {
            tracing::info!("Overriding {name} to {value:?} from environment");
            value
        },
        Err(e) => {
            tracing::warn!("Invalid value {raw} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Keeps the `TSDBCOPY_TRACE_FILE` writer thread alive; hold it for the
/// process lifetime.
pub struct TracingGuard {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Startup config for one-shot tools: errors only, on stderr.
pub fn config_tool() -> TracingGuard {
    config_tracing(io::stderr, Level::ERROR)
}

/// Startup config for commands that narrate progress: info and up, on stdout.
pub fn config_service() -> TracingGuard {
    config_tracing(io::stdout, Level::INFO)
}

fn config_tracing<W>(writer: W, level: Level) -> TracingGuard
where
    W: Send + Sync + for<'writer> MakeWriter<'writer> + 'static,
{
    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(env::var("NO_COLOR").is_err())
        .with_writer(writer);
    // LOG_FORMAT selects the event format; compact unless told otherwise.
    let console_layer = match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => console_layer.event_format(format().json()).boxed(),
        Ok("pretty") => console_layer.event_format(format().pretty()).boxed(),
        _ => console_layer.event_format(format().compact()).boxed(),
    };
    let console_layer = console_layer.with_filter(
        EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(level.as_str())),
    );

    let (file_layer, guard) = match trace_file() {
        Some(file) => {
            let (file_writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(EnvFilter::new("info,copier=debug"))
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
    TracingGuard { _guard: guard }
}

fn trace_file() -> Option<File> {
    env::var("TSDBCOPY_TRACE_FILE").ok()?;
    let exe_path = env::current_exe().expect("Couldn't find exe name");
    let exe_name = exe_path
        .file_name()
        .expect("Path was empty")
        .to_str()
        .expect("Not valid unicode");
    // e.g. `tsdbcopy.log`
    let filename = format!("{exe_name}.log");
    let file =
        File::create(&filename).unwrap_or_else(|_| panic!("Could not create file {filename}"));
    Some(file)
}

pub fn config_test() {
    // Try to initialize tracing_subscriber. Ok if it fails - probably means a
    // test in the same process got there first.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}
