use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use yuebridge::{
    BridgeController, CheckConfig, ControllerConfig, Diagnostic, DiagnosticsSink, FrameStyle,
    SessionConfig, Severity, WorkerConfig,
};

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: yue-check <file.yue> [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker <script>       Checker entry script [default: check.lua]");
            eprintln!("  --executable <name>     Lua runtime executable [default: yue]");
            eprintln!("  --config <file>         Project config file forwarded to the checker");
            eprintln!("  --frame-style <style>   Wire framing: ndjson or content-length [default: ndjson]");
            eprintln!("  --timeout <secs>        Reply timeout [default: 30]");
            process::exit(2);
        }
    };

    match run(options) {
        Ok(clean) => process::exit(if clean { 0 } else { 1 }),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    }
}

struct Options {
    file: PathBuf,
    worker: PathBuf,
    executable: String,
    config: Option<PathBuf>,
    frame_style: FrameStyle,
    timeout: Duration,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut file: Option<PathBuf> = None;
    let mut worker = PathBuf::from("check.lua");
    let mut executable = "yue".to_string();
    let mut config: Option<PathBuf> = None;
    let mut frame_style = FrameStyle::NdJson;
    let mut timeout = Duration::from_secs(30);

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                worker = PathBuf::from(args.get(i).ok_or("--worker requires a value")?);
            }
            "--executable" => {
                i += 1;
                executable = args.get(i).ok_or("--executable requires a value")?.clone();
            }
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i).ok_or("--config requires a value")?,
                ));
            }
            "--frame-style" => {
                i += 1;
                frame_style = match args.get(i).map(String::as_str) {
                    Some("ndjson") => FrameStyle::NdJson,
                    Some("content-length") => FrameStyle::ContentLength,
                    Some(other) => return Err(format!("unknown frame style: {other}")),
                    None => return Err("--frame-style requires a value".to_string()),
                };
            }
            "--timeout" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .ok_or("--timeout requires a value")?
                    .parse()
                    .map_err(|_| "--timeout expects a number of seconds")?;
                timeout = Duration::from_secs(secs);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if file.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                file = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    Ok(Options {
        file: file.ok_or("missing input file")?,
        worker,
        executable,
        config,
        frame_style,
        timeout,
    })
}

/// Run one check. `Ok(true)` means the file is clean.
fn run(options: Options) -> anyhow::Result<bool> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(check_once(options))
}

async fn check_once(options: Options) -> anyhow::Result<bool> {
    let source = std::fs::read_to_string(&options.file)?;
    let uri = options.file.display().to_string();

    let mut controller_config = ControllerConfig::new(
        WorkerConfig::new(&options.worker).with_executable(&options.executable),
    )
    .with_session(SessionConfig {
        frame_style: options.frame_style,
        reply_timeout: Some(options.timeout),
        ..SessionConfig::default()
    });

    if let Some(path) = &options.config {
        let content = std::fs::read_to_string(path)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."))
            .display()
            .to_string();
        controller_config = controller_config.with_check_config(CheckConfig { content, dir });
    }

    let sink = Arc::new(PrintSink::default());
    let mut controller =
        BridgeController::new(controller_config, Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);

    controller.start().await?;
    controller.text_saved(&uri, &source).await;
    controller.stop().await;

    Ok(!sink.found_problems.load(Ordering::SeqCst))
}

/// Prints diagnostics in `file:line:col: severity: message` form.
#[derive(Default)]
struct PrintSink {
    found_problems: AtomicBool,
}

#[async_trait]
impl DiagnosticsSink for PrintSink {
    async fn set_diagnostics(&self, uri: &str, diagnostics: Vec<Diagnostic>) {
        self.found_problems.store(true, Ordering::SeqCst);
        for d in &diagnostics {
            let label = match d.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            println!(
                "{uri}:{}:{}: {label}: {}",
                d.range.start.line + 1,
                d.range.start.character + 1,
                d.message
            );
        }
    }

    async fn clear_diagnostics(&self, _uri: &str) {}

    async fn notify_error(&self, message: &str) {
        eprintln!("{message}");
    }
}

fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new("yuebridge=warn"),
    };
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    let _ = subscriber.try_init();
}
