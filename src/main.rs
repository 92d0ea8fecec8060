use field_telemetry::client::{CollaboratorClient, FeedbackSender};
use field_telemetry::config::{self, Config};
use field_telemetry::services::chat::ChatDesk;
use field_telemetry::services::fanout::{Notification, Topic};
use field_telemetry::services::responder::StatusResponder;
use field_telemetry::services::router::EventRouter;
use field_telemetry::services::store::{FieldFilter, FieldStateStore};
use field_telemetry::services::subscription::Subscription;
use field_telemetry::services::transport::TcpLineTransport;
use log::{debug, error, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    applied: usize,
}

/// Subscribers that turn every notification kind into log lines.
fn attach_log_sinks(router: &EventRouter) -> Vec<Subscription> {
    vec![
        router.subscribe(Topic::Status, |n| {
            if let Notification::Status(status) = n {
                info!("Link status: {}", status);
            }
        }),
        router.subscribe(Topic::Fields(FieldFilter::All), |n| {
            if let Notification::Field(state) = n {
                debug!(
                    "Field {} at revision {}: {} sensor(s), battery {}",
                    state.field_id,
                    state.revision,
                    state.readings.len(),
                    state
                        .battery_level
                        .map(|b| format!("{}%", b))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }),
        router.subscribe(Topic::Recommendations, |n| {
            if let Notification::Recommendation(rec) = n {
                info!("{}", rec.notification_text());
            }
        }),
        router.subscribe(Topic::Diagnostics, |n| {
            if let Notification::Diagnostic(d) = n {
                debug!("Diagnostic {:?} excerpt: {}", d.kind, d.excerpt.as_deref().unwrap_or("-"));
            }
        }),
        router.subscribe(Topic::Alerts, |n| {
            if let Notification::Alert(alert) = n {
                info!("Operator alert: {}", alert.message());
            }
        }),
    ]
}

/// Reads operator questions from stdin. `@field question` targets a specific field.
fn spawn_operator_chat(desk: ChatDesk, default_field: String) -> Result<(), String> {
    thread::Builder::new()
        .name("operator-chat".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("Operator input closed: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (field, question) = match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
                    Some((field, question)) => (field, question.trim()),
                    None => (default_field.as_str(), line),
                };
                match desk.ask(field, question) {
                    Ok(reply) => println!("{}", reply.text()),
                    Err(e) => warn!("Chat: {}", e),
                }
            }
            debug!("Operator chat finished");
        })
        .map(|_| ())
        .map_err(|e| format!("could not start operator chat: {}", e))
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (stream={}, collaborator={}, default_field={}, mapped_devices={}, aliases={}, ranges_file={}, reconnect={}..{}ms)",
        cfg.stream_addr,
        cfg.collaborator_base_url,
        cfg.default_field_id,
        cfg.device_fields.len(),
        cfg.sensor_aliases.len(),
        cfg.ranges_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.reconnect_initial.as_millis(),
        cfg.reconnect_max.as_millis()
    );

    // 2) Range table
    let ranges = Arc::new(cfg.load_ranges()?);

    // 3) Pipeline
    let store = FieldStateStore::new();
    let router = EventRouter::new(store, cfg.router_settings(Arc::clone(&ranges)));
    let _sinks = attach_log_sinks(&router);

    // 4) Collaborator + operator chat
    let sender = FeedbackSender::start(CollaboratorClient::new(&cfg.collaborator_base_url, cfg.http_timeout))
        .map_err(|e| format!("could not start collaborator sender: {}", e))?;
    let desk = ChatDesk::attach(&router, Box::new(StatusResponder::new(ranges)), Arc::new(sender));
    spawn_operator_chat(desk, cfg.default_field_id.to_string())?;

    // 5) Connection loop; runs until the process is terminated
    let transport = TcpLineTransport::new(&cfg.stream_addr, cfg.stream_connect_timeout, cfg.read_poll);
    let handle = router
        .start(Box::new(transport))
        .map_err(|e| format!("could not start event router: {}", e))?;
    handle.wait();

    Ok(())
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            args.next().ok_or_else(|| "`--env-file` requires a path argument".to_string())?
        } else if let Some(p) = arg.strip_prefix("--env-file=") {
            p.to_string()
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        if path.is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if env_file.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match env_file {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => (path, true),
        None => {
            let path = PathBuf::from(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };
    let applied = config::load_env_file(&path)?;
    Ok(Some(LoadedEnvFile {
        path,
        explicit,
        applied,
    }))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            info.path.display(),
            info.applied
        );
    }

    info!(
        "field-telemetry {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
