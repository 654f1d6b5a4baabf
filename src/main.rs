use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use split_delivery::core::catalog::SplitCatalog;
use split_delivery::core::config::{EngineSettings, FileConfigProvider};
use split_delivery::core::engine::Engine;
use split_delivery::core::events::EngineEvent;
use split_delivery::core::model::{InstallRequest, SessionStatus};
use split_delivery::plugins::archive::extractor::ZipExtractor;
use split_delivery::plugins::http::driver::HttpDownloadClient;
use split_delivery::plugins::installer::committer::DirectoryCommitter;
use split_delivery::plugins::installer::session::SessionInstaller;
use split_delivery::plugins::registry::{CliConfig, CliPlugin, DriverContext, PluginRegistry};
use split_delivery::plugins::runtime::patcher::CatalogPatcher;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn common_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("config")
            .long("config")
            .help("Delivery configuration (JSON), re-read for every request")
            .required(true)
            .num_args(1),
    )
    .arg(
        Arg::new("module")
            .long("module")
            .short('m')
            .help("Feature module (repeatable)")
            .action(ArgAction::Append)
            .num_args(1),
    )
    .arg(
        Arg::new("language")
            .long("language")
            .short('l')
            .help("Language, e.g. fr or fr-CA (repeatable)")
            .action(ArgAction::Append)
            .num_args(1),
    )
    .arg(
        Arg::new("install_time")
            .long("install-time")
            .help("Module shipped with the base (repeatable)")
            .action(ArgAction::Append)
            .num_args(1),
    )
    .arg(
        Arg::new("on_demand")
            .long("on-demand")
            .help("Module delivered on demand (repeatable)")
            .action(ArgAction::Append)
            .num_args(1),
    )
    .arg(
        Arg::new("installed")
            .long("installed")
            .help("On-demand module already installed (repeatable)")
            .action(ArgAction::Append)
            .num_args(1),
    )
    .arg(
        Arg::new("staging_dir")
            .long("staging-dir")
            .help("Scratch directory for archives and extracted artifacts")
            .num_args(1),
    )
}

fn build_cli(plugins: &[Box<dyn CliPlugin>]) -> Command {
    let install = common_args(Command::new("install").about("Download and install feature modules"))
        .arg(
            Arg::new("include_missing")
                .long("include-missing")
                .help("Also fetch base splits missing from this device")
                .action(ArgAction::SetTrue),
        );
    let uninstall = common_args(Command::new("uninstall").about("Remove installed feature modules"));

    Command::new("split-delivery")
        .about("On-demand feature module delivery client")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(PluginRegistry::augment_command(plugins, install))
        .subcommand(PluginRegistry::augment_command(plugins, uninstall))
}

fn values(m: &ArgMatches, id: &str) -> Vec<String> {
    m.get_many::<String>(id)
        .map(|v| v.cloned().collect())
        .unwrap_or_default()
}

/// `RUST_LOG` directives when set and valid, `info` otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn ask(prompt: String) -> bool {
    print!("{} [y/N] ", prompt);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let cli_plugins = PluginRegistry::default_cli_plugins();
    let matches = build_cli(&cli_plugins).get_matches();
    let (uninstall, m) = match matches.subcommand() {
        Some(("install", m)) => (false, m),
        Some(("uninstall", m)) => (true, m),
        _ => return Ok(()),
    };

    let mut cfg = CliConfig {
        driver_ctx: DriverContext::default(),
        install_dir: PathBuf::from("./splits"),
        require_confirmation: false,
        auto_confirm: false,
    };
    PluginRegistry::apply_matches(&cli_plugins, m, &mut cfg)?;

    let mut settings = EngineSettings::default();
    if let Some(dir) = m.get_one::<String>("staging_dir") {
        settings = settings.with_staging_dir(dir);
    }

    let catalog = Arc::new(
        SplitCatalog::new(values(m, "install_time"), values(m, "on_demand"))
            .with_installed_modules(values(m, "installed")),
    );
    let installer =
        SessionInstaller::new(DirectoryCommitter::new(&cfg.install_dir).with_confirmation(cfg.require_confirmation));
    let plugins = PluginRegistry::new(
        Arc::new(HttpDownloadClient::new(cfg.driver_ctx.clone())?),
        Arc::new(ZipExtractor::new()),
        Arc::new(installer),
        Arc::new(CatalogPatcher::new(catalog.clone()).with_install_dir(&cfg.install_dir)),
    );

    let config_path = m.get_one::<String>("config").context("--config is required")?;
    let engine = Engine::new(
        Arc::new(FileConfigProvider::new(config_path)),
        plugins,
        catalog,
        settings,
    );

    let languages = values(m, "language");
    let request = InstallRequest::builder()
        .modules(values(m, "module"))
        .languages(languages.iter().map(String::as_str))
        .uninstall(uninstall)
        .include_missing_base_splits(!uninstall && m.get_flag("include_missing"))
        .build();

    let sty_spin = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")?.tick_chars("|/-\\ ");
    let sty_bar = ProgressStyle::with_template(
        "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
    )?;

    let mut rx = engine.subscribe();
    let task = match engine.prepare(request)? {
        Some(t) => t,
        None => {
            println!("Nothing to do: request already satisfied");
            return Ok(());
        }
    };
    let auto_confirm = cfg.auto_confirm;
    let ui_engine = engine.clone();
    let ui_task = tokio::spawn(async move {
        let mp = MultiProgress::new();
        let pb = mp.add(ProgressBar::new_spinner());
        pb.set_style(sty_spin.clone());
        pb.enable_steady_tick(std::time::Duration::from_millis(120));

        loop {
            let evt = match rx.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            match evt {
                EngineEvent::SessionUpdated(state) => {
                    pb.set_prefix(format!("[session {}]", state.session_id()));
                    match state.status() {
                        SessionStatus::Downloading | SessionStatus::Canceling => {
                            let total = state.total_bytes_to_download();
                            if pb.length().unwrap_or(0) != total {
                                pb.set_style(sty_bar.clone());
                                pb.set_length(total);
                            }
                            pb.set_position(state.bytes_downloaded().min(total));
                            pb.set_message(state.status().to_string());
                        }
                        SessionStatus::RequiresUserConfirmation => {
                            pb.set_message("waiting for confirmation");
                            let engine = ui_engine.clone();
                            let id = state.session_id();
                            let prompt = format!("Commit modules {:?}?", state.modules());
                            tokio::spawn(async move {
                                let approved = auto_confirm
                                    || tokio::task::spawn_blocking(move || ask(prompt)).await.unwrap_or(false);
                                if let Err(e) = engine.confirm_install(id, approved) {
                                    warn!(session_id = id, error = %e, "confirmation not delivered");
                                }
                            });
                        }
                        s if s.is_terminal() => {
                            pb.finish_with_message(format!("{} ({})", s, state.error_code()));
                            break;
                        }
                        s => {
                            pb.set_style(sty_spin.clone());
                            pb.set_message(s.to_string());
                        }
                    }
                }
                EngineEvent::Error { scope, message } => {
                    let _ = mp.println(format!("[ERR] {}: {}", scope, message));
                }
                EngineEvent::Info { scope, message } => {
                    let _ = mp.println(format!("[INFO] {}: {}", scope, message));
                }
            }
        }
    });

    task.start();
    let session_id = task.accepted().await?;
    println!("Session started: {}", session_id);

    task.wait().await;
    let _ = ui_task.await;
    engine.shutdown();

    let result = task.result();
    let state = task.state();
    println!(
        "Session {} finished: {} ({} / {})",
        state.session_id(),
        state.status(),
        fmt_bytes(state.bytes_downloaded()),
        fmt_bytes(state.total_bytes_to_download()),
    );
    result?;
    Ok(())
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
