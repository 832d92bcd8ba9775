use tracing::{error, info, warn};

use scripthost::script::{CallArgs, FileStorage, NoBindings, ScriptRegistry};
use scripthost::Config;

fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    // Initialize logging
    if let Err(e) = scripthost::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        scripthost::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = run(&config) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> scripthost::Result<()> {
    config.validate()?;
    let settings = config.host_settings()?;

    info!("scripthost - Lua mod host");
    info!("Scripts folder: {}/{}", config.scripts.base_dir, config.scripts.root);

    let storage = FileStorage::new(&config.scripts.base_dir);
    let mut registry = ScriptRegistry::new(Box::new(storage), Box::new(NoBindings), settings);

    registry.restore_autoloads()?;
    let report = registry.scan(&config.scripts.root);
    for (file, reason) in &report.rejected {
        warn!("Skipped '{}': {}", file, reason);
    }

    let started = registry.dispatch_event("OnServerStart", &CallArgs::new());
    info!(
        "OnServerStart delivered to {} scripts ({} failed)",
        started.calls, started.faults
    );
    for summary in registry.scripts() {
        info!(
            "{} {} [{}]{}",
            summary.id,
            summary.filename,
            summary.state,
            summary
                .metadata
                .map(|m| format!(" {}", m))
                .unwrap_or_default()
        );
    }

    registry.dispatch_event("OnServerShutdown", &CallArgs::new());
    registry.shutdown()?;
    Ok(())
}
