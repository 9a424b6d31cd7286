//! overlay-dht - Main entry point
//!
//! Runs a DHT node: binds, bootstraps, optionally stores or looks up a value,
//! and reports status until interrupted.

use anyhow::{Context, Result};
use overlay_dht::{CliArgs, Config, Dht, DhtValueType, StatusDisplay};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("overlay-dht starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Failed to build configuration")?;
    config.validate().context("Invalid configuration")?;

    let status_display = StatusDisplay::new(config.is_quiet());
    let dht = Dht::bind(config.bind, config.settings.clone())
        .await
        .context("Failed to start DHT node")?;

    let result = run_node(&dht, &config, &status_display).await;
    dht.shutdown().await;

    if let Err(e) = &result {
        error!("Node failed: {:#}", e);
        status_display.print_error(&format!("{:#}", e))?;
    }
    let elapsed = StatusDisplay::format_duration(status_display.elapsed());
    info!("overlay-dht finished after {}", elapsed);
    result
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level: {:?}", level);
}

/// Bootstrap, run the requested operations, then serve until Ctrl-C
async fn run_node(dht: &Dht, config: &Config, status_display: &StatusDisplay) -> Result<()> {
    dht.on_ready_state_changed(|ready| {
        if !ready {
            warn!("DHT node lost its connection to the network");
        }
    });

    let bootstrap = dht
        .bootstrap(config.seeds.clone())
        .await
        .context("Failed to bootstrap DHT")?;
    status_display.print_message(&format!(
        "Joined as {} with {} contacts",
        dht.local_id(),
        bootstrap.contacts
    ))?;

    if let Some((name, value)) = &config.put {
        let result = dht
            .submit_store(Config::key_for(name), DhtValueType::TEXT, value.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to store {}", name))?;
        status_display.print_store(name, &result)?;
    }

    if let Some(name) = &config.get {
        let result = dht
            .submit_find_value(Config::key_for(name), DhtValueType::ANY)
            .await
            .with_context(|| format!("Failed to look up {}", name))?;
        status_display.print_values(name, &result)?;
    }

    if config.once {
        return Ok(());
    }

    serve(dht, config, status_display).await
}

/// Report status periodically until Ctrl-C
async fn serve(dht: &Dht, config: &Config, status_display: &StatusDisplay) -> Result<()> {
    let Some(period) = config.status_interval() else {
        tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
        info!("Interrupted, shutting down");
        return Ok(());
    };

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = dht.status();
                info!("{}", StatusDisplay::format_summary(&status));
                status_display.print_status(&status)?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to wait for Ctrl-C")?;
                info!("Interrupted, shutting down");
                return Ok(());
            }
        }
    }
}
