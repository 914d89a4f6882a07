mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use procwatch::config::{self, AppSpec, GlobalSettings};
use procwatch::daemon;
use procwatch::manager::{self, WatchManager};

fn main() {
    let args = cli::Args::parse();

    // Initialize logger with custom format for daemon
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(args.log_level())
        .parse_default_env()
        .init();

    if let Err(e) = real_main(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn real_main(args: cli::Args) -> Result<()> {
    let cfg_path = args.config_file.clone();
    let (settings, apps) = config::load(&args.overrides(), &cfg_path)
        .with_context(|| format!("Failed to load configuration from {}", cfg_path.display()))?;
    info!("Using config from: {}", cfg_path.display());

    if args.check_config {
        print_config(&settings, &apps);
        return Ok(());
    }

    // Detach first: forking is only sound while we are single-threaded.
    let _daemon = if settings.daemonize && !daemon::need_foreground() {
        Some(daemon::daemonise(&settings.pid_file, settings.log_file.as_deref())?)
    } else {
        None
    };

    let _signals = manager::install_signal_handlers()?;
    let mgr = WatchManager::new(&settings, apps)?;
    info!("procwatch started (pid {})", std::process::id());
    mgr.run()?;
    info!("procwatch exiting");
    Ok(())
}

fn print_config(settings: &GlobalSettings, apps: &[AppSpec]) {
    println!("config file:   {}", settings.config_path.display());
    println!("time lapse:    {}s", settings.poll_interval.as_secs());
    println!("probe timeout: {}s", settings.probe_timeout.as_secs());
    println!("daemonize:     {}", settings.daemonize);
    if settings.alert_recipients.is_empty() {
        println!("alerts:        log only");
    } else {
        println!("alerts:        {}", settings.alert_recipients.join(", "));
    }
    for app in apps {
        println!();
        println!("[{}]", app.name);
        println!("  process:  {}", app.process_name);
        println!(
            "  command:  {}",
            shell_words::join(std::iter::once(app.command.as_str()).chain(app.arguments.iter().map(String::as_str)))
        );
        println!(
            "  restarts: {} per {}s, {}s apart",
            app.max_restarts_per_window,
            app.restart_window.as_secs(),
            app.restart_cooldown.as_secs()
        );
    }
}
