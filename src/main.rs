/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: main.rs
 * Author: mingcheng <mingcheng@apache.org>
 * File Created: 2026-02-12 15:38:23
 *
 * Modified By: mingcheng <mingcheng@apache.org>
 * Last Modified: 2026-03-04 10:12:51
 */

mod config;
mod controller;
mod criteria;
mod imap_mailbox;
mod notifications;
mod passcode;
mod poll_loop;
mod processor;
mod relay;
mod telegram;
mod traits;

use clap::{Parser, Subcommand};
use crate::config::AppConfig;
use controller::{Controller, PipelineFactory, Supervisor};
use futures::FutureExt;
use log::{error, info, warn};
use rustls::crypto;
use std::io::Write;
use std::sync::Arc;
use telegram::TelegramClient;
use tokio_util::sync::CancellationToken;

struct MultiWriter {
    writers: Vec<Box<dyn Write + Send + 'static>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for w in &mut self.writers {
            let _ = w.write(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for w in &mut self.writers {
            let _ = w.flush();
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Poll the mailbox and relay passcodes (default)
    Run,
    /// Run the Telegram control bot, which supervises the relay
    Control,
}

fn initialize_logger(config: &AppConfig) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();

    if let Some(level) = &config.log_level {
        builder.parse_filters(level);
    } else if let Ok(env_level) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env_level);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }

    if let Some(log_file) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", log_file, e))?;

        if config.quiet {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        } else {
            let multi_writer = MultiWriter {
                writers: vec![Box::new(file), Box::new(std::io::stderr())],
            };
            builder.target(env_logger::Target::Pipe(Box::new(multi_writer)));
        }
    } else if config.quiet {
        builder.target(env_logger::Target::Pipe(Box::new(std::io::sink())));
    }

    builder.init();
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix, which is how supervisors stop us.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            error!("Unable to listen for shutdown signal: {}", err);
                        }
                        warn!("Shutdown signal received (Ctrl+C)");
                    }
                    _ = sigterm.recv() => warn!("Shutdown signal received (SIGTERM)"),
                }
                return;
            }
            Err(err) => error!("Unable to listen for SIGTERM: {}", err),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Shutdown signal received (Ctrl+C)"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
}

fn log_startup(config: &AppConfig) {
    // credentials stay out of the log
    info!(
        "IMAP server {}:{} as {} (tls: {}, mailbox: {})",
        config.mail.host,
        config.mail.port,
        config.mail.username,
        config.mail.use_tls,
        config.mail.mailbox
    );
    info!(
        "Relaying to {} chat(s): {}",
        config.telegram.chat_ids.len(),
        config.telegram.chat_ids.join(", ")
    );
    info!(
        "Senders: {} | Subject: {:?} | Passcode policy: {:?}",
        config.filter.senders.join(", "),
        config.filter.subject,
        config.passcode.match_policy
    );
    if config.polling.deploy_time_offset_minutes != 0 {
        info!(
            "Deploy time offset by {} minutes",
            config.polling.deploy_time_offset_minutes
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let config = match args.config {
        Some(path) => AppConfig::new_from_file(&path),
        None => AppConfig::new(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Failed to load config: {:?}", e);
        if let Ok(path) = std::env::current_dir() {
            eprintln!("Current search path: {:?}", path);
        }
        eprintln!("Please create a `config.toml` or set APP_... environment variables, or specify a config file with --config.");
        std::process::exit(1);
    });

    initialize_logger(&config)?;

    let config = Arc::new(config);
    let command = args.command.unwrap_or(Command::Run);

    info!("Starting OTP relay ({:?})...", command);
    log_startup(&config);

    let cancel = CancellationToken::new();
    let mut task = match command {
        Command::Run => tokio::spawn(relay::run_relay(config.clone(), cancel.clone())),
        Command::Control => {
            let pipeline_config = config.clone();
            let factory: PipelineFactory = Arc::new(move |token: CancellationToken| {
                relay::run_relay(pipeline_config.clone(), token).boxed()
            });

            let controller = Controller::new(
                TelegramClient::with_api_url(
                    config.controller_token().to_string(),
                    config.telegram.api_url.clone(),
                ),
                &config.controller.authorized_users,
                Supervisor::new(factory),
            );
            tokio::spawn(controller.run(cancel.clone()))
        }
    };

    let finished_early = tokio::select! {
        _ = shutdown_signal() => None,
        // the relay ends on its own only when its connection could not be set up
        result = &mut task => Some(result),
    };

    let result = match finished_early {
        Some(result) => result,
        None => {
            cancel.cancel();
            info!("Waiting for tasks to finish...");
            task.await
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("All tasks stopped. Goodbye!");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Fatal error: {:?}", e);
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("Task panicked: {}", e)),
    }
}
