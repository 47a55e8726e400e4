// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use rally_fetch::config::Config;
use rally_fetch::storage::{CancelRequest, GetRequest};
use rally_fetch::{FetchResult, Supervisor, SupervisorHandle, TransferStatus};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "rally-fetch")]
#[command(author = "rally-fetch contributors")]
#[command(version = VERSION)]
#[command(about = "Resumable, multi-mirror, segmented downloader for large immutable artifacts.")]
struct Cli {
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short = 'v', long)]
    verbose: bool,

    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch an artifact, resuming any partial transfer found on disk.
    Get {
        url: String,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        expected_size: Option<u64>,
        #[arg(long)]
        no_wait: bool,
        /// Give up waiting after this many seconds; the transfer keeps
        /// running in the background.
        #[arg(long)]
        deadline_secs: Option<f64>,
    },
    /// Cancel a tracked transfer by its destination path.
    Cancel { path: String },
    /// Print the status of one tracked transfer, or all of them.
    Status { path: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if cli.json {
        config.logging.json = true;
    }
    config.validate().context("invalid configuration")?;

    rally_fetch::logging::init(&config.logging);

    let supervisor = Supervisor::spawn(config).context("starting supervisor")?;

    let exit_code = match cli.command {
        Command::Get {
            url,
            path,
            expected_size,
            no_wait,
            deadline_secs,
        } => {
            let wait = !no_wait;
            let watch_path = path.clone();
            let request = GetRequest {
                url,
                path,
                expected_size,
                wait,
                deadline_secs,
            };

            let get_future = supervisor.get(request);
            let result = if wait && !cli.json {
                run_with_progress(&supervisor, watch_path, get_future).await
            } else {
                get_future.await
            };

            match result {
                Ok(status) => {
                    print_status(&status, cli.json);
                    if status.finished {
                        0
                    } else {
                        1
                    }
                }
                Err(e) => {
                    eprintln!("{} {}", style("error:").red().bold(), e);
                    1
                }
            }
        }
        Command::Cancel { path } => match supervisor.cancel(CancelRequest { path }).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                1
            }
        },
        Command::Status { path } => {
            let single = path.is_some();
            let statuses = supervisor.status(path).await;
            if statuses.is_empty() {
                println!("{}", style("no tracked transfers").dim());
            } else if cli.json {
                for status in &statuses {
                    print_status(status, true);
                }
            } else if single {
                print_status(&statuses[0], false);
            } else {
                print_status_table(&statuses);
            }
            0
        }
    };

    supervisor.exit().await;
    std::process::exit(exit_code);
}

/// Drives `get_future` to completion while keeping a spinner/progress bar
/// current. Subscribes to the transfer's `watch::Receiver` when a destination
/// path is known up front, so updates land as soon as they're published
/// rather than on a fixed poll period; falls back to polling `status()` when
/// no path was given (the transfer's canonical path isn't known client-side
/// until the supervisor derives it). Only used for the interactive, non-JSON
/// terminal case.
async fn run_with_progress(
    supervisor: &SupervisorHandle,
    watch_path: Option<String>,
    get_future: impl Future<Output = FetchResult<TransferStatus>>,
) -> FetchResult<TransferStatus> {
    let bar = ProgressBar::new(100);
    if let Ok(bar_style) = ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {percent}%") {
        bar.set_style(bar_style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));

    tokio::pin!(get_future);

    let watcher = match &watch_path {
        Some(path) => supervisor.watch(path.clone()).await,
        None => None,
    };

    let result = match watcher {
        Some(mut receiver) => loop {
            tokio::select! {
                result = &mut get_future => break result,
                changed = receiver.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let status = receiver.borrow().clone();
                    bar.set_message(status.path.clone());
                    if let Some(progress) = status.progress {
                        bar.set_position((progress * 100.0) as u64);
                    }
                }
            }
        },
        None => {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    result = &mut get_future => break result,
                    _ = ticker.tick() => {
                        let statuses = supervisor.status(watch_path.clone()).await;
                        if let Some(status) = statuses.first() {
                            bar.set_message(status.path.clone());
                            if let Some(progress) = status.progress {
                                bar.set_position((progress * 100.0) as u64);
                            }
                        }
                    }
                }
            }
        }
    };

    bar.finish_and_clear();
    result
}

fn print_status_table(statuses: &[TransferStatus]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["path", "state", "progress", "size", "speed"]);

    for status in statuses {
        let progress = status
            .progress
            .map(|p| format!("{:.1}%", p * 100.0))
            .unwrap_or_else(|| "unknown".to_string());
        let speed = status
            .average_speed_bytes_per_sec
            .map(|s| format!("{}/s", format_bytes(s as u64)))
            .unwrap_or_else(|| "-".to_string());
        let size = status.size.map(format_bytes).unwrap_or_else(|| "?".to_string());
        let (state, color) = if status.finished {
            ("done", Color::Green)
        } else {
            ("active", Color::Yellow)
        };

        table.add_row(vec![
            Cell::new(&status.path),
            Cell::new(state).fg(color),
            Cell::new(progress),
            Cell::new(size),
            Cell::new(speed),
        ]);
    }

    println!("{table}");
}

fn print_status(status: &TransferStatus, json: bool) {
    if json {
        match serde_json::to_string(status) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("{} {}", style("error:").red().bold(), e),
        }
        return;
    }

    let progress = status
        .progress
        .map(|p| format!("{:.1}%", p * 100.0))
        .unwrap_or_else(|| "unknown".to_string());
    let speed = status
        .average_speed_bytes_per_sec
        .map(|s| format!("{}/s", format_bytes(s as u64)))
        .unwrap_or_else(|| "-".to_string());

    let marker = if status.finished {
        style("done").green()
    } else {
        style("active").yellow()
    };

    println!(
        "{} {} [{}] {} ({})",
        marker,
        status.path,
        progress,
        status
            .size
            .map(format_bytes)
            .unwrap_or_else(|| "?".to_string()),
        speed
    );
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
