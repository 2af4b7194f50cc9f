//! DataVault: encrypted health analytics from the command line.
//!
//! # Usage
//!
//! ```bash
//! datavault keys init|show|reset
//! datavault weights <kg>... [--from dd-mm-yyyy] [--to dd-mm-yyyy] [--local] [--timeout <secs>]
//! datavault sleep <dd-mm-yyyy> <level:start:end>... [--local] [--timeout <secs>]
//! datavault resume weight_stats|sleep_quality [--timeout <secs>]
//! datavault decrypt <file name> [--suffix <suffix>]
//! datavault files
//! ```
//!
//! Without `--local` tasks go to `DATAVAULT_SERVER_URL`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use datavault::adapters::fs_store::FsBlobStore;
use datavault::adapters::http::HttpComputeService;
use datavault::adapters::local::LocalComputeService;
use datavault::adapters::sanitize::SanitizingMakeWriter;
use datavault::application::{
    DecryptedValue, HealthService, KeyAuthority, TaskOrchestrator,
};
use datavault::domain::{
    is_valid_suffix, parse_day_suffix, unscale_weight, SleepLevel, SleepQuality, SleepSample,
    TaskFamily, UintKind, VaultFile,
};
use datavault::ports::{BlobStore, ComputeService};
use datavault::VaultConfig;

const USAGE: &str = "Usage:
  datavault keys init|show|reset
  datavault weights <kg>... [--from dd-mm-yyyy] [--to dd-mm-yyyy] [--local] [--timeout <secs>]
  datavault sleep <dd-mm-yyyy> <level:start:end>... [--local] [--timeout <secs>]
  datavault resume weight_stats|sleep_quality [--timeout <secs>]
  datavault decrypt <file name> [--suffix <suffix>]
  datavault files";

/// Commands that talk to a compute service.
enum TaskCommand {
    Weights {
        weights: Vec<f64>,
        from: NaiveDate,
        to: NaiveDate,
    },
    Sleep {
        night: NaiveDate,
        samples: Vec<SleepSample>,
    },
    Resume(TaskFamily),
}

enum Command {
    KeysInit,
    KeysShow,
    KeysReset,
    Decrypt {
        file: VaultFile,
        suffix: Option<String>,
    },
    Files,
    Task(TaskCommand),
}

struct Invocation {
    command: Command,
    local: bool,
    timeout: Option<Duration>,
}

fn flag_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{flag} needs a value"))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    parse_day_suffix(raw).ok_or_else(|| anyhow!("invalid date {raw:?}, expected dd-mm-yyyy"))
}

fn parse_sample(raw: &str) -> Result<SleepSample> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [level, start, end] = parts.as_slice() else {
        bail!("invalid sample {raw:?}, expected level:start:end");
    };
    let level = level
        .parse::<u8>()
        .ok()
        .and_then(SleepLevel::from_raw)
        .ok_or_else(|| anyhow!("invalid sleep level in {raw:?}"))?;
    Ok(SleepSample::new(level, start.parse()?, end.parse()?)?)
}

fn parse_args(args: Vec<String>) -> Result<Invocation> {
    let mut positional = Vec::new();
    let mut local = false;
    let mut timeout = None;
    let mut from = None;
    let mut to = None;
    let mut suffix = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--local" => local = true,
            "--timeout" => {
                timeout = Some(Duration::from_secs(flag_value(&mut args, &arg)?.parse()?));
            }
            "--from" => from = Some(parse_date(&flag_value(&mut args, &arg)?)?),
            "--to" => to = Some(parse_date(&flag_value(&mut args, &arg)?)?),
            "--suffix" => {
                let value = flag_value(&mut args, &arg)?;
                if !is_valid_suffix(&value) {
                    bail!("invalid suffix {value:?}: no path separators or `..`");
                }
                suffix = Some(value);
            }
            "-h" | "--help" => bail!("{USAGE}"),
            _ => positional.push(arg),
        }
    }

    let (verb, rest) = positional
        .split_first()
        .ok_or_else(|| anyhow!("{USAGE}"))?;
    let command = match (verb.as_str(), rest) {
        ("keys", [action]) => match action.as_str() {
            "init" => Command::KeysInit,
            "show" => Command::KeysShow,
            "reset" => Command::KeysReset,
            other => bail!("unknown keys action {other:?}\n{USAGE}"),
        },
        ("weights", values) if !values.is_empty() => {
            let today = chrono::Local::now().date_naive();
            Command::Task(TaskCommand::Weights {
                weights: values
                    .iter()
                    .map(|v| v.parse::<f64>().with_context(|| format!("invalid weight {v:?}")))
                    .collect::<Result<_>>()?,
                from: from.unwrap_or(today),
                to: to.unwrap_or(today),
            })
        }
        ("sleep", [night, samples @ ..]) if !samples.is_empty() => Command::Task(TaskCommand::Sleep {
            night: parse_date(night)?,
            samples: samples.iter().map(|s| parse_sample(s)).collect::<Result<_>>()?,
        }),
        ("resume", [family]) => Command::Task(TaskCommand::Resume(
            TaskFamily::from_name(family).ok_or_else(|| anyhow!("unknown task family {family:?}"))?,
        )),
        ("decrypt", [file]) => Command::Decrypt {
            file: VaultFile::from_name(file).ok_or_else(|| anyhow!("unknown file {file:?}"))?,
            suffix,
        },
        ("files", []) => Command::Files,
        _ => bail!("{USAGE}"),
    };

    Ok(Invocation {
        command,
        local,
        timeout,
    })
}

/// Completes on Ctrl-C or after `timeout`, whichever comes first.
async fn interrupted(timeout: Option<Duration>) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    match timeout {
        Some(timeout) => tokio::select! {
            () = ctrl_c => {}
            () = tokio::time::sleep(timeout) => {}
        },
        None => ctrl_c.await,
    }
}

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // Results go to stdout, so logs default to stderr.
    let log_mode = std::env::var("DATAVAULT_LOG_MODE").unwrap_or_else(|_| "stderr".to_string());

    let (writer, guard) = match log_mode.as_str() {
        "file" => {
            let log_file = std::env::var("DATAVAULT_LOG_FILE")
                .unwrap_or_else(|_| "./vault-data/datavault.log".to_string());
            if let Some(parent) = Path::new(&log_file).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("cannot open log file {log_file}"))?;
            tracing_appender::non_blocking(file)
        }
        "stdout" => tracing_appender::non_blocking(std::io::stdout()),
        _ => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();
    Ok(guard)
}

fn print_value(file: VaultFile, value: &DecryptedValue) {
    match value {
        DecryptedValue::Scalar { kind, value } => match file {
            VaultFile::SleepScore => match SleepQuality::from_score(*value) {
                Some(quality) => println!("{value} ({quality})"),
                None => println!("{value}"),
            },
            _ if *kind == UintKind::U16 => println!("{:.1} kg", unscale_weight(*value)),
            _ => println!("{value}"),
        },
        DecryptedValue::Array(values) => {
            let kg: Vec<String> = values
                .iter()
                .map(|&v| format!("{:.1}", unscale_weight(u32::from(v))))
                .collect();
            println!("[{}] kg", kg.join(", "));
        }
        DecryptedValue::SleepSamples(samples) => {
            for s in samples {
                println!("{:>4}-{:<4} {}", s.start, s.end, s.level.name());
            }
        }
    }
}

async fn run_task<C: ComputeService>(
    command: TaskCommand,
    local: bool,
    cancel: impl std::future::Future<Output = ()>,
    config: &VaultConfig,
    keys: Arc<KeyAuthority<FsBlobStore>>,
    store: Arc<FsBlobStore>,
    service: C,
) -> Result<()> {
    let mut orchestrator = TaskOrchestrator::new(Arc::new(service), Arc::clone(&store))
        .with_missing_status_policy(config.missing_status);
    if let Some(interval) = config.poll_interval {
        orchestrator = orchestrator.with_poll_interval(interval);
    }
    let orchestrator = Arc::new(orchestrator);
    let health = HealthService::new(Arc::clone(&keys), Arc::clone(&orchestrator), store);

    if local {
        // UIDs issued by a previous process mean nothing to this one.
        for family in TaskFamily::ALL {
            orchestrator.forget(family).await?;
        }
    }

    match command {
        TaskCommand::Weights { weights, from, to } => {
            let suffix = health.encrypt_weights(&weights, from, to)?;
            println!("Encrypted {} weights as {}", weights.len(), VaultFile::WeightList.file_name(Some(&suffix)));
            let summary = health.analyze_weights(cancel).await?;
            println!(
                "min {:.1} kg, max {:.1} kg, avg {:.1} kg",
                summary.min, summary.max, summary.avg
            );
        }
        TaskCommand::Sleep { night, samples } => {
            health.encrypt_night(night, &samples)?;
            let score = health.analyze_night(night, cancel).await?;
            match score.quality {
                Some(quality) => println!("Sleep score {} ({quality})", score.score),
                None => println!("Sleep score {}", score.score),
            }
        }
        TaskCommand::Resume(family) => {
            let body = orchestrator.resume(family, cancel).await?;
            println!("Fetched {} result bytes; rerun the task to store them", body.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging()?;
    let invocation = match parse_args(std::env::args().skip(1).collect()) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let config = VaultConfig::from_env();
    let store = Arc::new(FsBlobStore::new(&config.root));
    let keys = Arc::new(KeyAuthority::new(Arc::clone(&store), VaultConfig::key_password()?));
    tracing::debug!("Vault root {}", config.root.display());

    let command = match invocation.command {
        Command::KeysInit => {
            let fp = keys.ensure_keys_exist()?;
            println!("private  {}", fp.private);
            println!("public   {}", fp.public);
            println!("compute  {} ({} bytes)", fp.compute, fp.compute_size_bytes);
            return Ok(());
        }
        Command::KeysShow => {
            let fp = keys.fingerprints()?;
            println!("private  {}", fp.private);
            println!("public   {}", fp.public);
            println!("compute  {} ({} bytes)", fp.compute, fp.compute_size_bytes);
            return Ok(());
        }
        Command::KeysReset => {
            keys.reset()?;
            println!("All keys deleted");
            return Ok(());
        }
        Command::Decrypt { file, suffix } => {
            match keys.decrypt_file(file, suffix.as_deref())? {
                Some(value) => print_value(file, &value),
                None => bail!("nothing stored at {}", file.file_name(suffix.as_deref())),
            }
            return Ok(());
        }
        Command::Files => {
            for file in VaultFile::ALL {
                let plain = store.path_for(file, None);
                if plain.exists() {
                    println!("{}", plain.display());
                }
                for suffix in store.list_instances(file)? {
                    println!("{}", store.path_for(file, Some(&suffix)).display());
                }
            }
            return Ok(());
        }
        Command::Task(command) => command,
    };

    let cancel = interrupted(invocation.timeout);
    if invocation.local {
        let service = LocalComputeService::new();
        run_task(command, true, cancel, &config, keys, store, service).await
    } else {
        let url = config
            .server_url
            .clone()
            .context("DATAVAULT_SERVER_URL is not set (or pass --local)")?;
        let service = HttpComputeService::new(url, config.http_timeout)?;
        run_task(command, false, cancel, &config, keys, store, service).await
    }
}
