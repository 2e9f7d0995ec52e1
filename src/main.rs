use bucket_sync::core::{FileOutcome, SyncReport};
use bucket_sync::{logging, DefaultConnector, SkipReason, SyncConfiguration, SyncCoordinator};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// 将本地目录单向同步到对象存储桶
#[derive(Debug, Parser)]
#[command(name = "bucket-sync", version, about)]
struct Args {
    /// JSON 配置文件
    #[arg(short, long, env = "BUCKET_SYNC_CONFIG")]
    config: PathBuf,

    /// 只比较，不上传
    #[arg(long)]
    dry_run: bool,

    /// 以 JSON 输出报告
    #[arg(long)]
    json: bool,

    /// 覆盖配置中的远程路径前缀
    #[arg(long)]
    prefix: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match SyncConfiguration::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {:#}", e);
            return ExitCode::from(2);
        }
    };

    if let Some(prefix) = args.prefix {
        config.prefix = prefix;
    }

    if let Err(e) = logging::init(&config.log) {
        eprintln!("failed to initialize file logging: {}", e);
    }

    let coordinator =
        SyncCoordinator::new(config, Arc::new(DefaultConnector)).with_dry_run(args.dry_run);

    // Ctrl-C 在文件边界取消
    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，正在取消同步...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = match coordinator.run(None).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("sync failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("failed to serialize report: {}", e),
        }
    } else {
        print_report(&report);
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_report(report: &SyncReport) {
    for directory in &report.directories {
        println!("{} -> {}", directory.root, directory.root_name);
        if let Some(ref e) = directory.error {
            println!("  error: {}", e);
        }
        for outcome in &directory.files {
            match outcome {
                FileOutcome::Uploaded { key, bytes, .. } => {
                    println!("  uploaded {} ({} bytes)", key, bytes)
                }
                FileOutcome::Planned { key, .. } => println!("  would upload {}", key),
                FileOutcome::Skipped { path, reason } => {
                    println!("  skipped {} ({})", path, reason)
                }
                FileOutcome::Failed { key, error, .. } => println!("  failed {}: {}", key, error),
                FileOutcome::Cancelled { key, .. } => println!("  cancelled {}", key),
            }
        }
    }

    println!(
        "scanned {}, uploaded {} ({} bytes), skipped {} matching / {} vanished, failed {}",
        report.files_scanned,
        report.files_uploaded,
        report.bytes_uploaded,
        report.skipped(SkipReason::MatchesRemote),
        report.skipped(SkipReason::VanishedLocally),
        report.files_failed
    );
    if report.files_cancelled > 0 {
        println!("cancelled: {} files not uploaded", report.files_cancelled);
    }
    if report.files_planned > 0 {
        println!("dry run: {} files would be uploaded", report.files_planned);
    }
}
