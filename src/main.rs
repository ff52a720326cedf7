mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use devstack::clean::{CleanOutcome, clean_artifacts, format_size};
use devstack::config::{CONFIG_FILE, Config};
use devstack::console::{Console, ConsoleSink};
use devstack::health::HealthAggregator;
use devstack::prereq;
use devstack::process::{ProcessMatcher, ReapReport, SystemProcessTable};
use devstack::prompt::{FixedAnswer, ask};
use devstack::session::{Session, install_signal_handlers};
use devstack::supervisor::output::LineSink;
use devstack::supervisor::shutdown::StopKind;
use devstack::supervisor::{ServiceSupervisor, SessionOutcome};

fn main() {
    env_logger::Builder::from_default_env()
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
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = match rt.block_on(real_main()) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    // output readers may still sit in blocking reads; don't wait for them
    std::process::exit(code);
}

async fn real_main() -> Result<i32> {
    let args = cli::Args::parse();
    let console = Console::new(args.no_color);

    let cmd = args.sub.clone().unwrap_or(cli::Cmd::Start);
    if let cli::Cmd::Init { force } = cmd {
        return handle_init(&console, args.config.clone(), force);
    }

    let cfg = Config::load(args.config.as_deref())?;
    let session = build_session(&cfg, console, args.yes)?;

    match cmd {
        cli::Cmd::Start => handle_start(&cfg, &session, &console).await,
        cli::Cmd::Stop => handle_stop(&session, &console).await,
        cli::Cmd::Status => handle_status(&cfg, &session, &console).await,
        cli::Cmd::Clean => handle_clean(&cfg, &session, &console).await,
        cli::Cmd::Init { .. } => Ok(0),
    }
}

fn build_session(cfg: &Config, console: Console, yes: bool) -> Result<Session> {
    let matcher = ProcessMatcher::new(&cfg.patterns, Arc::new(SystemProcessTable))?;
    let sink: Arc<dyn LineSink> = Arc::new(ConsoleSink::new(console));
    let session = Session::new(matcher, sink, cfg.session_timings());
    Ok(if yes {
        session.with_prompter(Arc::new(FixedAnswer(true)))
    } else {
        session
    })
}

/// Launch everything, print one health report, then supervise.
async fn handle_start(cfg: &Config, session: &Session, console: &Console) -> Result<i32> {
    console.header("Checking Prerequisites");
    for tool in prereq::check_tools(&cfg.required_tools)? {
        console.success(&format!(
            "{}: {}",
            tool.name,
            tool.version.as_deref().unwrap_or("found")
        ));
    }
    prereq::check_service_dirs(cfg)?;
    let env = cfg.load_env()?;

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone())?;
    let supervisor = ServiceSupervisor::new(session, cancel.clone());
    supervisor.offer_stale_cleanup().await;

    console.header("Starting Services");
    let specs = cfg.service_specs(&env);
    for spec in &specs {
        console.info(&format!("{:8} → http://localhost:{}", spec.name, spec.readiness_port));
    }
    let group = supervisor.launch(specs).await?;

    if !cancel.is_cancelled() {
        let aggregator = HealthAggregator::new(&session.matcher, &session.ports, cfg.probe_timeout())
            .context("Failed to build HTTP client")?;
        aggregator
            .check_all(&cfg.service_endpoints(&env), cfg.dependency_endpoint(&env).as_ref())
            .await
            .render(console);
        console.info("Press Ctrl+C to stop all servers");
    }

    let summary = group.supervise().await;

    console.header("Shutdown");
    if let SessionOutcome::ServiceExited { service, code } = &summary.outcome {
        let code = code.map_or("signal".to_string(), |c| c.to_string());
        console.error(&format!("{service} exited on its own (code {code}); stopped the rest"));
    }
    for (name, kind) in &summary.stops {
        match kind {
            StopKind::Graceful => console.success(&format!("{name} stopped")),
            StopKind::AlreadyExited(_) => console.info(&format!("{name} had already exited")),
            StopKind::Forced => console.warn(&format!("{name} force-killed")),
            StopKind::Unresponsive => console.error(&format!("{name} could not be stopped")),
        }
    }
    info!("Session ended ({:?})", summary.outcome);
    Ok(summary.exit_code())
}

async fn handle_stop(session: &Session, console: &Console) -> Result<i32> {
    console.header("Stopping Managed Processes");
    let report = session.reaper().reap().await;
    render_reap(console, &report);
    Ok(if report.is_clean() { 0 } else { 1 })
}

fn render_reap(console: &Console, report: &ReapReport) {
    if report.was_noop() {
        console.info("No managed processes running");
        return;
    }
    for process in &report.found {
        console.detail(&format!("PID {}: {}", process.pid, process.display_line(100)));
    }
    if !report.forced.is_empty() {
        console.warn(&format!("{} process(es) needed SIGKILL", report.forced.len()));
    }
    for pid in &report.permission_denied {
        console.warn(&format!("No permission to signal PID {pid}"));
    }
    if report.is_clean() {
        console.success(&format!("Stopped {} process(es)", report.found.len()));
    } else {
        console.error(&format!("{} process(es) still running:", report.remaining.len()));
        for process in &report.remaining {
            console.detail(&format!("PID {}: {}", process.pid, process.display_line(100)));
        }
    }
}

async fn handle_status(cfg: &Config, session: &Session, console: &Console) -> Result<i32> {
    let env = cfg.load_env()?;
    let aggregator = HealthAggregator::new(&session.matcher, &session.ports, cfg.probe_timeout())
        .context("Failed to build HTTP client")?;
    aggregator
        .check_all(&cfg.service_endpoints(&env), cfg.dependency_endpoint(&env).as_ref())
        .await
        .render(console);

    console.header("Workspace");
    for check in prereq::workspace_checks(cfg, &env) {
        if check.ok {
            console.success(&check.label);
        } else {
            console.warn(&check.label);
            if let Some(hint) = &check.hint {
                console.detail(hint);
            }
        }
    }
    Ok(0)
}

async fn handle_clean(cfg: &Config, session: &Session, console: &Console) -> Result<i32> {
    let running = session.matcher.find_managed();
    if !running.is_empty() {
        console.warn(&format!("{} managed process(es) running", running.len()));
        if ask(&session.prompter, "Stop them before cleaning?", true).await {
            render_reap(console, &session.reaper().reap().await);
        }
    }

    console.header("Cleaning Build Artifacts");
    for entry in clean_artifacts(cfg) {
        let label = entry.path.display();
        match entry.outcome {
            CleanOutcome::Removed { bytes: Some(bytes) } => {
                console.success(&format!("{label} removed ({})", format_size(bytes)));
            }
            CleanOutcome::Removed { bytes: None } => console.success(&format!("{label} removed")),
            CleanOutcome::AlreadyClean => console.info(&format!("{label} already clean")),
            CleanOutcome::Failed(e) => console.warn(&format!("{label} not fully removed: {e}")),
        }
    }
    Ok(0)
}

fn handle_init(console: &Console, path: Option<PathBuf>, force: bool) -> Result<i32> {
    let path = path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    Config::write_default(&path, force)?;
    console.success(&format!("Wrote default configuration to {}", path.display()));
    Ok(0)
}
