//! Process entry point. Parses the CLI, merges the layered configuration,
//! dispatches one-shot actions (`--save`, `--password`, `--install`, …),
//! and otherwise starts the supervisor + server pool and blocks forever.

use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use clap::Parser;
use executor_core::async_executor::AsyncExecutor;
use executor_core::try_init_global_executor;
use executor_core::Executor;

use px::cli::Cli;
use px::client;
use px::config::{self, Config};
use px::credential;
use px::debug::{DebugSink, Mode as DebugMode};
use px::error::{PxError, Result};
use px::handler::HandlerConfig;
use px::ini;
use px::noproxy::NoProxy;
use px::resolver::{self, PacSource, Resolver, SystemProxyDiscovery};
use px::server::{Admission, Pool};
use px::supervisor;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = format!("px={},px_cli=info", tracing_level_for(cli.log.unwrap_or(0)));
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let executor = AsyncExecutor::new();
    let _ = try_init_global_executor(executor.clone());

    match smol::block_on(async_main(cli, executor)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("px: {e}");
            ExitCode::FAILURE
        }
    }
}

fn tracing_level_for(log: u8) -> &'static str {
    match log {
        0 => "warn",
        1 | 2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

async fn async_main(cli: Cli, executor: AsyncExecutor) -> anyhow::Result<()> {
    let ini_path = cli.config.clone().or_else(default_config_path);
    let ini_config = match &ini_path {
        Some(path) => ini::load(path)?,
        None => ini::IniConfig::default(),
    };
    let config = config::merge(&cli, &ini_config);

    if cli.save {
        return save_action(&config, ini_path);
    }
    if cli.password {
        return password_action(&config);
    }
    if cli.install || cli.uninstall || cli.quit || cli.restart {
        return platform_action(&cli);
    }
    if let Some(url) = cli.test.clone() {
        return test_action(config, url, executor).await;
    }

    run(config, executor).await
}

fn default_config_path() -> Option<std::path::PathBuf> {
    let cwd_candidate = std::env::current_dir().ok()?.join("px.ini");
    if cwd_candidate.exists() {
        return Some(cwd_candidate);
    }
    let exe_candidate = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("px.ini")))?;
    if exe_candidate.exists() {
        return Some(exe_candidate);
    }
    None
}

fn save_action(config: &Config, ini_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = ini_path.unwrap_or_else(|| std::path::PathBuf::from("px.ini"));
    ini::save(&path, &config.to_ini())?;
    println!("Saved config to {}", path.display());
    Ok(())
}

fn password_action(config: &Config) -> anyhow::Result<()> {
    if config.username.is_empty() {
        anyhow::bail!("--password requires --username <principal>");
    }
    if std::env::args().any(|a| a == "--remove") {
        credential::remove_password(&config.username)?;
        println!("Removed stored credential for {}", config.username);
    } else {
        credential::set_password_interactive(&config.username)?;
        println!("Saved credential for {}", config.username);
    }
    Ok(())
}

/// Windows service actions have no effect on other platforms; the CLI
/// still parses and routes them so a config meant for a Windows host
/// doesn't error out when dry-run on Linux.
fn platform_action(cli: &Cli) -> anyhow::Result<()> {
    #[cfg(target_os = "windows")]
    {
        let _ = cli;
        anyhow::bail!("Windows service actions are not implemented");
    }
    #[cfg(not(target_os = "windows"))]
    {
        let action = if cli.install {
            "--install"
        } else if cli.uninstall {
            "--uninstall"
        } else if cli.quit {
            "--quit"
        } else {
            "--restart"
        };
        println!("{action} is not supported on this platform");
        anyhow::bail!("unsupported action on this platform");
    }
}

async fn test_action(mut config: Config, url: String, executor: AsyncExecutor) -> anyhow::Result<()> {
    config.workers = 1;
    config.threads = 1;

    let addrs = config.listen_addrs()?;
    let std_listeners = supervisor::bind_listeners(&addrs)?;

    let ready: Arc<OnceLock<std::net::SocketAddr>> = Arc::new(OnceLock::new());
    let ready_clone = Arc::clone(&ready);
    let cfg = config.clone();
    let exec = executor.clone();
    executor
        .spawn(async move {
            if let Err(e) = run_single_worker(cfg, exec, std_listeners, Some(ready_clone)).await {
                tracing::error!(error = %e, "px --test: worker exited");
            }
        })
        .detach();

    let addr = wait_for_ready(&ready).await;
    let target: hyper::Uri = url.parse()?;
    let host = target.host().unwrap_or_default().to_string();
    let port = target.port_u16().unwrap_or(if target.scheme_str() == Some("https") { 443 } else { 80 });

    let stream = client::connect_direct(&addr.ip().to_string(), addr.port()).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(px::io::ConnectionWrapper(stream)).await?;
    executor.spawn(async move { let _ = conn.await; }).detach();

    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(format!("http://{host}:{port}{}", target.path()))
        .body(http_body_util::Full::new(bytes::Bytes::new()))?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = http_body_util::BodyExt::collect(response.into_body()).await?.to_bytes();
    println!("{status}");
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

async fn wait_for_ready(ready: &OnceLock<std::net::SocketAddr>) -> std::net::SocketAddr {
    loop {
        if let Some(addr) = ready.get() {
            return *addr;
        }
        smol::Timer::after(std::time::Duration::from_millis(5)).await;
    }
}

/// Binds the listeners once, then forks `workers - 1` children that
/// inherit the already-open file descriptors before any per-worker async
/// state exists. Each process (parent and children alike) then runs an
/// identical server pool over its copy of the inherited listeners.
async fn run(config: Config, executor: AsyncExecutor) -> anyhow::Result<()> {
    let addrs = config.listen_addrs()?;
    let std_listeners = supervisor::bind_listeners(&addrs)?;
    let (tracker, _is_parent) = supervisor::fork_workers(config.workers)?;
    // Whenever this process's pool loop exits, whether cleanly or on
    // error, its forked siblings (if any were registered) are reaped
    // rather than left bound to the shared listening sockets. A parent
    // killed outright is instead caught by each child's PR_SET_PDEATHSIG.
    let result = run_single_worker(config, executor, std_listeners, None).await;
    tracker.kill_all();
    result?;
    Ok(())
}

/// Runs one worker's server pool over already-bound listeners, wiring up
/// the resolver/handler/admission stack and serving forever. `ready`, when
/// set, publishes the first listener's address once and is used by
/// `--test` to know the proxy is up without guessing at scheduling.
async fn run_single_worker(
    config: Config,
    executor: AsyncExecutor,
    std_listeners: Vec<std::net::TcpListener>,
    ready: Option<Arc<OnceLock<std::net::SocketAddr>>>,
) -> Result<()> {
    let noproxy = NoProxy::parse(&config.noproxy);
    let mode = build_mode(&config).await?;
    let resolver = Arc::new(Resolver::new(mode, noproxy.clone(), config.proxyreload));

    let debug = Arc::new(
        DebugSink::new(DebugMode::from_level(config.log), std::process::id(), config.port)
            .map_err(PxError::ClientIo)?,
    );

    let handler_config = Arc::new(HandlerConfig {
        resolver,
        auth_scheme: config.auth,
        username: config.username.clone(),
        useragent: config.useragent.clone(),
        idle: config.idle,
        debug,
    });

    let local_ips = px::server::local_interface_ips();
    let admission = Arc::new(Admission::new(&config.allow, config.hostonly, local_ips));

    let mut pending_ready = ready;
    let mut tasks = Vec::new();
    for listener in std_listeners {
        listener.set_nonblocking(true).map_err(PxError::ClientIo)?;
        let local_addr = listener.local_addr().map_err(PxError::ClientIo)?;
        if let Some(flag) = pending_ready.take() {
            let _ = flag.set(local_addr);
        }
        let async_listener = async_net::TcpListener::from(listener);
        let pool = Pool::new(async_listener, Arc::clone(&admission), Arc::clone(&handler_config));
        let exec = executor.clone();
        tasks.push(executor.spawn(async move { pool.run(exec).await }));
    }

    for task in tasks {
        task.await;
    }
    Ok(())
}

/// Chooses the resolver's starting mode, honoring the discovery order
/// `--server` > `--pac` > system discovery > direct. `--server` and an
/// explicit `--pac` are both fixed (no periodic refresh); only the system
/// discovery fallback is a `PacSystem` snapshot, since that is the only
/// source that can legitimately change out from under a running process.
async fn build_mode(config: &Config) -> Result<resolver::Mode> {
    if !config.server.trim().is_empty() {
        return Ok(resolver::mode_from_config(&config.server, None, false));
    }
    if let Some(location) = &config.pac {
        let body = load_pac_body(location).await?;
        return Ok(resolver::Mode::PacStatic(PacSource { url: location.clone(), body }));
    }
    let discovery = resolver::EnvProxyDiscovery;
    match discovery.discover() {
        Some(src) => Ok(resolver::Mode::PacSystem(src)),
        None => Ok(resolver::Mode::DirectOnly),
    }
}

async fn load_pac_body(location: &str) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        fetch_pac_over_http(location).await
    } else {
        std::fs::read_to_string(location).map_err(PxError::ClientIo)
    }
}

async fn fetch_pac_over_http(url: &str) -> Result<String> {
    let parsed: hyper::Uri = url.parse().map_err(|_| PxError::ConfigValue {
        section: "proxy",
        key: "pac",
        value: url.to_string(),
        reason: "not a valid URL".to_string(),
    })?;
    let host = parsed.host().ok_or_else(|| PxError::ConfigValue {
        section: "proxy",
        key: "pac",
        value: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = parsed.port_u16().unwrap_or(80);

    let stream = client::connect_direct(host, port).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(px::io::ConnectionWrapper(stream))
        .await
        .map_err(PxError::Http)?;
    let executor = executor_core::async_executor::AsyncExecutor::new();
    executor.spawn(async move { let _ = conn.await; }).detach();

    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(parsed.clone())
        .header("Host", host)
        .body(http_body_util::Full::new(bytes::Bytes::new()))
        .map_err(PxError::HttpProtocol)?;
    let response = sender.send_request(request).await.map_err(PxError::Http)?;
    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .map_err(PxError::Http)?
        .to_bytes();
    Ok(String::from_utf8_lossy(&body).into_owned())
}
