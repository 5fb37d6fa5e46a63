#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::process::ExitCode;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use gateway::config::{ConfFile, ConfHandle, Conf, SecretResolver};
use gateway_task::ShutdownHandle;

const BAD_CONFIG_ERR_CODE: u8 = 1;
const IDP_UNREACHABLE_ERR_CODE: u8 = 2;

fn main() -> ExitCode {
    let executable = std::env::args().next().unwrap_or_else(|| "gateway".to_owned());

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--help" | "-h") => {
            print_help(&executable);
            return ExitCode::SUCCESS;
        }
        Some("--config-init-only") => {
            return config_init_only();
        }
        _ => {}
    }

    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| Utf8PathBuf::from("/etc/gateway/gateway.json"));

    let conf_file = match ConfFile::load(&config_path) {
        Ok(conf_file) => conf_file,
        Err(error) => {
            eprintln!("failed to load configuration from {config_path}: {error:#}");
            return ExitCode::from(BAD_CONFIG_ERR_CODE);
        }
    };

    let secrets_dir = Utf8PathBuf::from("/run/secrets");
    let secrets = SecretResolver::standard(secrets_dir);

    let conf = match Conf::from_conf_file(conf_file, &secrets) {
        Ok(conf) => conf,
        Err(error) => {
            eprintln!("configuration is invalid: {error}");
            return ExitCode::from(BAD_CONFIG_ERR_CODE);
        }
    };

    let log_directive = conf.log_directive.clone().unwrap_or_else(|| "info".to_owned());
    let log_dir = Utf8PathBuf::from("/var/log/gateway");
    if let Err(error) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {log_dir}: {error:#}");
        return ExitCode::from(BAD_CONFIG_ERR_CODE);
    }
    let _logger_guard = match gateway_log::init::<gateway::log::GatewayLog>(&log_dir, &log_directive, None) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {error:#}");
            return ExitCode::from(BAD_CONFIG_ERR_CODE);
        }
    };

    let require_idp_reachable = conf.require_idp_reachable;
    let conf_handle = ConfHandle::new(conf);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to build the async runtime: {error:#}");
            return ExitCode::from(BAD_CONFIG_ERR_CODE);
        }
    };

    runtime.block_on(async move {
        if require_idp_reachable {
            if let Err(error) = probe_idps_reachable(&conf_handle).await {
                error!(error = format!("{error:#}"), "configured identity providers are not reachable at startup");
                return ExitCode::from(IDP_UNREACHABLE_ERR_CODE);
            }
        }

        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        let server = tokio::spawn(gateway::service::run(conf_handle, shutdown_signal.clone()));

        if let Err(error) = wait_for_shutdown_signal().await {
            error!(error = format!("{error:#}"), "failed to wait for a shutdown signal");
        }
        shutdown_handle.signal();

        match server.await {
            Ok(Ok(())) => ExitCode::SUCCESS,
            Ok(Err(error)) => {
                error!(error = format!("{error:#}"), "gateway terminated with an error");
                ExitCode::FAILURE
            }
            Err(join_error) => {
                error!(error = format!("{join_error:#}"), "gateway task panicked");
                ExitCode::FAILURE
            }
        }
    })
}

fn print_help(executable: &str) {
    println!(
        r#"HELP:

    Run:
        "{executable}"

    Initialize configuration only (will not override existing configuration):
        "{executable}" --config-init-only

    Options:
        --config-path <CONFIG_PATH> (or set GATEWAY_CONFIG_PATH)
"#
    );
}

fn config_init_only() -> ExitCode {
    let config_path = Utf8PathBuf::from("/etc/gateway/gateway.json");
    match ConfFile::load(&config_path) {
        Ok(conf_file) => match serde_json::to_string_pretty(&conf_file) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("couldn't represent config file as JSON: {error}");
                ExitCode::from(BAD_CONFIG_ERR_CODE)
            }
        },
        Err(error) => {
            eprintln!("failed to load configuration from {config_path}: {error:#}");
            ExitCode::from(BAD_CONFIG_ERR_CODE)
        }
    }
}

/// A best-effort HEAD-equivalent reachability check against every configured
/// IDP's JWKS URI, run once before the HTTP listener binds. Only consulted
/// when `auth.require_idp_reachable` is set.
async fn probe_idps_reachable(conf_handle: &ConfHandle) -> anyhow::Result<()> {
    let conf = conf_handle.get_conf();
    let http = reqwest::Client::builder().build().context("failed to build probe HTTP client")?;

    for idp in &conf.idps {
        let Some(jwks_uri) = &idp.jwks_uri else {
            continue;
        };
        http.get(jwks_uri.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("IDP '{}' JWKS endpoint is unreachable", idp.name))?;
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }

    info!("shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("ctrl-c signal failed")?;
    info!("shutdown signal received");
    Ok(())
}
