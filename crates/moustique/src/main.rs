//! Moustique server CLI.
//!
//! One binary: run the multi-tenant broker, or perform a maintenance action
//! (`--generate-config`, `--add-user`, `--list-users`) and exit. Exit code
//! is 0 on clean shutdown and 1 on startup failure or a failed shutdown
//! snapshot.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use moustique_broker::{BrokerManager, BrokerOptions};
use moustique_config::{generate_default_config, load_config, Settings};
use moustique_transport::{
    file_version, serve, AppState, PeerAllowlist, ServerOptions, UserAuth,
};

/// Multi-tenant publish/subscribe broker over HTTP.
#[derive(Parser)]
#[command(name = "moustique", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Write a default config file and exit.
    #[arg(long)]
    generate_config: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Add a user and exit.
    #[arg(long, value_name = "USER:PWD")]
    add_user: Option<String>,

    /// List registered users and exit.
    #[arg(long)]
    list_users: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.generate_config {
        if let Err(err) = generate_default_config(&args.config) {
            eprintln!("failed to generate config: {err}");
            return ExitCode::FAILURE;
        }
        println!("generated default config at {}", args.config.display());
        return ExitCode::SUCCESS;
    }

    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::FAILURE;
        }
    };
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    let debug = config.logging.level == "debug";

    moustique_utils::logging::init(
        &config.logging.level,
        config.logging.file.as_deref().map(Path::new),
    );

    if let Some(spec) = &args.add_user {
        return add_user(&config, spec);
    }
    if args.list_users {
        return list_users(&config);
    }

    run_server(config, debug).await
}

fn add_user(config: &Settings, spec: &str) -> ExitCode {
    let Some((name, password)) = spec.split_once(':') else {
        eprintln!("expected USER:PWD");
        return ExitCode::FAILURE;
    };

    let auth = match UserAuth::open(Path::new(&config.database.path)) {
        Ok(auth) => auth,
        Err(err) => {
            eprintln!("failed to open user store: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = auth.add_user(name, password) {
        eprintln!("failed to add user: {err}");
        return ExitCode::FAILURE;
    }

    println!("user added: {name}");
    ExitCode::SUCCESS
}

fn list_users(config: &Settings) -> ExitCode {
    match UserAuth::open(Path::new(&config.database.path)) {
        Ok(auth) => {
            for name in auth.usernames() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to open user store: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Settings, debug: bool) -> ExitCode {
    let version = match file_version() {
        Ok(version) => version,
        Err(err) => {
            error!("could not fingerprint executable: {err}");
            return ExitCode::FAILURE;
        }
    };

    let auth = match UserAuth::open(Path::new(&config.database.path)) {
        Ok(auth) => Arc::new(auth),
        Err(err) => {
            error!("failed to initialize user auth: {err}");
            return ExitCode::FAILURE;
        }
    };

    let manager = Arc::new(BrokerManager::new(
        config.database.path.as_str(),
        BrokerOptions {
            debug,
            ..BrokerOptions::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Err(err) = manager.initialize_default(shutdown_rx.clone(), config.server.allow_public) {
        error!("failed to initialize broker manager: {err}");
        return ExitCode::FAILURE;
    }

    let state = AppState::new(
        Arc::clone(&manager),
        auth,
        Arc::new(PeerAllowlist::new(&config.security.allowed_peers)),
        ServerOptions {
            version,
            allow_public: config.server.allow_public,
            admin_password: config.security.admin_password.clone(),
            server_log: config.logging.file.as_ref().map(PathBuf::from),
            request_timeout: Duration::from_secs(config.server.timeout_secs),
            max_connections: config.server.max_connections,
        },
    );

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid listen address: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        %addr,
        allow_public = config.server.allow_public,
        "starting moustique multi-tenant server"
    );

    let mut server = tokio::spawn(serve(state, addr, shutdown_rx));
    let mut failed = false;

    tokio::select! {
        result = &mut server => {
            failed = true;
            match result {
                Ok(Ok(())) => error!("server exited unexpectedly"),
                Ok(Err(err)) => error!("server error: {err}"),
                Err(err) => error!("server task failed: {err}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting gracefully");
        }
    }

    // Stop accepting, give in-flight requests a moment, then snapshot.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("saving databases to disk");
    if let Err(err) = manager.save_all() {
        error!("CRITICAL: failed to save databases, data may be lost: {err}");
        return ExitCode::FAILURE;
    }

    if failed {
        return ExitCode::FAILURE;
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}
