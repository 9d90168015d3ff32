mod auth;
mod cache;
mod cli;
mod config;
mod delete;
mod error;
mod models;
mod output;
mod registry;

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Method;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::CliImageCache;
use cli::Cli;
use config::Config;
use delete::delete_image;
use error::{exit_code, AppError};
use models::{CustomHeader, ImageReference, RawTarget};
use output::{print_raw, print_report};
use registry::RegistryClient;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { exit_code::USAGE } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        process::exit(report_error(&e));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "warn,regrm=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// Print the error (and any captured registry response) to stderr; return the exit code.
fn report_error(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<AppError>() {
        Some(app) => {
            if let Some(diagnostic) = app.diagnostic() {
                eprintln!("{}", diagnostic.trim_end());
            }
            eprintln!("Error: {:#}", e);
            app.exit_code()
        }
        None => {
            eprintln!("Error: {:#}", e);
            exit_code::USAGE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_cli(&cli, || rpassword::prompt_password("Password: "))?;
    debug!("Config: {:?}", config);

    match &cli.raw {
        Some(raw) => run_raw(&config, raw).await,
        None => {
            let image = cli
                .image
                .as_deref()
                .ok_or_else(|| AppError::usage("No image given"))?;
            run_delete(&config, image).await
        }
    }
}

async fn run_raw(config: &Config, raw: &[String]) -> Result<()> {
    let (target, method, header) = match raw {
        [target, method] => (target, method, None),
        [target, method, header] => (target, method, Some(header)),
        _ => return Err(AppError::usage("--raw takes <URL> <METHOD> [HEADER]").into()),
    };

    let target: RawTarget = target.parse()?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| AppError::usage(format!("'{}' is not an HTTP method", method)))?;
    let header = header.map(|h| h.parse::<CustomHeader>()).transpose()?;

    let client = RegistryClient::new(config, &target.host)?;
    let url = client.resolve_url(&target.path);
    let resp = client
        .perform_request(&url, &method, header.as_ref())
        .await
        .with_context(|| format!("Raw {} {} failed", method, url))?;

    print_raw(&resp, true);
    Ok(())
}

async fn run_delete(config: &Config, image: &str) -> Result<()> {
    let image: ImageReference = image.parse()?;
    let client = RegistryClient::new(config, &image.host)?;
    let cache = CliImageCache::new(config.cache_tool.as_str());

    let report = delete_image(&client, &cache, &image, config.tag_only)
        .await
        .with_context(|| format!("Failed to delete {}", image))?;

    print_report(&report, config.tag_only);

    match report.recovery_error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
