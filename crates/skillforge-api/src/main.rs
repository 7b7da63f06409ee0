//! SkillForge CLI and REST API entry point.
//!
//! Binary name: `skillforge`
//!
//! Parses CLI arguments, initializes tracing, databases and the engine, then
//! dispatches to the command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use skillforge_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::execution::RunArgs;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need logging or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "skillforge", &mut std::io::stdout());
        return Ok(());
    }

    let mut options = TracingOptions::for_verbosity(cli.verbose, cli.quiet);
    if cli.log_json {
        options.format = LogFormat::Json;
    }
    options.otel = cli.otel;
    init_tracing(options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Skill { action } => {
            cli::skill::handle_skill_command(action, &state, json).await?;
        }

        Commands::Match {
            text,
            category,
            threshold,
            limit,
        } => {
            cli::intent::match_intent(&state, &text, category, threshold, limit, json).await?;
        }

        Commands::Run {
            skill,
            text,
            inputs,
            transaction,
            no_interactive,
        } => {
            let args = RunArgs {
                skill,
                text,
                inputs,
                transaction,
                interactive: !no_interactive && !json && console::user_attended(),
            };
            cli::execution::run(&state, args, json).await?;
        }

        Commands::Input {
            execution_id,
            value,
        } => {
            cli::execution::provide_input(&state, &execution_id, &value, json).await?;
        }

        Commands::Cancel {
            execution_id,
            reason,
        } => {
            cli::execution::cancel(&state, &execution_id, reason, json).await?;
        }

        Commands::Rollback { execution_id } => {
            cli::execution::rollback(&state, &execution_id, json).await?;
        }

        Commands::Release { execution_id } => {
            cli::execution::release(&state, &execution_id, json).await?;
        }

        Commands::Status {
            execution_id,
            recent,
        } => match execution_id {
            Some(id) => cli::execution::show(&state, &id, json).await?,
            None => cli::status::status(&state, recent, json).await?,
        },

        Commands::Serve { port, host, skills } => {
            if let Some(dir) = skills {
                let loaded = cli::skill::load_path(&state, &dir).await?;
                tracing::info!(count = loaded.len(), dir = %dir.display(), "skills loaded");
            }

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} SkillForge API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
