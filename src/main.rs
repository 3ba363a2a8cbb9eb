mod app;
mod config;
mod paths;
mod shell;
mod vim;

use std::io::Write;
use std::sync::Arc;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use app::App;
use config::Config;
use paths::PathManager;
use shell::commands::{CommandContext, CommandDispatcher, CommandRegistry};
use shell::console::Console;
use shell::session::Session;
use vim::client::{ConnectOptions, HttpJsonClient, DEFAULT_RELEASE};
use vim::simulator::Simulator;
use vim::Connection;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Info)
        .parse_env(env_logger::Env::default())
        .init();

    let app = App::parse();

    let config_path = app.config.clone().unwrap_or_else(|| PathManager::new().config_file());
    let config = Config::load(&config_path)?;
    let (connection, password) = app.connection(&config.connection)?;
    let console = Console::terminal();

    let mut session = Session::new();
    if app.simulate {
        log::info!("Using the simulated inventory");
        session.add_connection(Connection::new("sim", Arc::new(Simulator::demo())));
    } else if let Some(host) = connection.host.clone() {
        let user = connection.user.clone().ok_or("no user given (--user)")?;
        let password = match password {
            Some(password) => password,
            None => console.password(&format!("password for {}@{}: ", user, host))?,
        };
        let options = ConnectOptions {
            host: host.clone(),
            port: connection.port,
            user,
            password,
            release: connection.release.clone().unwrap_or_else(|| DEFAULT_RELEASE.to_string()),
            insecure: connection.insecure,
        };
        let client = HttpJsonClient::connect(&options).await?;
        log::info!("Connected to {}", host);
        session.add_connection(Connection::new(host, Arc::new(client)));
    } else {
        log::warn!("No server given; starting without connections");
    }

    let registry = Arc::new(CommandRegistry::standard());
    let dispatcher = CommandDispatcher::new(registry.clone());
    let mut context = CommandContext::new(session, config.shell, console, registry);

    for line in &app.execute {
        print!("{}", dispatcher.execute(line, &mut context).await);
        if context.should_exit {
            return Ok(());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}", context.session.prompt());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        // First Ctrl-C asks the command to stop so it can release what it holds
        // on the server; a second one abandons it.
        let cancel = CancellationToken::new();
        context.cancel = cancel.clone();
        let output = {
            let running = dispatcher.execute(&line, &mut context);
            tokio::pin!(running);
            tokio::select! {
                output = &mut running => output,
                _ = tokio::signal::ctrl_c() => {
                    log::debug!("interrupt requested");
                    cancel.cancel();
                    tokio::select! {
                        output = &mut running => output,
                        _ = tokio::signal::ctrl_c() => "Interrupted\n".to_string(),
                    }
                }
            }
        };
        print!("{}", output);
        if context.should_exit {
            break;
        }
    }

    log::debug!("Shell exited");
    Ok(())
}
