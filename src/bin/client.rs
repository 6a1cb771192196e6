use dictpipe::{Config, ConfigSnafu, ConnectSnafu, ConnectionManager, Transcript};
use snafu::ResultExt;
use tracing::{info, warn};

/// Sends one command, given on the command line, and prints what the
/// server answered. `DICTPIPE_CONFIG` may point at a TOML config file.
#[tokio::main]
async fn main() -> Result<(), dictpipe::Error> {
    tracing_subscriber::fmt::init();

    let config = match std::env::var("DICTPIPE_CONFIG") {
        Ok(path) => Config::from_file(path).context(ConfigSnafu)?,
        Err(_) => Config::default(),
    };
    info!("using server {}", config.address());

    let mut command: Vec<String> = std::env::args().skip(1).collect();
    if command.is_empty() {
        command = vec!["SHOW".to_string(), "SERVER".to_string()];
    }

    let manager = ConnectionManager::new(config);
    let connection = manager.get().context(ConnectSnafu)?;

    // both go out back to back; the answers come back in the same order
    let answer = connection.request(command, Transcript::new());
    let quit = connection.request(["QUIT"], Transcript::closing());

    match answer.await {
        Some(entries) => {
            for entry in entries {
                println!("{} {}", entry.response.code, entry.response.tokens.join(" "));
                for line in entry.text {
                    println!("    {}", line);
                }
            }
        }
        None => warn!("no answer from the server"),
    }

    if quit.await.is_none() {
        warn!("server did not acknowledge QUIT");
    }
    manager.close().await;

    Ok(())
}
