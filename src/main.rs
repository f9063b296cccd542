use clap::Parser;
use mockupdb::config::ServerConfig;
use mockupdb::message::{ReplySpec, Request};
use mockupdb::server::MockServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs, to pick up
    // log_level from the file.
    let cfg_file_res = ServerConfig::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => ServerConfig::default(),
    };

    // Log filter precedence: CLI (--log-level / MOCKUPDB_LOG_LEVEL) >
    // RUST_LOG (env) > config.toml log_level > default("info").
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    let cfg = cfg_file
        .with_overrides(Some(cli.port), None, None)
        .with_verbose(!cli.quiet);

    tracing::info!(port = cfg.port, "starting mockupdb-server");

    let server = MockServer::run(cfg).await?;
    tracing::info!(uri = %server.uri(), "listening");

    interactive_server(&server).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down");
    server.stop().await;

    Ok(())
}

/// Register the small set of canned autoresponders a driver's connection
/// handshake expects so that `mockupdb-server` is usable interactively (via
/// a mongo shell or a driver) without a test harness scripting every reply.
/// Deliberately does not register a wildcard catch-all: unrecognized
/// requests are left for a human to inspect via `server.got()`.
async fn interactive_server(server: &MockServer) {
    server
        .autoresponds(
            Request::command("ismaster"),
            ReplySpec::Doc(bson::doc! {
                "ismaster": true,
                "maxWireVersion": 17,
                "minWireVersion": 0,
                "maxBsonObjectSize": 16_777_216,
                "maxMessageSizeBytes": 48_000_000,
                "maxWriteBatchSize": 100_000,
                "localTime": bson::DateTime::now(),
            }),
        )
        .await;
    server
        .autoresponds(
            Request::command("isMaster"),
            ReplySpec::Doc(bson::doc! {
                "ismaster": true,
                "maxWireVersion": 17,
                "minWireVersion": 0,
            }),
        )
        .await;
    server
        .autoresponds(
            Request::command("whatsmyuri"),
            ReplySpec::Doc(bson::doc! { "you": "127.0.0.1:0" }),
        )
        .await;
    server
        .autoresponds(
            Request::command("getLog"),
            ReplySpec::Doc(bson::doc! { "log": Vec::<String>::new(), "totalLinesWritten": 0 }),
        )
        .await;
    server
        .autoresponds(
            Request::command("replSetGetStatus"),
            ReplySpec::Doc(bson::doc! { "set": "", "members": [] }),
        )
        .await;
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "mockupdb-server",
    version,
    about = "Mock MongoDB wire-protocol server for testing drivers"
)]
struct Cli {
    /// Port to listen on.
    #[arg(short = 'p', long = "port", env = "MOCKUPDB_PORT", default_value_t = 27017)]
    port: u16,

    /// Disable verbose per-request logging.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Path to an optional TOML config file.
    #[arg(short = 'c', long = "config", env = "MOCKUPDB_CONFIG")]
    config: Option<String>,

    /// Log level or filter spec (e.g. `info` or `info,mockupdb=debug`).
    #[arg(long = "log-level", env = "MOCKUPDB_LOG_LEVEL")]
    log_level: Option<String>,
}
