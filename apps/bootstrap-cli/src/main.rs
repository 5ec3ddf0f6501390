mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use db_infra::config::db::{BootstrapSettings, ConnectionConfig};
use db_infra::{
    split_statements, BootstrapOptions, Bootstrapper, ConnectionProvider,
    DbInfraError, DbSession, MySqlDriver, SchemaSource,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "db-bootstrap")]
#[command(about = "MySQL database bootstrap tool")]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one bootstrap against the configured server
    Init(InitArgs),
    /// Obtain an application connection, bootstrapping if needed
    Connect,
    /// Print the statements a schema script splits into
    Split {
        /// Script to split
        file: PathBuf,
    },
}

#[derive(clap::Args)]
struct InitArgs {
    /// Administrative user (default: DB_ROOT_USER)
    #[arg(long)]
    admin_user: Option<String>,

    /// Administrative password (default: DB_ROOT_PASSWORD)
    #[arg(long)]
    admin_password: Option<String>,

    /// Database to create (default: DB_NAME or users_db)
    #[arg(long)]
    database: Option<String>,

    /// Account to provision; requires --new-password
    #[arg(long, requires = "new_password")]
    new_user: Option<String>,

    #[arg(long, requires = "new_user")]
    new_password: Option<String>,

    /// Host part of the provisioned account
    #[arg(long, default_value = "%")]
    new_user_host: String,

    /// Schema script (default: DB_SCHEMA_FILE, else the built-in schema)
    #[arg(long)]
    schema_file: Option<PathBuf>,

    /// Per-stage timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version land here as well
            let code = if e.use_stderr() { 2 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    telemetry::init_tracing(args.json);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        }
    });

    let outcome = match args.command {
        Command::Init(init) => run_init(init, &cancel).await,
        Command::Connect => run_connect(&cancel).await,
        Command::Split { file } => run_split(file).await,
    };

    if let Err(e) = outcome {
        eprintln!("db-bootstrap failed: {e}");
        std::process::exit(1);
    }
}

async fn run_init(init: InitArgs, cancel: &CancellationToken) -> Result<(), DbInfraError> {
    let config = ConnectionConfig::from_env()?;
    let settings = BootstrapSettings::from_env()?;
    let mut opts = BootstrapOptions::from_env()?;

    if let Some(user) = init.admin_user {
        opts.admin.user = user;
    }
    if let Some(password) = init.admin_password {
        opts.admin.password = password;
    }
    if let Some(database) = init.database {
        opts.database = database;
    }
    if let (Some(user), Some(password)) = (init.new_user, init.new_password) {
        opts = opts
            .with_new_user(user, password)
            .with_new_user_host(init.new_user_host);
    }
    if let Some(path) = init.schema_file {
        opts = opts.with_schema(SchemaSource::Script(path));
    }
    if let Some(ms) = init.timeout_ms {
        if ms == 0 {
            return Err(DbInfraError::config("--timeout-ms must be greater than zero"));
        }
        opts = opts.with_stage_timeout(Duration::from_millis(ms));
    }

    let driver = Arc::new(MySqlDriver::new(settings.connect_timeout));
    let bootstrapper = Bootstrapper::for_config(driver, &config);
    let result = bootstrapper.initialize_with_cancel(&opts, cancel).await;
    bootstrapper.counters().log_snapshot("init");

    let report = result.into_result()?;
    println!("database:   {}", report.database);
    if let Some(account) = &report.user_created {
        println!("user:       {account}");
    }
    println!("schema:     {}", report.schema_origin);
    println!("statements: {}", report.statements_applied);
    println!("elapsed:    {}ms", report.elapsed.as_millis());
    Ok(())
}

async fn run_connect(cancel: &CancellationToken) -> Result<(), DbInfraError> {
    let provider = ConnectionProvider::from_env()?;
    let conn = provider.get_connection_with_cancel(cancel).await?;
    println!(
        "connected to {} as {}",
        provider.config().database,
        provider.config().user
    );
    if let Err(e) = conn.close().await {
        warn!(error = %e, "failed to close connection");
    }
    Ok(())
}

async fn run_split(file: PathBuf) -> Result<(), DbInfraError> {
    let script = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| DbInfraError::config(format!("cannot read {}: {e}", file.display())))?;
    for (i, statement) in split_statements(&script).iter().enumerate() {
        println!("-- statement {}\n{statement};", i + 1);
    }
    Ok(())
}
