use clap::{Parser, Subcommand, ValueEnum};
use repolite::cli::{self as prog_cli, OutputMode};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Format {
    Human,
    Plain,
    Json,
}

impl From<Format> for OutputMode {
    fn from(f: Format) -> Self {
        match f {
            Format::Human => Self::Human,
            Format::Plain => Self::Plain,
            Format::Json => Self::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "repolite", version, about = "Inspect repolite query plans and configuration", long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value = "human", global = true, help = "Output format")]
    format: Format,
    #[arg(long, global = true, help = "log4rs YAML file; REPOLITE_LOG_* env vars are used otherwise")]
    log_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Render a filter as PostgreSQL with bind parameters")]
    Compile {
        #[arg(long, help = "Entity type (table) name")]
        entity: String,
        #[arg(long, help = "Filter JSON, flat or {and_filters, or_filters, not_filters}")]
        filter: String,
        #[arg(long, help = "Entity schema TOML used for type checks and relations")]
        schema: Option<PathBuf>,
        #[arg(long, help = "Do not add the deleted_at IS NULL scope")]
        include_deleted: bool,
    },
    #[command(about = "Print the cache fingerprint of a list read")]
    Fingerprint {
        #[arg(long)]
        entity: String,
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long)]
        schema: Option<PathBuf>,
        #[arg(long, value_delimiter = ',', help = "Sort keys; prefix with '-' for descending")]
        order_by: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        #[arg(long, help = "Cache key prefix (defaults to the engine default)")]
        prefix: Option<String>,
    },
    #[command(name = "check-config", about = "Validate an engine configuration TOML file")]
    CheckConfig {
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let logging = match &cli.log_config {
        Some(path) => repolite::logger::init_file(path),
        None => repolite::logger::configure_from_env(),
    };
    if let Err(e) = logging {
        eprintln!("warning: logging not configured: {e}");
    }
    let cmd = match cli.command {
        Commands::Compile { entity, filter, schema, include_deleted } => {
            prog_cli::Command::Compile { entity, filter_json: filter, schema, include_deleted }
        }
        Commands::Fingerprint { entity, filter, schema, order_by, limit, offset, prefix } => {
            prog_cli::Command::Fingerprint { entity, filter_json: filter, schema, order_by, limit, offset, prefix }
        }
        Commands::CheckConfig { path } => prog_cli::Command::CheckConfig { path },
    };
    let r = prog_cli::run_with_format(cmd, cli.format.into(), &mut std::io::stdout());
    if let Err(e) = r {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
