/// `retcond` - the Retcon command-line front end.
///
/// Drives one reconciliation request through a configured `Kernel` and
/// prints the resulting document as JSON to stdout. `create` and
/// `update` read the document payload from stdin.
///
/// Format: `retcond [--config FILE] <create|read|update|delete> ENTITY SOURCE KEY`
///
/// Examples:
///   echo '{"name": "Alice"}' | retcond create customer data K1
///   retcond read customer data K1
///   echo '{"name": "Alicia"}' | retcond update customer data K1
///   retcond delete customer data K1
use std::collections::HashMap;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use retcon::{
    Config, EntityName, ForeignKey, Kernel, Outcome, Request, SourceName, Store, TraceSink,
    TracingSink,
};
use serde_json::Value as JsonValue;

/// Retcon - keeps a document synchronized across several external sources.
#[derive(Parser)]
#[command(name = "retcond")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (default: $RETCON_CONFIG, then the
    /// compiled-in system default).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new record at SOURCE, seeded from a JSON document on stdin.
    ///
    /// KEY is accepted for symmetry with the other subcommands but is not
    /// forwarded to the source: the source assigns its own key on create.
    Create {
        entity: String,
        source: String,
        key: String,
    },
    /// Print the reconciled view of ENTITY/SOURCE/KEY.
    Read {
        entity: String,
        source: String,
        key: String,
    },
    /// Overwrite SOURCE's view of KEY from a JSON document on stdin, then reconcile.
    Update {
        entity: String,
        source: String,
        key: String,
    },
    /// Delete KEY at SOURCE, then reconcile (propagating the deletion once
    /// every source agrees).
    Delete {
        entity: String,
        source: String,
        key: String,
    },
}

fn read_stdin_document() -> Result<JsonValue> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("reading document from stdin")?;
    serde_json::from_str(&buf).context("parsing stdin as a JSON document")
}

fn build_kernel(config: &Config) -> Result<Kernel> {
    let universe = config.universe();
    let policies: HashMap<EntityName, _> = config
        .merge_policies()
        .context("resolving configured merge policies")?
        .into_iter()
        .collect();
    let sources: HashMap<_, _> = config
        .data_sources()
        .context("building configured data source adaptors")?
        .into_iter()
        .collect();
    // `Store` is implemented on `Arc<InMemoryStore>` so a transaction can
    // hold its own strong reference to the store it came from; wrapping
    // once more turns that into the `Arc<dyn Store>` trait object below.
    let store: Arc<dyn Store> = Arc::new(config.store().context("opening configured store")?);
    let trace: Arc<dyn TraceSink> = Arc::new(TracingSink);
    Ok(Kernel::new(universe, policies, sources, store, trace))
}

#[tokio::main]
async fn main() -> Result<()> {
    retcon::init_logging();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    let kernel = match build_kernel(&config) {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    let request = match &cli.command {
        Command::Create { entity, source, .. } => {
            let document = read_stdin_document()?;
            Request::Create {
                entity: EntityName::new(entity.as_str()),
                source: SourceName::new(source.as_str()),
                document,
            }
        }
        Command::Read { entity, source, key } => Request::Read(ForeignKey::new(
            EntityName::new(entity.as_str()),
            SourceName::new(source.as_str()),
            key.as_str(),
        )),
        Command::Update { entity, source, key } => {
            let document = read_stdin_document()?;
            Request::Update {
                key: ForeignKey::new(
                    EntityName::new(entity.as_str()),
                    SourceName::new(source.as_str()),
                    key.as_str(),
                ),
                document,
            }
        }
        Command::Delete { entity, source, key } => Request::Delete(ForeignKey::new(
            EntityName::new(entity.as_str()),
            SourceName::new(source.as_str()),
            key.as_str(),
        )),
    };

    match kernel.handle(request).await {
        Ok(Outcome::Reconciled { key, document }) => {
            eprintln!("reconciled {}", key);
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
        Ok(Outcome::Deleted) => {
            eprintln!("no reconciled document (deleted or never existed)");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
