//! Binary entry point for the Cairn command-line tool.
#![forbid(unsafe_code)]

mod config;
mod ui;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use cairn::admin::{self, AdminError, AdminOpenOptions, VerifyLevel};
use cairn::migration::{self, ConflictPolicy, ExportScope, ImportOptions};
use cairn::storage::{Node, Repository};
use cairn::types::{CairnError, MetaValue, Metadata, NodeId};

use config::{CliConfig, ConfigError};
use ui::{format_duration, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "cairn",
    version,
    about = "Content-addressable knowledge-graph store",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        short = 'r',
        global = true,
        env = "CAIRN_REPO",
        value_name = "PATH",
        help = "Repository file (defaults to repository.default in the config)"
    )]
    repo: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "CAIRN_CONFIG",
        value_name = "FILE",
        help = "CLI config file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Theme::Auto,
        help = "Color theme for text output"
    )]
    theme: Theme,

    #[arg(long, short = 'q', global = true, help = "Plain output without spinners")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct MetaArgs {
    #[arg(
        long = "meta",
        value_name = "KEY=VALUE",
        help = "Metadata entry; numbers and true/false are typed (repeatable)"
    )]
    pairs: Vec<String>,

    #[arg(long, value_name = "JSON", help = "Metadata as a JSON object")]
    meta_json: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create an empty repository")]
    Init,
    #[command(about = "Store content as a new node and print its id")]
    Add {
        #[arg(value_name = "CONTENT", help = "Literal content; omit to read --file or stdin")]
        content: Option<String>,
        #[arg(long, value_name = "FILE", conflicts_with = "content")]
        file: Option<PathBuf>,
        #[arg(long = "type", default_value = "note", help = "Node type tag")]
        node_type: String,
        #[arg(long, help = "Use this id instead of the content-derived one")]
        id: Option<String>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    #[command(about = "Show a node's type, metadata and chunk list")]
    Get { id: String },
    #[command(about = "Write a node's content to stdout")]
    Cat { id: String },
    #[command(about = "Replace a node's content and/or metadata")]
    Update {
        id: String,
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    #[command(about = "Delete a node")]
    Rm { id: String },
    #[command(about = "List node ids")]
    Ls,
    #[command(about = "Link two nodes")]
    Link {
        source: String,
        target: String,
        #[arg(long = "type", default_value = "related")]
        link_type: String,
        #[command(flatten)]
        meta: MetaArgs,
    },
    #[command(about = "List links touching a node")]
    Links { id: String },
    #[command(about = "Remove a link")]
    Unlink {
        source: String,
        target: String,
        #[arg(long = "type", default_value = "related")]
        link_type: String,
    },
    #[command(about = "Write the repository, or a subgraph, to a tar archive")]
    Export {
        #[arg(value_name = "ARCHIVE")]
        out: PathBuf,
        #[arg(long = "seed", value_name = "ID", help = "Export only around these nodes (repeatable)")]
        seeds: Vec<String>,
        #[arg(long, default_value_t = 1, help = "Link hops to follow from the seeds")]
        depth: usize,
    },
    #[command(about = "Import a tar archive")]
    Import {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,
        #[arg(long, value_enum, help = "Policy for ids that already exist")]
        on_conflict: Option<ConflictArg>,
        #[arg(long, help = "With replace, overlay archive metadata on existing metadata")]
        merge: bool,
        #[arg(long, help = "Id prefix used by the rename policy")]
        prefix: Option<String>,
    },
    #[command(about = "Verify on-disk structures")]
    Verify {
        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Full,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },
    #[command(about = "Print repository and transaction log statistics")]
    Stats,
    #[command(about = "List transactions in the log")]
    Txs {
        #[arg(long, help = "Only pending transactions")]
        pending: bool,
    },
    #[command(about = "Archive the transaction log and start a fresh one")]
    RotateLog,
    #[command(about = "Print a shell completion script")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ConflictArg {
    Skip,
    Replace,
    Rename,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Skip => ConflictPolicy::Skip,
            ConflictArg::Replace => ConflictPolicy::Replace,
            ConflictArg::Rename => ConflictPolicy::Rename,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Storage(#[from] CairnError),
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CAIRN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<i32, CliError> {
    let cli = Cli::parse();
    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "cairn", &mut io::stdout());
        return Ok(0);
    }
    let config = CliConfig::load(cli.config.clone())?;
    tracing::debug!(config = ?config.path(), "cli.config_loaded");
    let open_opts = config.open_options();
    let repo_path = cli
        .repo
        .clone()
        .or_else(|| config.default_repository().cloned())
        .ok_or_else(|| {
            CliError::Message("no repository given; pass --repo or set repository.default".into())
        })?;
    let format = cli.format;
    let ui = Ui::new(cli.theme, cli.quiet || format == OutputFormat::Json);

    match cli.command {
        Command::Init => {
            let repo = Repository::create_with_options(&repo_path, open_opts.repository_options())?;
            let header = repo.header();
            repo.close()?;
            emit(format, &header_json(&repo_path, header.created), || {
                ui.success(&format!("Initialized repository at {}", repo_path.display()))
            })?;
        }
        Command::Add {
            content,
            file,
            node_type,
            id,
            meta,
        } => {
            let bytes = match (content, file) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(path)) => fs::read(path)?,
                (None, None) => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let metadata = parse_meta(&meta)?;
            let repo = open(&repo_path, &open_opts)?;
            let id = match id {
                Some(custom) => {
                    let id = NodeId::new(custom)?;
                    repo.add_node_with_id(&id, &bytes, &node_type, &metadata)?;
                    id
                }
                None => repo.add_node(&bytes, &node_type, &metadata)?,
            };
            repo.close()?;
            emit(format, &serde_json::json!({ "id": id }), || println!("{id}"))?;
        }
        Command::Get { id } => {
            let repo = open(&repo_path, &open_opts)?;
            let node = repo.get_node(&NodeId::new(id)?)?;
            repo.close()?;
            emit(format, &node, || print_node_text(&ui, &node))?;
        }
        Command::Cat { id } => {
            let repo = open(&repo_path, &open_opts)?;
            let content = repo.get_content(&NodeId::new(id)?)?;
            repo.close()?;
            let mut out = io::stdout().lock();
            out.write_all(&content)?;
            out.flush()?;
        }
        Command::Update { id, file, meta } => {
            let id = NodeId::new(id)?;
            let content = file.map(fs::read).transpose()?;
            let metadata = if meta.pairs.is_empty() && meta.meta_json.is_none() {
                None
            } else {
                Some(parse_meta(&meta)?)
            };
            if content.is_none() && metadata.is_none() {
                return Err(CliError::Message(
                    "update needs --file and/or metadata".into(),
                ));
            }
            let repo = open(&repo_path, &open_opts)?;
            repo.update_node(&id, content.as_deref(), metadata.as_ref())?;
            repo.close()?;
            emit(format, &serde_json::json!({ "updated": id }), || {
ui.success(&format!("Updated {id}"))
            })?;
        }
        Command::Rm { id } => {
            let id = NodeId::new(id)?;
            let repo = open(&repo_path, &open_opts)?;
            repo.delete_node(&id)?;
            repo.close()?;
            emit(format, &serde_json::json!({ "deleted": id }), || {
ui.success(&format!("Deleted {id}"))
            })?;
        }
        Command::Ls => {
            let repo = open(&repo_path, &open_opts)?;
            let ids = repo.list_nodes();
            repo.close()?;
            emit(format, &ids, || {
                for id in &ids {
                    println!("{id}");
                }
            })?;
        }
        Command::Link {
            source,
            target,
            link_type,
            meta,
        } => {
            let metadata = parse_meta(&meta)?;
            let repo = open(&repo_path, &open_opts)?;
            let link = repo.add_link(
                &NodeId::new(source)?,
                &NodeId::new(target)?,
                &link_type,
                &metadata,
            )?;
            repo.close()?;
            emit(format, &link, || println!("{}", link.composite_key()))?;
        }
        Command::Links { id } => {
            let repo = open(&repo_path, &open_opts)?;
            let links = repo.get_links(&NodeId::new(id)?)?;
            repo.close()?;
            emit(format, &links, || {
                for link in &links {
                    println!("{} -[{}]-> {}", link.source, link.link_type, link.target);
                }
            })?;
        }
        Command::Unlink {
            source,
            target,
            link_type,
        } => {
            let repo = open(&repo_path, &open_opts)?;
            repo.delete_link(&NodeId::new(source)?, &NodeId::new(target)?, &link_type)?;
            repo.close()?;
            emit(format, &serde_json::json!({ "unlinked": true }), || {
ui.success("Link removed")
            })?;
        }
        Command::Export { out, seeds, depth } => {
            let scope = if seeds.is_empty() {
                ExportScope::All
            } else {
                let seeds = seeds
                    .into_iter()
                    .map(NodeId::new)
                    .collect::<Result<Vec<_>, _>>()?;
                ExportScope::Subgraph { seeds, depth }
            };
            let repo = open(&repo_path, &open_opts)?;
            let task = ui.task(format!("Exporting to {}", out.display()));
            let summary = migration::export_to_path(&repo, &scope, &out)?;
            let elapsed = task.finish();
            repo.close()?;
            emit(format, &summary, || {
                ui.success(&format!(
                    "Exported {} nodes, {} edges and {} chunks to {} in {}",
                    summary.nodes,
                    summary.edges,
                    summary.chunks,
                    out.display(),
                    format_duration(elapsed)
                ))
            })?;
        }
        Command::Import {
            archive,
            on_conflict,
            merge,
            prefix,
        } => {
            let mut opts = ImportOptions::new().merge(merge);
            if let Some(policy) = on_conflict.map(ConflictPolicy::from).or(config.conflict_policy()) {
                opts = opts.on_conflict(policy);
            }
            if let Some(prefix) = prefix.as_deref().or(config.rename_prefix()) {
                opts = opts.prefix(prefix);
            }
            let mut create = open_opts.clone();
            create.create_if_missing = true;
            let repo = open(&repo_path, &create)?;
            let task = ui.task(format!("Importing {}", archive.display()));
            let summary = migration::import_from_path(&repo, &archive, &opts)?;
            task.finish();
            repo.close()?;
            emit(format, &summary, || {
                ui.section(
                    "Import",
                    [
                        ("nodes imported", summary.nodes_imported),
                        ("nodes replaced", summary.nodes_replaced),
                        ("nodes renamed", summary.nodes_renamed),
                        ("nodes skipped", summary.nodes_skipped),
                        ("edges imported", summary.edges_imported),
                        ("edges skipped", summary.edges_skipped),
                        ("chunks stored", summary.chunks_stored),
                        ("chunks present", summary.chunks_present),
                    ],
                );
                if summary.dangling_edges > 0 {
                    ui.warn(&format!(
                        "{} edges skipped because an endpoint is missing",
                        summary.dangling_edges
                    ));
                }
            })?;
        }
        Command::Verify { level } => {
            let task = ui.task("Verifying repository");
            let report = admin::verify(&repo_path, &open_opts, level.into())?;
            task.finish();
            emit(format, &report, || {
                ui.section(
                    "Verify",
                    [
                        ("level", format!("{:?}", report.level)),
                        ("success", report.success.to_string()),
                        ("nodes", report.counts.nodes_checked.to_string()),
                        ("links", report.counts.links_checked.to_string()),
                        ("chunks", report.counts.chunks_checked.to_string()),
                        ("dangling links", report.counts.dangling_links.to_string()),
                        ("pending txs", report.counts.pending_transactions.to_string()),
                    ],
                );
                ui.list(
                    "Findings",
                    report
                        .findings
                        .iter()
                        .map(|finding| format!("{:?}: {}", finding.severity, finding.message)),
                );
            })?;
            if !report.success {
                return Ok(2);
            }
        }
        Command::Stats => {
            let report = admin::stats(&repo_path, &open_opts)?;
            emit(format, &report, || {
                let r = &report.repository;
                let files = &report.filesystem;
                ui.section(
                    "Repository",
                    [
                        ("path", files.repository_path.clone()),
                        ("size", format!("{} bytes", files.repository_size_bytes)),
                        ("created", format_nanos(r.created)),
                        ("modified", format_nanos(r.modified)),
                        ("nodes", r.node_count.to_string()),
                        ("links", r.edge_count.to_string()),
                        ("chunks", r.chunk_count.to_string()),
                    ],
                );
                let log = &report.log;
                ui.section(
                    "Transaction log",
                    [
                        ("path", files.log_path.clone()),
                        ("size", format!("{} bytes", files.log_size_bytes)),
                        ("transactions", log.transactions.to_string()),
                        ("pending", log.pending.to_string()),
                        ("committed", log.committed.to_string()),
                        ("rolled back", log.rolled_back.to_string()),
                        ("failed", log.failed.to_string()),
                    ],
                );
                if let Some(recovery) = &report.recovery {
                    ui.warn(&format!(
                        "recovered on open: {} rolled back, {} re-applied",
                        recovery.rolled_back, recovery.reapplied
                    ));
                }
            })?;
        }
        Command::Txs { pending } => {
            let repo = open(&repo_path, &open_opts)?;
            let txs: Vec<_> = repo
                .transactions()
                .into_iter()
                .filter(|tx| !pending || !tx.status.is_terminal())
                .collect();
            repo.close()?;
            emit(format, &txs, || {
                for tx in &txs {
                    println!(
                        "{} {:<9} {:?} ops={} created={}",
                        &tx.id.to_hex()[..16],
                        tx.status.to_string(),
                        tx.kind,
                        tx.operations.len(),
                        format_nanos(tx.created_at)
                    );
                }
            })?;
        }
        Command::Completions { .. } => {}
        Command::RotateLog => {
            let repo = open(&repo_path, &open_opts)?;
            let archived = repo.rotate_log()?;
            repo.close()?;
            emit(format, &serde_json::json!({ "archived": archived }), || {
ui.success(&format!("Archived transaction log to {}", archived.display()))
            })?;
        }
    }
    Ok(0)
}

fn open(path: &Path, opts: &AdminOpenOptions) -> Result<Repository, CliError> {
    Ok(admin::open_repository(path, opts)?)
}

fn parse_meta(args: &MetaArgs) -> Result<Metadata, CliError> {
    let mut meta = match &args.meta_json {
        Some(raw) => serde_json::from_str::<Metadata>(raw)?,
        None => Metadata::new(),
    };
    for pair in &args.pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            CliError::Message(format!("invalid metadata '{pair}', expected KEY=VALUE"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::Message(format!(
                "invalid metadata '{pair}', key is empty"
            )));
        }
        meta.insert(key, parse_meta_value(value));
    }
    Ok(meta)
}

fn parse_meta_value(raw: &str) -> MetaValue {
    if let Ok(int) = raw.parse::<i64>() {
        return MetaValue::Int(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        if float.is_finite() {
            return MetaValue::Float(float);
        }
    }
    match raw {
        "true" => MetaValue::Bool(true),
        "false" => MetaValue::Bool(false),
        other => MetaValue::Str(other.to_string()),
    }
}

fn format_nanos(nanos: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_else(|| nanos.to_string())
}

fn header_json(path: &Path, created: i64) -> serde_json::Value {
    serde_json::json!({
        "path": path.display().to_string(),
        "created": format_nanos(created),
    })
}

fn print_node_text(ui: &Ui, node: &Node) {
    let meta = serde_json::to_string(&node.metadata).unwrap_or_else(|_| "{}".into());
    ui.section(
        "Node",
        [
            ("id", node.id.to_string()),
            ("type", node.node_type.clone()),
            (
                "size",
                format!("{} bytes in {} chunks", node.content.len(), node.chunks.len()),
            ),
            ("created", format_nanos(node.created_at)),
            ("modified", format_nanos(node.modified_at)),
            ("metadata", meta),
        ],
    );
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), CliError>
where
    T: serde::Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
