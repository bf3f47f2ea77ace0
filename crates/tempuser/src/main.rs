use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tempuser_core::accounts::LocalAccountStore;
use tempuser_core::clock::SystemClock;
use tempuser_core::config::{TempUserConfigPatch, ToolConfig, load_config, patch_temp_user_config};
use tempuser_core::creator::{RequestContext, TempUserCreator};
use tempuser_core::migrate::{
    current_version, open_migrated_connection, pending_migration_count, run_migrations,
};
use tempuser_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready, init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use tempuser_core::serial_provider::load_shard_counters;
use tempuser_core::session::{MemorySession, Session, SqliteSessionStore};
use tempuser_core::status::CreateStatus;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tempuser",
    version,
    about = "Temporary account name allocation for a MediaWiki-style wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    #[command(about = "Acquire a temp name, stashing it in a session when one is given")]
    Acquire(AcquireArgs),
    #[command(about = "Create a temp account and log it in")]
    Create(CreateArgs),
    Stash(StashArgs),
    #[command(about = "Report whether a name is a temp or reserved name")]
    Check(CheckArgs),
    #[command(about = "Print the placeholder name shown before an account exists")]
    Placeholder,
    #[command(about = "List existing temp accounts")]
    List(ListArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .tempuser/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

#[derive(Debug, Args)]
struct AcquireArgs {
    #[arg(long, value_name = "ID")]
    session: Option<String>,
    #[arg(long, value_name = "IP")]
    ip: Option<IpAddr>,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long, value_name = "NAME", help = "Use this name instead of acquiring one")]
    name: Option<String>,
    #[arg(long, value_name = "IP")]
    ip: Option<IpAddr>,
    #[arg(long, help = "Print the status as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct StashArgs {
    #[command(subcommand)]
    command: StashSubcommand,
}

#[derive(Debug, Subcommand)]
enum StashSubcommand {
    Show {
        #[arg(long, value_name = "ID")]
        session: String,
    },
}

#[derive(Debug, Args)]
struct CheckArgs {
    name: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    Show {
        #[arg(long, help = "Print as JSON instead of TOML")]
        json: bool,
    },
    Set {
        #[arg(long, value_name = "BOOL")]
        enabled: Option<bool>,
        #[arg(long, value_name = "TEMPLATE")]
        gen_pattern: Option<String>,
        #[arg(long, value_name = "N")]
        num_shards: Option<u32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);
    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Acquire(args)) => run_acquire(&runtime, args),
        Some(Commands::Create(args)) => run_create(&runtime, args),
        Some(Commands::Stash(StashArgs {
            command: StashSubcommand::Show { session },
        })) => run_stash_show(&runtime, &session),
        Some(Commands::Check(CheckArgs { name })) => run_check(&runtime, &name),
        Some(Commands::Placeholder) => run_placeholder(&runtime),
        Some(Commands::List(args)) => run_list(&runtime, args),
        Some(Commands::Config(ConfigArgs { command })) => match command {
            ConfigSubcommand::Show { json } => run_config_show(&runtime, json),
            ConfigSubcommand::Set {
                enabled,
                gen_pattern,
                num_shards,
            } => run_config_set(
                &runtime,
                TempUserConfigPatch {
                    set_enabled: enabled,
                    set_gen_pattern: gen_pattern,
                    set_num_shards: num_shards,
                },
            ),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    println!("Initialized tempuser runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths.db_path)?;
    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("applied: {}", report.applied.len());
    for migration in &report.applied {
        println!("applied.migration: v{:03}_{}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "pending_migrations: {}",
        pending_migration_count(&paths.db_path)?
    );
    if status.db_exists {
        let connection = open_migrated_connection(&paths.db_path)?;
        println!("schema_version: {}", current_version(&connection)?);
        let counters = load_shard_counters(&connection)?;
        println!("serial.shards: {}", counters.len());
        for counter in counters {
            println!(
                "serial.shard: shard={} year={} value={}",
                counter.shard, counter.year, counter.value
            );
        }
        let accounts = LocalAccountStore::new(&paths.db_path, Arc::new(SystemClock)).stats()?;
        println!("accounts.total: {}", accounts.total);
        println!("accounts.temp: {}", accounts.temp);
    }
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_acquire(runtime: &RuntimeOptions, args: AcquireArgs) -> Result<()> {
    let (paths, config) = load_ready_runtime(runtime)?;
    let creator = build_creator(&paths, &config)?;
    if !creator.is_enabled() {
        bail!("temp account creation is disabled; set [temp_user] enabled = true");
    }

    let name = match args.session.as_deref() {
        Some(session_id) => {
            let store = SqliteSessionStore::new(&paths.db_path);
            let mut session = store.load(session_id, args.ip)?;
            creator.acquire_and_stash_name(&mut session)?
        }
        None => {
            let mut session = MemorySession::new("cli", args.ip);
            creator.acquire_and_stash_name(&mut session)?
        }
    };

    println!("acquire");
    println!("session: {}", args.session.as_deref().unwrap_or("<none>"));
    match name {
        Some(name) => println!("name: {name}"),
        None => bail!("unable to acquire a temp name (collision or throttle)"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_create(runtime: &RuntimeOptions, args: CreateArgs) -> Result<()> {
    let (paths, config) = load_ready_runtime(runtime)?;
    let creator = build_creator(&paths, &config)?;
    if !creator.is_enabled() {
        bail!("temp account creation is disabled; set [temp_user] enabled = true");
    }

    let request = RequestContext { ip: args.ip };
    let status = creator.create(args.name.as_deref(), Some(&request))?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("failed to serialize status")?
        );
    } else {
        print_status(&status);
    }
    print_diagnostics(runtime, &paths);
    if !status.is_ok() {
        bail!(
            "temp account creation failed: {}",
            status.first_error_key().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn run_stash_show(runtime: &RuntimeOptions, session_id: &str) -> Result<()> {
    let (paths, config) = load_ready_runtime(runtime)?;
    let creator = build_creator(&paths, &config)?;
    let session = SqliteSessionStore::new(&paths.db_path).load(session_id, None)?;
    println!("stash show");
    println!("session: {}", session.id());
    println!(
        "name: {}",
        creator
            .stashed_name(&session)
            .unwrap_or_else(|| "<none>".to_string())
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_check(runtime: &RuntimeOptions, name: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_tool_config(&paths)?;
    let creator = build_creator(&paths, &config)?;
    println!("check");
    println!("name: {name}");
    println!("known: {}", format_flag(creator.is_known()));
    println!("temp_name: {}", format_flag(creator.is_temp_name(name)));
    println!("reserved_name: {}", format_flag(creator.is_reserved_name(name)));
    if creator.is_known()
        && let Ok(pattern) = creator.config().match_pattern()
        && let Some(serial) = pattern.extract(name)
    {
        println!("serial_id: {serial}");
    }
    if paths.db_path.exists() {
        let account = LocalAccountStore::new(&paths.db_path, Arc::new(SystemClock)).find_account(name)?;
        println!("account_exists: {}", format_flag(account.is_some()));
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_placeholder(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_tool_config(&paths)?;
    let creator = build_creator(&paths, &config)?;
    println!("{}", creator.placeholder_name()?);
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let (paths, config) = load_ready_runtime(runtime)?;
    let creator = build_creator(&paths, &config)?;
    let patterns = creator.config().match_patterns()?;
    let store = LocalAccountStore::new(&paths.db_path, Arc::new(SystemClock));

    let mut names = Vec::new();
    for pattern in patterns {
        for name in store.list_matching(pattern, args.limit)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names.truncate(args.limit);

    println!("list");
    println!("accounts.count: {}", names.len());
    if names.is_empty() {
        println!("accounts: <none>");
    }
    for name in names {
        println!("accounts.name: {name}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_config_show(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_tool_config(&paths)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&config).context("failed to serialize config")?
        );
    } else {
        println!("# config_path: {}", normalize_path(&paths.config_path));
        print!(
            "{}",
            toml::to_string_pretty(&config).context("failed to serialize config")?
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_config_set(runtime: &RuntimeOptions, patch: TempUserConfigPatch) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let wrote = patch_temp_user_config(&paths.config_path, &patch)?;
    // Validate what was written before reporting success.
    load_tool_config(&paths)?;
    println!("config set");
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("changed: {}", format_flag(wrote));
    Ok(())
}

fn build_creator(paths: &ResolvedPaths, config: &ToolConfig) -> Result<TempUserCreator> {
    TempUserCreator::local(&paths.db_path, config, Arc::new(SystemClock))
}

fn load_tool_config(paths: &ResolvedPaths) -> Result<ToolConfig> {
    Ok(load_config(&paths.config_path)?.with_env_overrides())
}

/// Paths and config for commands that touch the database.
fn load_ready_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ToolConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    open_migrated_connection(&paths.db_path)?;
    let config = load_tool_config(&paths)?;
    Ok((paths, config))
}

fn print_status(status: &CreateStatus) {
    println!("create");
    println!("ok: {}", format_flag(status.is_ok()));
    if let Some(user) = &status.user {
        println!("user.name: {}", user.name);
        if let Some(id) = user.id {
            println!("user.id: {id}");
        }
    }
    for message in &status.errors {
        println!("error: {} {:?}", message.key, message.params);
    }
    for message in &status.warnings {
        println!("warning: {} {:?}", message.key, message.params);
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    debug!(
        project_root = %normalize_path(&paths.project_root),
        source = paths.root_source.as_str(),
        "resolved runtime paths"
    );
    Ok(paths)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
