use std::fs;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use isptar::sender::{
    merge as merge_archives, split as split_archive, FsPayloadSource, Sender, DEFAULT_BACKUP_SLICE_SIZE,
    DEFAULT_MERGE_SLICE_SIZE,
};
use isptar::{Catalog, ExcludePattern, Hook, Walker};

#[derive(Parser)]
#[command(name = "isptar", version = "1.0.0", about = "Incremental, sliced, deduplicating TAR backup tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new backup archive.
    #[command(name = "create")]
    Create {
        #[arg(short = 'c')]
        file: PathBuf,
        /// Source subtrees to walk and store, relative to `-R`.
        sources: Vec<PathBuf>,
        #[arg(short = 'S', long, default_value_t = DEFAULT_BACKUP_SLICE_SIZE)]
        size: u64,
        #[arg(short = 'B', long)]
        base: Option<PathBuf>,
        #[arg(short = 'C', long)]
        copy: bool,
        #[arg(short = 'F', long)]
        hook: Option<String>,
        #[arg(short = 'X', long = "exclude")]
        excludes: Vec<String>,
        #[arg(short = 'R', default_value = ".")]
        root: PathBuf,
        #[arg(short = 'E', long)]
        base_hook: Option<String>,
        /// Drop effective identity to this user (uid or username) before walking.
        #[arg(short = 'U', long)]
        user: Option<String>,
        /// Bracket the given path prefix with a hook script, `prefix:script`.
        #[arg(long = "backup-hook")]
        backup_hooks: Vec<String>,
    },
    /// Extract from an archive.
    #[command(name = "extract")]
    Extract {
        #[arg(short = 'x')]
        file: PathBuf,
        files: Vec<String>,
        #[arg(short = 'R', long)]
        root: Option<PathBuf>,
        #[arg(short = 'T', long)]
        to_tar: Option<PathBuf>,
        #[arg(short = 'D', long)]
        list_only: bool,
        #[arg(short = 'B', long)]
        base: Vec<PathBuf>,
        #[arg(short = 'E', long)]
        hook: Option<String>,
        /// Drop effective identity to this user (uid or username) before materializing.
        #[arg(short = 'U', long)]
        user: Option<String>,
    },
    /// Write an archive's catalog to stdout.
    #[command(name = "list")]
    List {
        #[arg(short = 'l')]
        file: PathBuf,
        #[arg(short = 'E', long)]
        hook: Option<String>,
    },
    /// Extract catalog and trailer into a standalone gzip TAR.
    #[command(name = "isolate")]
    Isolate {
        #[arg(short = 'i')]
        file: PathBuf,
        out: PathBuf,
        #[arg(short = 'E', long)]
        hook: Option<String>,
    },
    /// Fuse several archives into one.
    #[command(name = "merge")]
    Merge {
        #[arg(short = 'm')]
        file: PathBuf,
        /// Source archives, each optionally followed by `:name` to record
        /// in the `parts` trailer field.
        sources: Vec<String>,
        #[arg(short = 'S', long, default_value_t = DEFAULT_MERGE_SLICE_SIZE)]
        size: u64,
        #[arg(short = 'F', long)]
        hook: Option<String>,
    },
    /// Reverse a merge.
    #[command(name = "split")]
    Split {
        #[arg(short = 'p')]
        file: PathBuf,
        prefix: Option<PathBuf>,
        #[arg(short = 'S', long, default_value_t = DEFAULT_MERGE_SLICE_SIZE)]
        size: u64,
        #[arg(short = '1', long = "single-part")]
        single_part: bool,
        #[arg(short = 'F', long)]
        hook: Option<String>,
    },
    /// Walk a tree and stream entries to stdout (client half of client/server).
    #[command(name = "client")]
    Client {
        sources: Vec<PathBuf>,
        #[arg(short = 'R', default_value = ".")]
        root: PathBuf,
        #[arg(short = 'X', long = "exclude")]
        excludes: Vec<String>,
        /// Drop effective identity to this user (uid or username) before walking.
        #[arg(short = 'U', long)]
        user: Option<String>,
        /// Bracket the given path prefix with a hook script, `prefix:script`.
        #[arg(long = "backup-hook")]
        backup_hooks: Vec<String>,
    },
    /// Receive a stream on stdin and write an archive (server half).
    #[command(name = "server")]
    Server {
        #[arg(short = 's')]
        file: PathBuf,
        #[arg(short = 'S', long, default_value_t = DEFAULT_BACKUP_SLICE_SIZE)]
        size: u64,
        #[arg(short = 'B', long)]
        base: Option<PathBuf>,
        #[arg(short = 'C', long)]
        copy: bool,
        #[arg(short = 'F', long)]
        hook: Option<String>,
        /// Drop effective identity to this user (uid or username) before receiving.
        #[arg(short = 'U', long)]
        user: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "isptar failed");
        eprintln!("isptar: {e}");
        std::process::exit(1);
    }
}

fn run() -> isptar::Result<()> {
    match Cli::parse().command {
        Commands::Create { file, sources, size, base, copy, hook, excludes, root, base_hook, user, backup_hooks } => {
            cmd_create(file, sources, size, base, copy, hook, excludes, root, base_hook, user, backup_hooks)
        }
        Commands::Extract { file, files, root, to_tar, list_only, base, hook, user } => {
            cmd_extract(file, files, root, to_tar, list_only, base, hook, user)
        }
        Commands::List { file, hook } => cmd_list(file, hook),
        Commands::Isolate { file, out, hook } => cmd_isolate(file, out, hook),
        Commands::Merge { file, sources, size, hook } => cmd_merge(file, sources, size, hook),
        Commands::Split { file, prefix, size, single_part, hook } => {
            cmd_split(file, prefix, size, single_part, hook)
        }
        Commands::Client { sources, root, excludes, user, backup_hooks } => {
            cmd_client(sources, root, excludes, user, backup_hooks)
        }
        Commands::Server { file, size, base, copy, hook, user } => cmd_server(file, size, base, copy, hook, user),
    }
}

fn parse_hook(template: Option<String>) -> Option<Hook> {
    template.map(Hook::new)
}

fn walker_for(excludes: &[String], backup_hooks: &[String]) -> isptar::Result<Walker> {
    let mut walker = Walker::new();
    for pattern in excludes {
        walker.add_exclude(ExcludePattern::new(pattern.clone()));
    }
    for spec in backup_hooks {
        let (prefix, script) = spec
            .split_once(':')
            .ok_or_else(|| isptar::Error::usage(format!("backup hook `{spec}` is not `prefix:script`")))?;
        walker.add_backup_hook(isptar::BackupHook { prefix: prefix.to_string(), hook: Hook::new(script) });
    }
    Ok(walker)
}

fn cmd_create(
    file: PathBuf,
    sources: Vec<PathBuf>,
    size: u64,
    base: Option<PathBuf>,
    copy: bool,
    hook: Option<String>,
    excludes: Vec<String>,
    root: PathBuf,
    base_hook: Option<String>,
    user: Option<String>,
    backup_hooks: Vec<String>,
) -> isptar::Result<()> {
    let span = tracing::info_span!("create", file = %file.display());
    let _enter = span.enter();

    let base_catalog = match base {
        Some(path) => Some(Catalog::open(path, parse_hook(base_hook), None)?),
        None => None,
    };

    let mut sender = Sender::create(&file, size, parse_hook(hook), base_catalog, !copy)?;
    let mut walker = walker_for(&excludes, &backup_hooks)?;
    let mut source = FsPayloadSource::new(&root);

    if let Some(user) = &user {
        isptar::privilege::drop_to_user(user)?;
    }

    let mut records = Vec::new();
    for subtree in &sources {
        let abs = root.join(subtree);
        records.extend(walker.walk(&abs)?);
    }
    isptar::walk::sort_records(&mut records);

    for record in &records {
        tracing::debug!(filename = %record.filename, "sending entry");
        sender.send(record.clone(), &mut source)?;
    }

    if user.is_some() {
        nix::unistd::seteuid(nix::unistd::getuid())?;
    }

    sender.finish(Vec::new())?;
    println!("Created: {}", file.display());
    Ok(())
}

fn cmd_extract(
    file: PathBuf,
    filter: Vec<String>,
    root: Option<PathBuf>,
    to_tar: Option<PathBuf>,
    list_only: bool,
    bases: Vec<PathBuf>,
    hook: Option<String>,
    user: Option<String>,
) -> isptar::Result<()> {
    let hook = parse_hook(hook);
    if root.is_some() {
        if let Some(user) = &user {
            isptar::privilege::drop_to_user(user)?;
        }
    }
    let mut base: Option<Box<Catalog>> = None;
    for path in bases.into_iter().rev() {
        base = Some(Box::new(Catalog::open(path, hook.clone(), base)?));
    }
    let mut catalog = Catalog::open(&file, hook, base)?;

    let want = |name: &str| filter.is_empty() || filter.iter().any(|f| f == name);
    let mut dirs = None;
    let mut tar_out = match &to_tar {
        Some(path) => Some(BufWriter::new(fs::File::create(path)?)),
        None => None,
    };
    let mut tar_writer = tar_out.as_mut().map(isptar::tar::TarWriter::new);

    while let Some(entry) = catalog.next_entry()? {
        if !want(&entry.record.filename) {
            continue;
        }
        if list_only {
            println!("{}", entry.raw_line);
            continue;
        }

        let payload = match (entry.record.kind, entry.locator) {
            (isptar::record::Kind::File, Some(locator)) if entry.record.size > 0 => {
                Some(catalog.open_payload(&locator)?)
            }
            _ => None,
        };

        if let Some(writer) = tar_writer.as_mut() {
            writer.add(&entry.record)?;
            if let Some(mut reader) = payload {
                let mut buf = vec![0u8; entry.record.size as usize];
                reader.read_exact(&mut buf)?;
                writer.write_data(&buf)?;
            }
            writer.write_tail(false)?;
            continue;
        }

        if let Some(root) = &root {
            let fd = entry.record.materialize(root, &mut dirs)?;
            if let (isptar::record::Kind::File, Some(mut reader), Some(fd)) = (entry.record.kind, payload, fd) {
                let mut out = fs::File::from(fd);
                io::copy(&mut reader, &mut out)?;
            }
        }
    }

    if let Some(mut writer) = tar_writer.take() {
        writer.write_tail(true)?;
    }
    Ok(())
}

fn cmd_list(file: PathBuf, hook: Option<String>) -> isptar::Result<()> {
    let mut catalog = Catalog::open(file, parse_hook(hook), None)?;
    while let Some(entry) = catalog.next_entry()? {
        println!("{}", entry.raw_line);
    }
    Ok(())
}

fn cmd_isolate(file: PathBuf, out: PathBuf, hook: Option<String>) -> isptar::Result<()> {
    let mut catalog = Catalog::open(&file, parse_hook(hook), None)?;
    let mut out_writer = BufWriter::new(fs::File::create(&out)?);
    let mut tar = isptar::tar::TarWriter::new(&mut out_writer);

    let mut listing_text = String::new();
    while let Some(entry) = catalog.next_entry()? {
        listing_text.push_str(&entry.raw_line);
        listing_text.push('\n');
    }

    let info = isptar::FileRecord {
        filename: ".backup.listing".to_string(),
        mode: 0o400,
        kind: isptar::Kind::File,
        size: listing_text.len() as u64,
        ..Default::default()
    };
    tar.add(&info)?;
    tar.write_data(listing_text.as_bytes())?;
    tar.write_tail(true)?;
    Ok(())
}

fn cmd_merge(file: PathBuf, sources: Vec<String>, size: u64, hook: Option<String>) -> isptar::Result<()> {
    let hook = parse_hook(hook);
    let mut parsed = Vec::new();
    for spec in sources {
        let (path, name) = match spec.split_once(':') {
            Some((path, name)) => (PathBuf::from(path), name.to_string()),
            None => {
                let name = Path::new(&spec)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| spec.clone());
                (PathBuf::from(&spec), name)
            }
        };
        let catalog = Catalog::open(path, hook.clone(), None)?;
        parsed.push((catalog, name));
    }
    merge_archives(&file, size, hook, parsed)?;
    println!("Merged into: {}", file.display());
    Ok(())
}

fn cmd_split(
    file: PathBuf,
    prefix: Option<PathBuf>,
    size: u64,
    single_part: bool,
    hook: Option<String>,
) -> isptar::Result<()> {
    let hook = parse_hook(hook);
    let catalog = Catalog::open(&file, hook.clone(), None)?;
    let prefix = prefix.unwrap_or_else(|| file.clone());
    let name_for_part = move |index: usize, logical_name: &str| -> PathBuf {
        let mut name = prefix.as_os_str().to_os_string();
        name.push(format!(".{index}.{logical_name}"));
        PathBuf::from(name)
    };
    split_archive(catalog, name_for_part, size, hook, single_part)
}

fn cmd_client(
    sources: Vec<PathBuf>,
    root: PathBuf,
    excludes: Vec<String>,
    user: Option<String>,
    backup_hooks: Vec<String>,
) -> isptar::Result<()> {
    let mut walker = walker_for(&excludes, &backup_hooks)?;
    if let Some(user) = &user {
        isptar::privilege::drop_to_user(user)?;
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut out = stdout.lock();

    for subtree in &sources {
        isptar::proto::run_client(&mut walker, &root.join(subtree), &mut input, &mut out)?;
    }
    Ok(())
}

fn cmd_server(
    file: PathBuf,
    size: u64,
    base: Option<PathBuf>,
    copy: bool,
    hook: Option<String>,
    user: Option<String>,
) -> isptar::Result<()> {
    let hook = parse_hook(hook);
    let base_catalog = match base {
        Some(path) => Some(Catalog::open(path, hook.clone(), None)?),
        None => None,
    };
    let mut sender = Sender::create(&file, size, hook, base_catalog, !copy)?;
    if let Some(user) = &user {
        isptar::privilege::drop_to_user(user)?;
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut reply = stdout.lock();
    isptar::proto::run_server(&mut sender, &mut input, &mut reply)?;
    sender.finish(Vec::new())?;
    Ok(())
}
