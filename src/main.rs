use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use dot::commands;
use dot::context::{self, AppContext};
use dot::doctor::{DoctorConfig, ScanMode, TriageMode};
use dot::fs_utils;
use dot::paths::{FilePath, TargetPath};
use dot::planner::ConflictPolicy;

#[derive(Parser)]
#[command(name = "dot")]
#[command(version, about = "A transactional dotfiles manager with folding links and health checks", long_about = None)]
struct Cli {
    /// Package directory (defaults to $XDG_DATA_HOME/dot/dotfiles, then the current directory)
    #[arg(short = 'd', long, global = true, value_name = "DIR")]
    dir: Option<Utf8PathBuf>,

    /// Target directory (defaults to the home directory)
    #[arg(short = 't', long, global = true, value_name = "DIR")]
    target: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum OnConflict {
    #[default]
    Fail,
    Backup,
    Overwrite,
    Skip,
}

impl From<OnConflict> for ConflictPolicy {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Fail => ConflictPolicy::Fail,
            OnConflict::Backup => ConflictPolicy::Backup,
            OnConflict::Overwrite => ConflictPolicy::Overwrite,
            OnConflict::Skip => ConflictPolicy::Skip,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ScanModeArg {
    Off,
    #[default]
    Scoped,
    Deep,
}

impl From<ScanModeArg> for ScanMode {
    fn from(value: ScanModeArg) -> Self {
        match value {
            ScanModeArg::Off => ScanMode::Off,
            ScanModeArg::Scoped => ScanMode::Scoped,
            ScanModeArg::Deep => ScanMode::Deep,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TriageArg {
    /// One prompt per category of orphan
    Category,
    /// One prompt per link
    Links,
    /// Silently ignore high-confidence matches
    Auto,
}

impl From<TriageArg> for TriageMode {
    fn from(value: TriageArg) -> Self {
        match value {
            TriageArg::Category => TriageMode::ByCategory,
            TriageArg::Links => TriageMode::PerLink,
            TriageArg::Auto => TriageMode::AutoIgnore,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install symlinks for packages (all packages when none are named)
    #[command(visible_aliases = ["link", "install"])]
    Manage {
        packages: Vec<String>,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,

        /// What to do when an existing entry is in the way
        #[arg(long, value_enum, default_value_t)]
        on_conflict: OnConflict,

        /// Always link per-file, never per-directory
        #[arg(long)]
        no_folding: bool,

        /// Install each package under its own (translated) name
        #[arg(long)]
        map_package_names: bool,
    },

    /// Remove the symlinks of installed packages
    #[command(visible_aliases = ["unlink", "remove", "rm"])]
    Unmanage {
        packages: Vec<String>,

        /// Move recorded backups back into place
        #[arg(long)]
        restore: bool,

        /// Also delete the package directory
        #[arg(long)]
        purge: bool,

        /// Drop manifest records whose links are already gone
        #[arg(long)]
        cleanup: bool,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-sync packages whose content changed since the last run
    Remanage {
        packages: Vec<String>,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Move existing target files into a package and link them back
    Adopt {
        /// Package to adopt into
        package: String,

        /// Paths to adopt
        #[arg(required = true)]
        paths: Vec<String>,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Show installed packages and their health
    #[command(visible_alias = "list")]
    Status {
        /// Re-verify every recorded link
        #[arg(long)]
        verify: bool,
    },

    /// Check every link and scan for orphans
    Doctor {
        /// Orphan scan mode
        #[arg(long, value_enum, default_value_t)]
        scan: ScanModeArg,

        /// Apply automated fixes
        #[arg(long)]
        fix: bool,

        /// Print the fix plan without applying it
        #[arg(long)]
        dry_run: bool,

        /// Classify orphans and record ignore decisions
        #[arg(long, value_enum)]
        triage: Option<TriageArg>,

        /// Stop after this many issues
        #[arg(long, value_name = "N")]
        max_issues: Option<usize>,

        /// Scan worker count
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Directory depth limit for --scan deep
        #[arg(long, value_name = "N")]
        depth: Option<usize>,
    },

    /// Install the packages a bootstrap profile selects
    Bootstrap {
        /// Profile name from .dotbootstrap.yaml
        #[arg(long)]
        profile: Option<String>,

        /// Write a starter .dotbootstrap.yaml instead of applying one
        #[arg(long)]
        init: bool,

        /// What to do when an existing entry is in the way
        #[arg(long, value_enum, default_value_t)]
        on_conflict: OnConflict,
    },
}

fn resolve_dirs(cli: &Cli) -> anyhow::Result<(FilePath, TargetPath)> {
    let target = match &cli.target {
        Some(dir) => fs_utils::resolve_user_path(dir.as_str())?,
        None => context::home_dir()?,
    };
    let package = match &cli.dir {
        Some(dir) => fs_utils::resolve_user_path(dir.as_str())?,
        None => {
            let data = context::data_dir()?.join("dotfiles");
            if data.as_std_path().is_dir() {
                data
            } else {
                fs_utils::resolve_user_path(".")?
            }
        }
    };
    Ok((FilePath::new(package)?, TargetPath::new(target)?))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (package_dir, target_dir) = resolve_dirs(&cli)?;
    let mut ctx = AppContext::new(package_dir, target_dir);

    match cli.command {
        Commands::Manage {
            packages,
            dry_run,
            on_conflict,
            no_folding,
            map_package_names,
        } => {
            ctx.dry_run = dry_run;
            ctx.policy = on_conflict.into();
            ctx.folding = !no_folding;
            ctx.package_name_mapping = map_package_names;
            if dry_run {
                println!("{} {}\n", "Managing".bold(), "[DRY RUN]".yellow().bold());
            }
            commands::manage(&ctx, &packages)
        }
        Commands::Unmanage {
            packages,
            restore,
            purge,
            cleanup,
            dry_run,
        } => {
            ctx.dry_run = dry_run;
            commands::unmanage(
                &ctx,
                &packages,
                commands::UnmanageOptions {
                    restore,
                    purge,
                    cleanup,
                },
            )
        }
        Commands::Remanage { packages, dry_run } => {
            ctx.dry_run = dry_run;
            commands::remanage(&ctx, &packages)
        }
        Commands::Adopt {
            package,
            paths,
            dry_run,
        } => {
            ctx.dry_run = dry_run;
            commands::adopt(&ctx, &paths, &package)
        }
        Commands::Status { verify } => {
            commands::status(&ctx, commands::StatusOptions { verify })
        }
        Commands::Doctor {
            scan,
            fix,
            dry_run,
            triage,
            max_issues,
            workers,
            depth,
        } => {
            ctx.dry_run = dry_run;
            let mut config = DoctorConfig {
                scan: scan.into(),
                ..DoctorConfig::default()
            };
            if let Some(n) = max_issues {
                config.max_issues = n;
            }
            if let Some(n) = workers {
                config.workers = n;
            }
            if let Some(n) = depth {
                config.max_depth = n;
            }
            let code = commands::doctor(
                &ctx,
                commands::DoctorOptions {
                    config,
                    fix,
                    triage: triage.map(Into::into),
                },
            )?;
            std::process::exit(code);
        }
        Commands::Bootstrap {
            profile,
            init,
            on_conflict,
        } => {
            ctx.policy = on_conflict.into();
            if init {
                commands::bootstrap_init(&ctx)
            } else {
                commands::bootstrap_apply(&ctx, profile.as_deref())
            }
        }
    }
}
