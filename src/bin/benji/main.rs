// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! Command-line entry point.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use benji::backup::BackupRequest;
use benji::restore::RestoreRequest;
use benji::version::{Version, VersionUid};
use benji::{cleanup, scrub, Config, Repository, Result};

mod log;

#[derive(Debug, Parser)]
#[command(
    name = "benji",
    about = "Block-level, content-addressed, deduplicating backup",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Use a non-default configuration file.
    #[arg(long, short = 'c', global = true)]
    config_file: Option<PathBuf>,

    /// Machine-readable JSON output on stdout; logs stay on stderr.
    #[arg(long, short = 'm', global = true)]
    machine_output: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up an image.
    Backup {
        /// Source URI, e.g. file:/dev/vg0/lv0.
        source: String,
        /// Volume name the version is filed under.
        volume: String,
        /// Snapshot name recorded in the version.
        #[arg(long, short = 's', default_value = "")]
        snapshot: String,
        /// Use this version UID instead of generating one.
        #[arg(long, short = 'u')]
        uid: Option<VersionUid>,
        /// Base version for a differential backup.
        #[arg(long, short = 'r')]
        base_version: Option<VersionUid>,
        /// JSON hints file (rbd diff --format=json compatible).
        #[arg(long)]
        rbd_hints: Option<PathBuf>,
        /// Block size for this version in bytes.
        #[arg(long)]
        block_size: Option<u32>,
        /// Target storage; defaults to the configured default storage.
        #[arg(long, short = 'S')]
        storage: Option<String>,
        /// Labels for the new version, name=value.
        #[arg(long, short = 'l')]
        label: Vec<String>,
    },

    /// Restore a version into an image.
    Restore {
        version_uid: VersionUid,
        /// Target URI, e.g. file:/tmp/restored.img.
        target: String,
        /// Skip sparse blocks instead of writing zeros.
        #[arg(long, short = 's')]
        sparse: bool,
        /// Overwrite an existing target.
        #[arg(long, short = 'f')]
        force: bool,
        /// Restore from the version metadata backup on the storage instead
        /// of the database.
        #[arg(long, short = 'M')]
        database_less: bool,
        /// Storage holding the metadata backup (with --database-less).
        #[arg(long, short = 'S')]
        storage: Option<String>,
    },

    /// List versions.
    Ls {
        /// Filter expression, e.g. volume == 'data' and status == 'valid'.
        filter_expression: Option<String>,
    },

    /// Remove versions.
    Rm {
        #[arg(required = true)]
        version_uids: Vec<VersionUid>,
        /// Remove even young, incomplete, or freshly written versions.
        #[arg(long, short = 'f')]
        force: bool,
        /// Keep the version metadata backup on the storage.
        #[arg(long)]
        keep_metadata_backup: bool,
        /// Remove a stale lock before acquiring.
        #[arg(long)]
        override_lock: bool,
    },

    /// Delete unreferenced block objects past the grace window.
    Cleanup {
        /// Grace window in minutes; defaults to the configured value.
        #[arg(long)]
        grace: Option<u64>,
        /// Enumerate all objects and delete every unreferenced one.
        #[arg(long)]
        full: bool,
        /// Storage to sweep (with --full); defaults to the default storage.
        #[arg(long, short = 'S')]
        storage: Option<String>,
        /// Remove a stale lock before acquiring.
        #[arg(long)]
        override_lock: bool,
    },

    /// Protect versions from removal.
    Protect {
        #[arg(required = true)]
        version_uids: Vec<VersionUid>,
    },

    /// Remove removal protection.
    Unprotect {
        #[arg(required = true)]
        version_uids: Vec<VersionUid>,
    },

    /// Set (name=value) or remove (name-) labels on a version.
    Label {
        version_uid: VersionUid,
        #[arg(required = true)]
        labels: Vec<String>,
    },

    /// Verify object existence and metadata of a version.
    Scrub {
        version_uid: VersionUid,
        /// Check only this percentage of blocks.
        #[arg(long, short = 'p', default_value_t = 100)]
        block_percentage: u8,
    },

    /// Fetch, decode, and re-hash a version's blocks.
    DeepScrub {
        version_uid: VersionUid,
        /// Compare against this live source as well.
        #[arg(long, short = 's')]
        source: Option<String>,
        /// Check only this percentage of blocks.
        #[arg(long, short = 'p', default_value_t = 100)]
        block_percentage: u8,
    },

    /// Scrub a sampled set of versions matching a filter.
    BatchScrub {
        filter_expression: Option<String>,
        #[arg(long, short = 'P', default_value_t = 100)]
        version_percentage: u8,
        #[arg(long, short = 'p', default_value_t = 100)]
        block_percentage: u8,
    },

    /// Deep-scrub a sampled set of versions matching a filter.
    BatchDeepScrub {
        filter_expression: Option<String>,
        #[arg(long, short = 'P', default_value_t = 100)]
        version_percentage: u8,
        #[arg(long, short = 'p', default_value_t = 100)]
        block_percentage: u8,
    },

    /// Export version metadata as JSON.
    MetadataExport {
        filter_expression: Option<String>,
        /// Output file; stdout when omitted.
        #[arg(long, short = 'o')]
        output_file: Option<PathBuf>,
        /// Overwrite an existing output file.
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Import version metadata from JSON.
    MetadataImport {
        /// Input file; stdin when omitted.
        input_file: Option<PathBuf>,
    },

    /// Back up version metadata to the storage.
    MetadataBackup {
        filter_expression: String,
        /// Overwrite existing metadata backups.
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Restore version metadata from the storage.
    MetadataRestore {
        #[arg(required = true)]
        version_uids: Vec<VersionUid>,
        #[arg(long, short = 'S')]
        storage: Option<String>,
    },

    /// List version metadata backups on a storage.
    MetadataLs {
        #[arg(long, short = 'S')]
        storage: Option<String>,
    },

    /// Apply a retention policy and remove versions outside the kept set.
    Enforce {
        /// Policy such as latest3,hours24,days30.
        rules_spec: String,
        filter_expression: Option<String>,
        /// Only show what would be removed.
        #[arg(long)]
        dry_run: bool,
        /// Keep the version metadata backups of removed versions.
        #[arg(long)]
        keep_metadata_backup: bool,
    },

    /// Show object count and total bytes of a storage.
    StorageStats {
        #[arg(long, short = 'S')]
        storage: Option<String>,
    },

    /// Show per-storage exclusive and shared space of matching versions.
    StorageUsage {
        filter_expression: Option<String>,
    },

    /// Initialize the database schema.
    DatabaseInit,

    /// Migrate the database schema to the current revision.
    DatabaseMigrate,

    /// Serve versions as NBD devices.
    Nbd {
        /// Bind address.
        #[arg(long, short = 'a', default_value = "127.0.0.1")]
        bind_address: String,
        /// Bind port.
        #[arg(long, short = 'p', default_value_t = 10809)]
        bind_port: u16,
        /// Allow writes; they are fixated into new versions on disconnect.
        #[arg(long)]
        read_write: bool,
        /// Discard all changes on disconnect instead of fixating them.
        #[arg(long)]
        discard_changes: bool,
    },

    /// Show program version information.
    VersionInfo,
}

fn print_versions(versions: &[Version], repo: &Repository, machine: bool) -> Result<()> {
    if machine {
        let documents: Vec<serde_json::Value> = versions
            .iter()
            .map(|v| -> Result<serde_json::Value> {
                Ok(serde_json::json!({
                    "uid": v.uid.to_string(),
                    "date": v.date.format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default(),
                    "volume": v.volume,
                    "snapshot": v.snapshot,
                    "size": v.size,
                    "block_size": v.block_size,
                    "storage": repo.db().storage_name(v.storage_id)?,
                    "status": v.status.as_str(),
                    "protected": v.protected,
                    "bytes_read": v.bytes_read,
                    "bytes_written": v.bytes_written,
                    "bytes_deduplicated": v.bytes_deduplicated,
                    "bytes_sparse": v.bytes_sparse,
                    "duration": v.duration,
                    "labels": v.labels,
                }))
            })
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&documents)?);
        return Ok(());
    }
    for v in versions {
        let labels = v
            .labels
            .iter()
            .map(|(k, val)| format!("{}={}", k, val))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{}  {}  {:10}  {:>14}  {:8}  {}  {}  {}",
            v.uid,
            v.date
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            v.volume,
            v.size,
            v.status.as_str(),
            if v.protected { "protected" } else { "-" },
            repo.db().storage_name(v.storage_id)?,
            labels,
        );
    }
    Ok(())
}

fn run(args: &Args) -> Result<bool> {
    let config = Config::load(args.config_file.as_deref())?;
    let machine = args.machine_output;

    match &args.command {
        Command::DatabaseInit => {
            Repository::init_database(&config)?;
            return Ok(true);
        }
        Command::DatabaseMigrate => {
            Repository::migrate_database(&config)?;
            return Ok(true);
        }
        Command::VersionInfo => {
            if machine {
                println!(
                    "{}",
                    serde_json::json!({
                        "version": benji::VERSION,
                        "metadata_version": benji::export::METADATA_VERSION,
                        "object_metadata_version": benji::storage::METADATA_VERSION,
                    })
                );
            } else {
                println!("benji {}", benji::VERSION);
            }
            return Ok(true);
        }
        _ => {}
    }

    let repo = Repository::open(config)?;
    match &args.command {
        Command::Backup {
            source,
            volume,
            snapshot,
            uid,
            base_version,
            rbd_hints,
            block_size,
            storage,
            label,
        } => {
            let hints = match rbd_hints {
                Some(path) => {
                    let raw = std::fs::read_to_string(path).map_err(|source| {
                        benji::Error::Io {
                            path: path.display().to_string(),
                            source,
                        }
                    })?;
                    Some(benji::io::parse_hints(&raw)?)
                }
                None => None,
            };
            let labels = label
                .iter()
                .map(|l| {
                    l.split_once('=')
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                        .ok_or_else(|| benji::Error::InvalidInput {
                            reason: format!("invalid label {:?}, expected name=value", l),
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let version = benji::backup::backup(
                &repo,
                BackupRequest {
                    source: source.clone(),
                    volume: volume.clone(),
                    snapshot: snapshot.clone(),
                    uid: *uid,
                    base_version_uid: *base_version,
                    hints,
                    block_size: *block_size,
                    storage_name: storage.clone(),
                    labels,
                },
            )?;
            print_versions(&[version], &repo, machine)?;
        }
        Command::Restore {
            version_uid,
            target,
            sparse,
            force,
            database_less,
            storage,
        } => {
            benji::restore::restore(
                &repo,
                RestoreRequest {
                    version_uid: *version_uid,
                    target: target.clone(),
                    sparse: *sparse,
                    force: *force,
                    database_less: *database_less,
                    storage_name: storage.clone(),
                },
            )?;
        }
        Command::Ls { filter_expression } => {
            let versions = repo.versions_with_filter(filter_expression.as_deref())?;
            print_versions(&versions, &repo, machine)?;
        }
        Command::Rm {
            version_uids,
            force,
            keep_metadata_backup,
            override_lock,
        } => {
            for &uid in version_uids {
                cleanup::rm(&repo, uid, *force, *keep_metadata_backup, *override_lock)?;
            }
        }
        Command::Cleanup {
            grace,
            full,
            storage,
            override_lock,
        } => {
            if *full {
                cleanup::cleanup_full(&repo, storage.as_deref(), *override_lock)?;
            } else {
                cleanup::cleanup(&repo, *grace, *override_lock)?;
            }
        }
        Command::Protect { version_uids } => {
            for &uid in version_uids {
                repo.protect(uid, true)?;
            }
        }
        Command::Unprotect { version_uids } => {
            for &uid in version_uids {
                repo.protect(uid, false)?;
            }
        }
        Command::Label {
            version_uid,
            labels,
        } => {
            repo.label(*version_uid, labels)?;
        }
        Command::Scrub {
            version_uid,
            block_percentage,
        } => {
            scrub::scrub(&repo, *version_uid, *block_percentage, None)?;
        }
        Command::DeepScrub {
            version_uid,
            source,
            block_percentage,
        } => {
            scrub::deep_scrub(
                &repo,
                *version_uid,
                *block_percentage,
                source.as_deref(),
                None,
            )?;
        }
        Command::BatchScrub {
            filter_expression,
            version_percentage,
            block_percentage,
        } => {
            let result = scrub::batch_scrub(
                &repo,
                filter_expression.as_deref(),
                *version_percentage,
                *block_percentage,
            )?;
            report_batch(&result, machine)?;
            if !result.errors.is_empty() {
                return Ok(false);
            }
        }
        Command::BatchDeepScrub {
            filter_expression,
            version_percentage,
            block_percentage,
        } => {
            let result = scrub::batch_deep_scrub(
                &repo,
                filter_expression.as_deref(),
                *version_percentage,
                *block_percentage,
            )?;
            report_batch(&result, machine)?;
            if !result.errors.is_empty() {
                return Ok(false);
            }
        }
        Command::MetadataExport {
            filter_expression,
            output_file,
            force,
        } => {
            let versions = repo.versions_with_filter(filter_expression.as_deref())?;
            let uids: Vec<VersionUid> = versions.iter().map(|v| v.uid).collect();
            match output_file {
                Some(path) => {
                    if path.exists() && !force {
                        return Err(benji::Error::PolicyViolation {
                            reason: format!(
                                "output file {} exists, use --force to overwrite it",
                                path.display()
                            ),
                        });
                    }
                    let mut file = std::fs::File::create(path).map_err(|source| {
                        benji::Error::Io {
                            path: path.display().to_string(),
                            source,
                        }
                    })?;
                    repo.metadata_export(&uids, &mut file)?;
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut handle = stdout.lock();
                    repo.metadata_export(&uids, &mut handle)?;
                    handle.write_all(b"\n").ok();
                }
            }
        }
        Command::MetadataImport { input_file } => {
            let raw = match input_file {
                Some(path) => std::fs::read_to_string(path).map_err(|source| {
                    benji::Error::Io {
                        path: path.display().to_string(),
                        source,
                    }
                })?,
                None => {
                    let mut raw = String::new();
                    std::io::Read::read_to_string(&mut std::io::stdin(), &mut raw)
                        .map_err(|source| benji::Error::Io {
                            path: "stdin".to_owned(),
                            source,
                        })?;
                    raw
                }
            };
            repo.metadata_import(&raw)?;
        }
        Command::MetadataBackup {
            filter_expression,
            force,
        } => {
            let versions = repo.versions_with_filter(Some(filter_expression))?;
            let uids: Vec<VersionUid> = versions.iter().map(|v| v.uid).collect();
            repo.metadata_backup(&uids, *force)?;
        }
        Command::MetadataRestore {
            version_uids,
            storage,
        } => {
            repo.metadata_restore(version_uids, storage.as_deref())?;
        }
        Command::MetadataLs { storage } => {
            let uids = repo.metadata_ls(storage.as_deref())?;
            if machine {
                let list: Vec<String> = uids.iter().map(|u| u.to_string()).collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for uid in uids {
                    println!("{}", uid);
                }
            }
        }
        Command::Enforce {
            rules_spec,
            filter_expression,
            dry_run,
            keep_metadata_backup,
        } => {
            let removed = repo.enforce(
                filter_expression.as_deref(),
                rules_spec,
                *dry_run,
                *keep_metadata_backup,
            )?;
            if machine {
                let list: Vec<String> = removed.iter().map(|u| u.to_string()).collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            }
        }
        Command::StorageStats { storage } => {
            let (objects, bytes) = repo.storage_stats(storage.as_deref())?;
            if machine {
                println!(
                    "{}",
                    serde_json::json!({"objects": objects, "bytes": bytes})
                );
            } else {
                println!("{} objects, {} bytes", objects, bytes);
            }
        }
        Command::StorageUsage { filter_expression } => {
            let usage = repo.storage_usage(filter_expression.as_deref())?;
            if machine {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else {
                for (storage, usage) in usage {
                    println!(
                        "{}: {} bytes exclusive, {} bytes shared",
                        storage, usage.exclusive, usage.shared
                    );
                }
            }
        }
        Command::Nbd {
            bind_address,
            bind_port,
            read_write,
            discard_changes,
        } => {
            let addr = SocketAddr::from_str(&format!("{}:{}", bind_address, bind_port))
                .map_err(|_| benji::Error::InvalidInput {
                    reason: format!("invalid bind address {}:{}", bind_address, bind_port),
                })?;
            if *read_write && !benji::experimental_enabled() {
                tracing::warn!(
                    "read-write NBD exports are experimental, set BENJI_EXPERIMENTAL=1 to \
                     silence this warning"
                );
            }
            let server =
                benji::nbd::NbdServer::new(Arc::new(repo), !*read_write, *discard_changes)?;
            server.serve(addr)?;
        }
        Command::DatabaseInit | Command::DatabaseMigrate | Command::VersionInfo => {
            unreachable!("handled before opening the repository")
        }
    }
    Ok(true)
}

fn report_batch(result: &scrub::BatchScrubResult, machine: bool) -> Result<()> {
    if machine {
        println!(
            "{}",
            serde_json::json!({
                "considered": result.considered.iter().map(|u| u.to_string())
                    .collect::<Vec<_>>(),
                "errors": result.errors.iter().map(|u| u.to_string())
                    .collect::<Vec<_>>(),
            })
        );
    } else if !result.errors.is_empty() {
        for uid in &result.errors {
            println!("scrub failed: {}", uid);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = match args.log_level.as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        other => {
            eprintln!("unknown log level {:?}", other);
            return ExitCode::FAILURE;
        }
    };

    // The log file comes from the configuration, which needs parsing first;
    // a configuration error is reported on plain stderr.
    let log_file = args
        .config_file
        .as_deref()
        .map(|p| Config::load(Some(p)))
        .or_else(|| Some(Config::load(None)))
        .and_then(|c| c.ok())
        .and_then(|c| c.log_file);
    let _log_guard = match log::init(level, log_file.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
