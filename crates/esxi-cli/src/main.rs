//! esxi-extract CLI - Pull VMs, disks and metadata off an ESXi host.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use esxi_core::vmdk::{BlockPipeline, FileRangeReader, PipelineConfig, StreamOptimizedDisk, BLOCK_SIZE};
use esxi_core::{cancel_pair, Esxi, EsxiConfig, ExportLease};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Extract virtual machines from a live ESXi host.
#[derive(Parser)]
#[command(name = "esxi-extract")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Where and how to log in.
#[derive(Args)]
struct Connection {
    /// Host name or address.
    #[arg(long, env = "ESXI_HOST")]
    host: String,

    /// User name.
    #[arg(short, long, env = "ESXI_USER", default_value = "root")]
    user: String,

    /// Password.
    #[arg(short, long, env = "ESXI_PASSWORD", hide_env_values = true)]
    password: String,

    /// Accept self-signed host certificates.
    #[arg(long, env = "ESXI_INSECURE")]
    insecure: bool,
}

impl Connection {
    fn connect(&self) -> Result<Esxi> {
        let config = EsxiConfig::new(&self.host, &self.user, &self.password, !self.insecure);
        let esxi = Esxi::new(config)?;
        esxi.connect()
            .with_context(|| format!("Failed to connect to {}", self.host))?;
        Ok(esxi)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List every VM on the host.
    List {
        #[command(flatten)]
        connection: Connection,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show the full descriptor of one VM as JSON.
    Info {
        #[command(flatten)]
        connection: Connection,

        /// VM id (the managed object id, e.g. 12).
        vm: String,
    },

    /// Export the disks of a powered-off VM.
    Export {
        #[command(flatten)]
        connection: Connection,

        /// VM id.
        vm: String,

        /// Directory the disks are written to.
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Convert a local stream-optimized VMDK to a raw image.
    Convert {
        /// Path to the stream-optimized VMDK.
        vmdk_file: PathBuf,

        /// Output raw image path. Defaults to the input with a .raw extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of threads to use (0 = auto-detect).
        #[arg(short, long, default_value = "0")]
        threads: usize,

        /// Blocks decoded in parallel.
        #[arg(long, default_value = "16")]
        window: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Power a VM on or off.
    Power {
        #[command(flatten)]
        connection: Connection,

        /// Requested power state.
        #[arg(value_enum)]
        state: PowerArg,

        /// VM id.
        vm: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PowerArg {
    On,
    Off,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List { connection, json } => list_vms(&connection, json),
        Commands::Info { connection, vm } => show_info(&connection, &vm),
        Commands::Export {
            connection,
            vm,
            output_dir,
            quiet,
        } => run_export(&connection, &vm, &output_dir, quiet),
        Commands::Convert {
            vmdk_file,
            output,
            threads,
            window,
            quiet,
        } => run_convert(&vmdk_file, output.as_deref(), threads, window, quiet),
        Commands::Power {
            connection,
            state,
            vm,
        } => set_power(&connection, state, &vm),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "esxi_core=info",
        1 => "esxi_core=debug,esxi_extract=debug",
        _ => "esxi_core=trace,esxi_extract=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn list_vms(connection: &Connection, json: bool) -> Result<()> {
    let esxi = connection.connect()?;
    let vms = esxi.get_all_vm_metadata()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&vms)?);
        return Ok(());
    }

    println!("{:<8} {:<32} {:>5} {:>10} {:>10}  {}", "ID", "NAME", "CPUS", "MEMORY", "USED", "STATE");
    for vm in &vms {
        println!(
            "{:<8} {:<32} {:>5} {:>10} {:>10}  {}",
            vm.id,
            vm.name_label,
            vm.n_cpus,
            format_bytes(vm.memory),
            format_bytes(vm.storage.used),
            vm.power_state
        );
    }
    Ok(())
}

fn show_info(connection: &Connection, vm: &str) -> Result<()> {
    let esxi = connection.connect()?;
    let descriptor = esxi
        .get_transferable_vm_metadata(vm)
        .with_context(|| format!("Failed to read metadata of VM {}", vm))?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

fn run_export(connection: &Connection, vm: &str, output_dir: &Path, quiet: bool) -> Result<()> {
    let esxi = connection.connect()?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let lease = esxi.export_vm(vm)?;
    if !quiet {
        println!("Export lease {} ready, {} disk(s)", lease.lease, lease.disk_urls.len());
    }

    match download_disks(&esxi, &lease, output_dir, quiet) {
        Ok(files) => {
            esxi.complete_export(&lease)?;
            if !quiet {
                println!();
                println!("Export completed successfully:");
                for file in files {
                    println!("  {}", file.display());
                }
            }
            Ok(())
        }
        Err(error) => {
            if let Err(abort) = esxi.abort_export(&lease) {
                tracing::warn!(%abort, "failed to abort export lease");
            }
            Err(error)
        }
    }
}

fn download_disks(esxi: &Esxi, lease: &ExportLease, output_dir: &Path, quiet: bool) -> Result<Vec<PathBuf>> {
    let (_handle, cancel) = cancel_pair();
    let mut written = Vec::with_capacity(lease.disk_urls.len());

    for url in &lease.disk_urls {
        let name = url.rsplit('/').next().unwrap_or("disk.vmdk");
        let path = output_dir.join(sanitize_filename(name));

        let response = esxi.download_url(url, &cancel)?;
        let progress = if quiet {
            ProgressBar::hidden()
        } else {
            let pb = match response.content_length {
                Some(len) => ProgressBar::new(len),
                None => ProgressBar::new_spinner(),
            };
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")?
                    .progress_chars("#>-"),
            );
            pb.set_message(name.to_string());
            pb
        };

        let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let copied = std::io::copy(&mut progress.wrap_read(response.body), &mut writer)
            .with_context(|| format!("Failed to stream {}", url))?;
        writer.flush()?;
        progress.finish_with_message(format!("{} ({})", name, format_bytes(copied)));

        tracing::info!(%url, path = %path.display(), bytes = copied, "disk exported");
        written.push(path);
    }

    Ok(written)
}

fn run_convert(
    vmdk_file: &Path,
    output: Option<&Path>,
    threads: usize,
    window: usize,
    quiet: bool,
) -> Result<()> {
    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => vmdk_file.with_extension("raw"),
    };
    if output_path == vmdk_file {
        bail!("Output would overwrite the input file");
    }

    let reader = FileRangeReader::open(vmdk_file)?;
    let disk = StreamOptimizedDisk::open(reader, vmdk_file.display().to_string())?;
    let capacity = disk.capacity()?;

    if !quiet {
        println!("Disk Conversion");
        println!("---------------");
        println!("Input:     {}", vmdk_file.display());
        println!("Capacity:  {}", format_bytes(capacity));
        println!("Blocks:    {}", disk.block_count()?);
        println!("Output:    {}", output_path.display());
        println!();
    }

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(capacity);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
                .progress_chars("#>-"),
        );
        pb
    };

    let file = File::create(&output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    let mut writer = BufWriter::with_capacity(BLOCK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut remaining = capacity;

    let (_handle, cancel) = cancel_pair();
    let pipeline = BlockPipeline::new(PipelineConfig::new(threads, window));
    pipeline.run(&disk, &cancel, |block| {
        // the last block may extend past the capacity
        let len = remaining.min(block.data.len() as u64) as usize;
        let data = &block.data[..len];
        writer.write_all(data).map_err(esxi_core::Error::io_simple)?;
        hasher.update(data);
        remaining -= len as u64;
        progress.inc(len as u64);
        Ok(())
    })?;
    writer.flush()?;
    progress.finish_with_message("Complete!");

    if !quiet {
        println!();
        println!("Conversion completed successfully: {}", output_path.display());
        println!("SHA-256:   {:x}", hasher.finalize());
    }

    Ok(())
}

fn set_power(connection: &Connection, state: PowerArg, vm: &str) -> Result<()> {
    let esxi = connection.connect()?;
    let task = match state {
        PowerArg::On => esxi.power_on(vm)?,
        PowerArg::Off => esxi.power_off(vm)?,
    };
    println!("Started task {}", task);
    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Sanitize a filename by removing or replacing invalid characters.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
