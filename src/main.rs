use anyhow::{bail, Context, Result};
use cfw_builder::artifact::{build, Build, BuildRequest, MAX_ARTIFACT_SIZE};
use cfw_builder::compress::{CommandCompressor, Compressor};
use cfw_builder::config::{
    self, compatible_firmware, matches_requirement, ModuleInputs, ModuleRegistry, PatchResult,
};
use cfw_builder::install::{install, trigger_sd_install, InstallOptions, InstallTarget};
use cfw_builder::protocol::{DeviceLink, Progress};
use cfw_builder::resources::FsResourceSource;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use similar::{ChangeTag, TextDiff};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cfw-builder")]
#[command(about = "Build and install patched custom firmware for Espruino devices", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available modules and firmware
    List {
        /// Module definition file or directory (default: ./patches)
        #[arg(short, long, env = "CFW_MODULES")]
        modules: Option<PathBuf>,

        /// Only show firmware that runs on this Espruino version (e.g. 2v25.359)
        #[arg(long)]
        espruino: Option<String>,
    },

    /// Patch, stamp and compress a firmware image
    Build {
        #[command(flatten)]
        build: BuildArgs,

        /// Where to write the artifact (default: FW_<version>.js)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build a firmware image and install it on a device
    Install {
        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        device: DeviceArgs,

        /// Pick the base firmware matching the release the device runs now
        #[arg(long, conflicts_with = "firmware")]
        auto: bool,

        /// Where the firmware goes
        #[arg(long, value_enum, default_value_t = TargetArg::Flash)]
        target: TargetArg,

        /// Directory module resource folders are read from
        #[arg(long, default_value = ".")]
        resources: PathBuf,

        /// Don't upload module resources
        #[arg(long)]
        skip_resources: bool,
    },

    /// Make the device install FW.js from its SD card
    TriggerSd {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Base firmware source, or the key of a [[firmware]] definition
    #[arg(short, long)]
    firmware: Option<String>,

    /// Module definition file or directory (default: ./patches)
    #[arg(short, long, env = "CFW_MODULES")]
    modules: Option<PathBuf>,

    /// Module to apply, in order (repeatable)
    #[arg(short = 's', long = "select")]
    select: Vec<String>,

    /// Free text for a module that takes input, as KEY=VALUE
    #[arg(long = "input", value_parser = parse_input)]
    inputs: Vec<(String, String)>,

    /// External compressor command; reads source on stdin, writes stdout
    #[arg(long)]
    compressor: Option<String>,

    /// Show unified diff of the patched source
    #[arg(short, long)]
    diff: bool,
}

#[derive(Args)]
struct DeviceArgs {
    /// Serial bridge address of the device (HOST:PORT)
    #[arg(short = 'D', long, env = "CFW_DEVICE")]
    device: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Flash,
    Sd,
}

impl From<TargetArg> for InstallTarget {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::Flash => InstallTarget::Flash,
            TargetArg::Sd => InstallTarget::SdCard,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cfw_builder=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { modules, espruino } => cmd_list(modules, espruino),

        Commands::Build { build, output } => cmd_build(build, output),

        Commands::Install {
            build,
            device,
            auto,
            target,
            resources,
            skip_resources,
        } => cmd_install(build, device, auto, target.into(), resources, skip_resources).await,

        Commands::TriggerSd { device } => cmd_trigger_sd(device).await,
    }
}

fn parse_input(value: &str) -> Result<(String, String), String> {
    let (key, text) = value
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{value}'"))?;
    if key.is_empty() {
        return Err(format!("missing module key in '{value}'"));
    }
    Ok((key.to_string(), text.to_string()))
}

/// Helper: Load the registry from `--modules`, or `./patches` without one.
fn load_registry(modules: Option<PathBuf>) -> Result<ModuleRegistry> {
    let path = match modules {
        Some(path) => path,
        None => env::current_dir()?.join("patches"),
    };
    Ok(config::load_registry(&path)?)
}

/// Helper: Resolve `--firmware` to a source file.
///
/// A registered firmware key wins over a path of the same name.
fn firmware_path(registry: &ModuleRegistry, firmware: &str) -> PathBuf {
    registry
        .firmware_by_key(firmware)
        .map(|def| PathBuf::from(&def.file))
        .unwrap_or_else(|| PathBuf::from(firmware))
}

/// Helper: Show unified diff between base and patched source
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!("\n{}", format!("--- {} (base)", file.display()).dimmed());
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => continue,
        };
        print!("{}", sign);
    }
}

/// Run the build pipeline on `firmware` and print the report.
fn run_build(registry: &ModuleRegistry, args: &BuildArgs, firmware: &str) -> Result<Build> {
    let path = firmware_path(registry, firmware);
    let source = fs::read_to_string(&path)
        .with_context(|| format!("failed to read firmware {}", path.display()))?;

    println!("Firmware: {}", path.display());
    println!();

    let compressor = args
        .compressor
        .as_deref()
        .and_then(CommandCompressor::from_command_line);
    let request = BuildRequest {
        source,
        file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        modules: args.select.clone(),
        inputs: args.inputs.iter().cloned().collect::<ModuleInputs>(),
        unix_secs: None,
    };

    let result = build(
        registry,
        &request,
        compressor.as_ref().map(|c| c as &dyn Compressor),
    )?;
    print_build_report(&result);

    if args.diff {
        display_diff(&path, &request.source, &result.source);
    }

    Ok(result)
}

fn print_build_report(result: &Build) {
    let mut applied = 0;
    let mut missing = 0;
    let mut skipped = 0;

    for report in &result.reports {
        match &report.result {
            PatchResult::Applied { .. } => {
                println!(
                    "{} {}: {} {}",
                    "✓".green(),
                    report.module,
                    report.operation,
                    report.result
                );
                applied += 1;
            }
            PatchResult::RegionNotFound { .. } | PatchResult::MarkerNotFound { .. } => {
                println!(
                    "{} {}: {} {}",
                    "⊙".yellow(),
                    report.module,
                    report.operation,
                    report.result
                );
                missing += 1;
            }
            PatchResult::NoMatch { .. } | PatchResult::SkippedInput => {
                println!(
                    "{} {}: {} {}",
                    "⊘".cyan(),
                    report.module,
                    report.operation,
                    report.result
                );
                skipped += 1;
            }
        }
    }
    for combo in &result.combos_applied {
        println!("{} combo {}", "+".green(), combo);
    }

    let artifact = &result.artifact;
    let size = format!("{} / {} bytes", artifact.len(), MAX_ARTIFACT_SIZE);
    println!();
    println!("{}", "Summary:".bold());
    println!("  {} applied", format!("{}", applied).green());
    println!("  {} not found", format!("{}", missing).yellow());
    println!("  {} skipped", format!("{}", skipped).cyan());
    println!("  Version: {}", artifact.version);
    if artifact.check_size().is_ok() {
        println!("  Size: {}", size.green());
    } else {
        println!("  Size: {}", size.red());
    }
    if !artifact.compressed {
        println!("  {}", "Not compressed".dimmed());
    }
}

fn cmd_list(modules: Option<PathBuf>, espruino: Option<String>) -> Result<()> {
    let registry = load_registry(modules)?;

    println!("{}", "Modules:".bold());
    for module in registry.modules() {
        println!("  {} - {}", module.key.green(), module.name);
        if !module.description.is_empty() {
            println!("    {}", module.description.dimmed());
        }
        if !module.authors.is_empty() {
            println!("    by {}", module.authors.join(", ").dimmed());
        }
        if let Some(input) = &module.input {
            let placeholder = input.placeholder.as_deref().unwrap_or("free text");
            println!("    takes input: {}", placeholder.cyan());
        }
        if let Some(resources) = &module.resources {
            println!(
                "    {} resource files -> {}",
                resources.files.len(),
                resources.target_path
            );
        }
    }

    let firmware = match &espruino {
        Some(device) => compatible_firmware(registry.firmware(), device),
        None => registry.firmware().iter().collect(),
    };

    println!();
    println!("{}", "Firmware:".bold());
    if firmware.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for def in firmware {
        let requirement = def
            .espversion
            .as_deref()
            .map(|v| format!(" (Espruino >= {v})"))
            .unwrap_or_default();
        println!(
            "  {} - {} [{}]{}",
            def.key.green(),
            def.name,
            def.file,
            requirement.dimmed()
        );
    }

    Ok(())
}

fn cmd_build(args: BuildArgs, output: Option<PathBuf>) -> Result<()> {
    let Some(firmware) = args.firmware.as_deref() else {
        bail!("--firmware is required");
    };
    let registry = load_registry(args.modules.clone())?;
    let result = run_build(&registry, &args, firmware)?;
    let artifact = &result.artifact;

    let output =
        output.unwrap_or_else(|| PathBuf::from(format!("FW_{}.js", artifact.version)));
    artifact.save(&output)?;
    println!();
    println!("Wrote {}", output.display());

    if let Err(e) = artifact.check_size() {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }

    Ok(())
}

async fn connect(device: &DeviceArgs) -> Result<DeviceLink> {
    let stream = TcpStream::connect(&device.device)
        .await
        .with_context(|| format!("failed to connect to device at {}", device.device))?;
    Ok(DeviceLink::new(stream))
}

fn print_progress(file: &str, progress: Progress) {
    print!("\r  {} {}/{}", file, progress.sent, progress.total);
    if progress.is_complete() {
        println!();
    }
    let _ = std::io::stdout().flush();
}

/// Helper: Pick the `[[firmware]]` entry for the release the device runs.
async fn auto_firmware(
    link: &DeviceLink,
    registry: &ModuleRegistry,
    settle: Duration,
) -> Result<String> {
    let running = link
        .lease()
        .await
        .firmware_version(settle)
        .await?
        .context("device reported no firmware VERSION (is the SD card inserted?)")?;

    let def = registry.firmware_for_version(&running).with_context(|| {
        let supported: Vec<&str> = registry.firmware().iter().map(|f| f.key.as_str()).collect();
        format!(
            "unsupported firmware version {} (supported: {})",
            running,
            supported.join(", ")
        )
    })?;
    println!("Device firmware: {} -> {}", running, def.key.green());
    Ok(def.key.clone())
}

async fn cmd_install(
    args: BuildArgs,
    device: DeviceArgs,
    auto: bool,
    target: InstallTarget,
    resources: PathBuf,
    skip_resources: bool,
) -> Result<()> {
    if args.firmware.is_none() && !auto {
        bail!("pass --firmware, or --auto to match the firmware on the device");
    }
    let registry = load_registry(args.modules.clone())?;
    let mut options = InstallOptions::from_settings(&registry.transfer());
    options.skip_resources = skip_resources;

    let link = connect(&device).await?;
    println!("Device: {}", device.device);

    let firmware = match &args.firmware {
        Some(firmware) => firmware.clone(),
        None => auto_firmware(&link, &registry, options.sync.listing_settle).await?,
    };
    let result = run_build(&registry, &args, &firmware)?;
    let artifact = &result.artifact;

    if let Err(e) = artifact.check_size() {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }

    let selected = registry.select(&args.select)?;
    let manifests = registry.resources_for(&selected);
    println!();

    let espversion = registry
        .firmware_by_key(&firmware)
        .and_then(|def| def.espversion.as_deref());
    let device_version = link
        .lease()
        .await
        .device_version(options.sync.listing_settle)
        .await?;
    match device_version {
        Some(version) => {
            println!("Espruino: {}", version);
            if !matches_requirement(&version.to_string(), espversion)? {
                eprintln!(
                    "{}",
                    format!(
                        "Warning: firmware wants Espruino {} or newer",
                        espversion.unwrap_or_default()
                    )
                    .yellow()
                );
            }
        }
        None => eprintln!("{}", "Warning: device did not report its version".yellow()),
    }

    let source = FsResourceSource::new(resources);
    let report = install(
        &link,
        artifact,
        target,
        &manifests,
        &source,
        &options,
        print_progress,
    )
    .await?;

    println!();
    println!(
        "{} Installed {} ({} bytes, version {})",
        "✓".green(),
        report.firmware.name,
        report.firmware.bytes,
        report.version
    );
    if let Some(reason) = &report.sd_version_error {
        println!("{} VERSION not written to SD card: {}", "⊙".yellow(), reason);
    }
    for (module, sync) in &report.resources {
        if sync.listing_failed {
            println!(
                "{} {}: could not read device listing, resources skipped",
                "⊙".yellow(),
                module
            );
            continue;
        }
        println!(
            "{} {}: {} uploaded, {} already present",
            "✓".green(),
            module,
            sync.uploaded.len(),
            sync.present.len()
        );
        for (file, reason) in &sync.failed {
            eprintln!("  {} {}: {}", "✗".red(), file, reason);
        }
    }

    Ok(())
}

async fn cmd_trigger_sd(device: DeviceArgs) -> Result<()> {
    let link = connect(&device).await?;
    trigger_sd_install(&link, &InstallOptions::default()).await?;
    println!("{} SD install triggered on {}", "✓".green(), device.device);
    Ok(())
}
