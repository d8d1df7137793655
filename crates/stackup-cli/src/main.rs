mod commands;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{Failure, Output};
use stackup_core::Overrides;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stackup",
    version,
    about = "Synthesize the environment of a container stack and launch it"
)]
struct Cli {
    /// Stack directory holding the manifest and the stack definition.
    #[arg(short = 'd', long, default_value = ".", global = true)]
    dir: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Only print errors.
    #[arg(short, long, default_value_t = false, global = true, conflicts_with_all = ["verbose", "trace"])]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// File and backend selection shared by the pipeline commands.
#[derive(Debug, Args)]
struct StackArgs {
    /// Stack definition file.
    #[arg(short = 'f', long = "file")]
    stack_file: Option<PathBuf>,
    /// Environment manifest.
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Output env file.
    #[arg(short = 'e', long)]
    env_file: Option<PathBuf>,
    /// Container runtime backend (compose, mock).
    #[arg(long)]
    backend: Option<String>,
    /// Never prompt; external tokens must come from the process environment.
    #[arg(long, default_value_t = false)]
    non_interactive: bool,
}

impl StackArgs {
    fn overrides(self) -> Overrides {
        Overrides {
            manifest: self.manifest,
            env_file: self.env_file,
            stack_file: self.stack_file,
            backend: self.backend,
            non_interactive: self.non_interactive,
            ..Overrides::default()
        }
    }
}

#[derive(Debug, Args)]
struct ImageArgs {
    /// Treat access-denied local images as available.
    #[arg(long, default_value_t = false)]
    continue_on_image_error: bool,
    /// Do not probe image availability.
    #[arg(long, default_value_t = false)]
    skip_image_check: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synthesize the environment and launch the stack.
    Up {
        #[command(flatten)]
        stack: StackArgs,
        #[command(flatten)]
        images: ImageArgs,
        /// Launch mode: detached, foreground or health.
        #[arg(long)]
        mode: Option<String>,
        /// Reset actions to run before launch (comma separated, repeatable).
        #[arg(long)]
        reset: Vec<String>,
    },
    /// Synthesize and write the output env file only.
    Env {
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Validate references and probe images without side effects.
    Check {
        #[command(flatten)]
        stack: StackArgs,
        #[command(flatten)]
        images: ImageArgs,
    },
    /// List the secret descriptors declared by the manifest.
    Secrets {
        /// Environment manifest.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Output env file.
        #[arg(short = 'e', long)]
        env_file: Option<PathBuf>,
    },
    /// Write a skeleton manifest with the control variables.
    Init {
        /// Manifest path to write.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Overwrite an existing manifest.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Check prerequisites and stack files.
    Doctor,
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        /// Output directory.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STACKUP_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let out = Output {
        json: cli.json,
        verbose: cli.verbose || cli.trace,
        quiet: cli.quiet,
    };
    let dir = cli.dir;

    let result = match cli.command {
        Commands::Up {
            stack,
            images,
            mode,
            reset,
        } => commands::up::run(
            &dir,
            Overrides {
                reset: (!reset.is_empty()).then_some(reset),
                continue_on_image_error: images.continue_on_image_error,
                skip_image_check: images.skip_image_check,
                ..stack.overrides()
            },
            mode.as_deref(),
            &out,
        ),
        Commands::Env { stack } => commands::env::run(&dir, stack.overrides(), &out),
        Commands::Check { stack, images } => commands::check::run(
            &dir,
            Overrides {
                continue_on_image_error: images.continue_on_image_error,
                skip_image_check: images.skip_image_check,
                ..stack.overrides()
            },
            &out,
        ),
        Commands::Secrets { manifest, env_file } => commands::secrets::run(
            &dir,
            Overrides {
                manifest,
                env_file,
                ..Overrides::default()
            },
            &out,
        ),
        Commands::Init { manifest, force } => {
            commands::init::run(&dir, manifest.as_deref(), force, &out)
        }
        Commands::Doctor => commands::doctor::run(&dir, out.json).map_err(Failure::from),
        Commands::Completions { shell } => {
            commands::completions::run::<Cli>(shell).map_err(Failure::from)
        }
        Commands::ManPages { dir } => {
            commands::man_pages::run::<Cli>(&dir).map_err(Failure::from)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {}", failure.message);
            ExitCode::from(failure.code)
        }
    }
}
