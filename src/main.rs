use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use amx_jit::{Amx, Disassembler, JitConfig, Jitter, natives};

#[derive(Parser)]
#[command(name = "amx-jit")]
#[command(about = "JIT compiler for Pawn AMX bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the bytecode listing of an image
    Disasm {
        /// The .amx file
        file: PathBuf,
    },
    /// Compile an image and run one of its functions
    Run {
        /// The .amx file
        file: PathBuf,

        /// Public function to call instead of main
        #[arg(long)]
        public: Option<String>,

        /// Dispatch float natives instead of inlining them
        #[arg(long)]
        no_intrinsics: bool,

        /// Compiler options (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amx_jit=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Disasm { file } => disasm(&file),
        Commands::Run {
            file,
            public,
            no_intrinsics,
            config,
        } => run(&file, public.as_deref(), no_intrinsics, config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn disasm(path: &Path) -> Result<(), String> {
    let mut amx = Amx::load(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let jitter = Jitter::new(&mut amx);
    let vm = jitter.vm();

    for index in 0..vm.num_publics() {
        if let (Some(name), Some(address)) = (vm.public_name(index), vm.public_address(index)) {
            println!("public {:08x}  {}", address, name);
        }
    }
    for index in 0..vm.num_natives() {
        if let Some(name) = vm.native_name(index) {
            println!("native {:>8}  {}", index, name);
        }
    }

    for instr in Disassembler::new(&vm) {
        let instr = instr.map_err(|e| e.to_string())?;
        println!("{}", instr);
    }
    Ok(())
}

fn run(path: &Path, public: Option<&str>, no_intrinsics: bool, config: Option<&Path>) -> Result<(), String> {
    let mut config = match config {
        Some(file) => JitConfig::load(file).map_err(|e| format!("{}: {}", file.display(), e))?,
        None => JitConfig::default(),
    };
    if no_intrinsics {
        config.intrinsics = false;
    }

    let mut amx = Amx::load(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    natives::register_float_natives(&mut amx);

    let mut jitter = Jitter::with_config(&mut amx, config);
    jitter.compile().map_err(|e| e.to_string())?;

    let result = match public {
        Some(name) => {
            let index = jitter
                .vm()
                .find_public(name)
                .ok_or_else(|| format!("no public function named '{}'", name))?;
            jitter.call_public_function(index)
        }
        None => jitter.call_main(),
    };

    let value = result.map_err(|e| format!("{} (status {})", e, e.code()))?;
    println!("{}", value);
    Ok(())
}
