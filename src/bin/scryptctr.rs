//! scryptctr CLI - scrypt-keyed AES-CTR file encryption
//!
//! Streams files through the `crypt.scrypt` transform with a separate
//! parameter file, or seals them into a self-contained authenticated
//! container.

use clap::{Parser, Subcommand};
use std::error::Error as _;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use scryptctr::file_ops;
use scryptctr::registry::{Availability, Registry};
use scryptctr::transform::Secret;
use scryptctr::{Budgets, CryptError, Kdf, Result};

#[derive(Parser)]
#[command(name = "scryptctr")]
#[command(version)]
#[command(about = "Passphrase-keyed streaming encryption.", long_about = None)]
struct Cli {
    /// Read passphrase from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Maximum memory for scrypt, in bytes (0 = no absolute limit)
    #[arg(long, global = true, env = "SCRYPTCTR_MAXMEM", value_name = "BYTES")]
    maxmem: Option<u64>,

    /// Maximum fraction of physical memory for scrypt (0 < f <= 0.5)
    #[arg(long, global = true, env = "SCRYPTCTR_MAXMEMFRAC", value_name = "FRACTION")]
    maxmemfrac: Option<f64>,

    /// Maximum time for scrypt, in seconds
    #[arg(long, global = true, env = "SCRYPTCTR_MAXTIME", value_name = "SECONDS")]
    maxtime: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the transforms this build can offer
    Capabilities,

    /// Generate a KDF parameter file
    #[command(alias = "p")]
    Params {
        /// Path to write the parameters to (must not exist)
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Encrypt a file, generating the parameter file if it is missing
    #[command(alias = "e")]
    Encrypt {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the file to write the encrypted bytes to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Path to the KDF parameter file
        #[arg(long, value_name = "FILE")]
        params: PathBuf,
    },

    /// Decrypt a file using an existing parameter file
    #[command(alias = "d")]
    Decrypt {
        /// Path to the file whose contents is to be decrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the file to write the decrypted bytes to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Path to the KDF parameter file
        #[arg(long, value_name = "FILE")]
        params: PathBuf,
    },

    /// Seal a file into an authenticated container
    #[command(alias = "s")]
    Seal {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Write the container as armored text
        #[arg(long)]
        armor: bool,
    },

    /// Open an authenticated container, armored or not
    #[command(alias = "o")]
    Open {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

impl Cli {
    /// Apply command-line overrides to `base`.
    fn budgets(&self, base: Budgets) -> Budgets {
        Budgets {
            max_mem: self.maxmem.unwrap_or(base.max_mem),
            max_mem_frac: self.maxmemfrac.unwrap_or(base.max_mem_frac),
            max_time: self.maxtime.unwrap_or(base.max_time),
        }
    }
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        report(&e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let kdf = Kdf::new();

    match &cli.command {
        Commands::Capabilities => {
            list_capabilities();
            Ok(())
        }
        Commands::Params { output } => {
            file_ops::write_params_file(&kdf, output, &cli.budgets(Budgets::ENCRYPT))
        }
        Commands::Encrypt {
            input,
            output,
            params,
        } => file_ops::encrypt_file(
            &kdf,
            input,
            output,
            params,
            &cli.budgets(Budgets::ENCRYPT),
            &get_passphrase(cli.passphrase_stdin)?,
        )
        .map(|_| ()),
        Commands::Decrypt {
            input,
            output,
            params,
        } => file_ops::decrypt_file(
            &kdf,
            input,
            output,
            params,
            &cli.budgets(Budgets::DECRYPT),
            &get_passphrase(cli.passphrase_stdin)?,
        )
        .map(|_| ()),
        Commands::Seal {
            input,
            output,
            armor,
        } => file_ops::seal_file(
            &kdf,
            input,
            output,
            &cli.budgets(Budgets::ENCRYPT),
            *armor,
            &get_passphrase(cli.passphrase_stdin)?,
        ),
        Commands::Open { input, output } => file_ops::open_file(
            &kdf,
            input,
            output,
            &cli.budgets(Budgets::DECRYPT),
            &get_passphrase(cli.passphrase_stdin)?,
        ),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("SCRYPTCTR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn list_capabilities() {
    let registry = Registry::probe();
    if let Availability::Unavailable(reason) = registry.availability() {
        eprintln!("No capabilities available: {}", reason);
        return;
    }
    for capability in registry.list_capabilities() {
        let contract = capability.contract();
        println!(
            "{}\t{}\t(params {} + salt {} bytes, key {} bytes, block {} bytes)",
            capability.name(),
            capability.summary(),
            contract.param_size,
            contract.salt_size,
            contract.key_size,
            contract.block_size
        );
    }
}

fn report(e: &CryptError) {
    eprintln!("Error: {:#}", e);
    let mut cause = e.source();
    while let Some(inner) = cause {
        eprintln!("  caused by: {}", inner);
        cause = inner.source();
    }
}

fn get_passphrase(use_stdin: bool) -> Result<Secret> {
    if use_stdin {
        Secret::read_from(&mut std::io::stdin())
    } else {
        Secret::prompt()
    }
}
