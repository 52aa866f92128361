use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use dirk::CompileOptions;

#[derive(Parser)]
#[command(
    name = "dirk",
    version,
    about = "Compile and run a small C dialect on a bundled stack VM"
)]
struct Cli {
    /// Print each source line followed by the instructions emitted for it,
    /// then exit without executing.
    #[arg(short, long)]
    src: bool,
    /// Trace every VM instruction as it executes.
    #[arg(short, long)]
    debug: bool,
    /// Arena size in bytes for each of the code, data, heap, and stack pools.
    #[arg(long, default_value_t = dirk::DEFAULT_POOL_SIZE)]
    pool_size: usize,
    /// Source file to compile.
    file: PathBuf,
    /// Arguments handed to the guest program; the source path is its argv[0].
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let path = cli.file.display().to_string();

    let source = match fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            println!("could not open {path}: {e}");
            process::exit(-1);
        }
    };

    let options = CompileOptions {
        listing: cli.src,
        pool_size: cli.pool_size,
    };
    let program = match dirk::compile(&source, &options) {
        Ok(p) => p,
        Err(diag) => {
            // The one-line diagnostic is the contract and goes to stdout;
            // the annotated report is a stderr extra.
            println!("{diag}");
            diag.render(&path, &source);
            process::exit(-1);
        }
    };

    // Listing mode compiles and prints only.
    if cli.src {
        return;
    }

    let mut guest_args = vec![path];
    guest_args.extend(cli.args);

    match dirk::run_program(&program, &guest_args, cli.debug, io::stdout().lock()) {
        Ok(result) => process::exit(result.exit_code as i32),
        Err(e) => {
            println!("{e}");
            process::exit(-1);
        }
    }
}
