#![forbid(unsafe_code)]

use std::env;

use veil_tools::detect_cli::{execute_command, USAGE};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (subcommand, rest) = args.split_first().ok_or_else(|| USAGE.to_string())?;
    let output = execute_command(subcommand, rest)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
