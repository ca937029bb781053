//! Main executable for geomopt

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;

use geomopt::constraints::ConstraintSet;
use geomopt::io::{read_input, run_json, write_output};

/// Command-line arguments for the application
#[derive(Parser, Debug)]
#[clap(
    name = "geomopt",
    version = geomopt::VERSION,
    about = "Constrained geometry optimization in internal coordinates"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an optimization or scan described by a JSON input document
    Optimize {
        /// JSON input (initial_molecule, keywords, input_specification)
        #[clap(long, short, value_parser)]
        input: PathBuf,

        /// Output file; the result is printed when omitted
        #[clap(long, short, value_parser)]
        output: Option<PathBuf>,
    },

    /// Check a constraint description and print it in canonical form
    Constraints {
        /// JSON groups or the text block format
        #[clap(long, short, value_parser)]
        input: PathBuf,

        /// Print JSON instead of the text block format
        #[clap(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logger
    env_logger::init();

    // Parse command-line arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Optimize { input, output } => {
            info!("Loading input: {}", input.display());
            let request = read_input(&input)
                .with_context(|| format!("Failed to read input file: {}", input.display()))?;
            let result = run_json(&request)
                .with_context(|| format!("Failed to start optimization from {}", input.display()))?;

            match &output {
                Some(path) => {
                    info!("Writing result to {}", path.display());
                    write_output(path, &result)
                        .with_context(|| format!("Failed to write output file: {}", path.display()))?;
                }
                None => println!("{}", serde_json::to_string_pretty(&result)?),
            }

            if result["success"] != true {
                let message = result["error_message"].as_str().unwrap_or("unknown failure");
                error!("{}", message);
                return Err(anyhow::anyhow!("Optimization failed: {}", message));
            }
            info!("Optimization completed successfully");
        }

        Commands::Constraints { input, json } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read constraints file: {}", input.display()))?;
            let constraints = match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => ConstraintSet::parse(&value),
                Err(_) => ConstraintSet::parse_text(&text),
            }
            .with_context(|| format!("Invalid constraints in {}", input.display()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&constraints.to_value())?);
            } else {
                println!("{}", constraints.render());
            }
        }
    }

    Ok(())
}
