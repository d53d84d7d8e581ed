// Copyright 2025 Gibran Rodriguez <brangi000@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `qjet <train|distill|tune|evaluate> <config.toml>`

use clap::{Args, Parser, Subcommand};
use qjet_core::pipeline::{self, Command};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "qjet")]
#[command(version)]
#[command(about = "Quantization-aware jet tagging: train, distill, tune and evaluate")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Train the network of the [model] section
    Train(ConfigArgs),
    /// Distill a trained teacher into a student
    Distill(ConfigArgs),
    /// Random search over distillation hyperparameters
    Tune(ConfigArgs),
    /// Evaluate a saved model
    Evaluate(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to the TOML run configuration
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (command, args) = match cli.command {
        CliCommand::Train(args) => (Command::Train, args),
        CliCommand::Distill(args) => (Command::Distill, args),
        CliCommand::Tune(args) => (Command::Tune, args),
        CliCommand::Evaluate(args) => (Command::Evaluate, args),
    };

    match pipeline::run(command, &args.config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
