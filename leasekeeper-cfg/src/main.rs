use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use config::{AdminCredentials, LeaseKeeperConfig, wire};
use serde::de::DeserializeOwned;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, version, about, long_about = None)]
/// Cli tool for checking a leasekeeper config
pub struct Args {
    /// path to leasekeeper config. We will determine format from extension. If no extension, we will attempt JSON & YAML
    #[clap(short = 'p', long, value_parser)]
    pub path: PathBuf,
    /// print the parsed wire format, the leasekeeper internal config format or the config as JSON
    #[clap(short = 'f', long, value_enum)]
    pub format: Option<Format>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Wire,
    Internal,
    Json,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("found config at path = {}", args.path.display());

    let wire_cfg = parse_wire::<wire::Config>(&args.path)?;
    // validation happens converting to the internal format, always run it
    let cfg = LeaseKeeperConfig::from_wire(wire_cfg.clone(), AdminCredentials::from_env())?;
    println!("config is valid");

    match args.format {
        Some(Format::Wire) => {
            println!("printing wire format");
            println!("{:#?}", wire_cfg);
        }
        Some(Format::Internal) => {
            println!("parsed wire format into leasekeeper internal format, pretty printing");
            println!("{:#?}", cfg);
        }
        Some(Format::Json) => {
            println!("{}", serde_json::to_string_pretty(&wire_cfg)?);
        }
        None => {}
    }

    Ok(())
}

fn parse_wire<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let input = std::fs::read_to_string(path).context("failed to find config")?;
    decode(path, &input)
}

fn decode<T: DeserializeOwned>(path: &Path, input: &str) -> Result<T> {
    Ok(match path.extension() {
        Some(ext) if ext == "json" => serde_json::from_str(input)?,
        Some(ext) if ext == "yaml" || ext == "yml" => serde_yaml::from_str(input)?,
        _ => match serde_json::from_str(input) {
            Ok(r) => r,
            Err(_err) => {
                println!("failed parsing from json, trying yaml");
                serde_yaml::from_str(input)?
            }
        },
    })
}
