//! Grades fundus images from disk without starting the HTTP service.

use clap::Parser;
use dr_backend::config::{ServiceConfig, DEFAULT_CONFIG_PATH};
use dr_backend::model::ModelLoader;
use dr_backend::pipeline::Grader;
use dr_backend::vision::{ImageBytes, Preprocessor};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct GradeOptions {
    /// Service config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print one JSON response per line instead of a summary
    #[arg(long)]
    json: bool,

    /// Images to grade
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn build_grader(config: &ServiceConfig) -> Result<Grader, String> {
    let preprocessor = Preprocessor::from_config(&config.preprocessing).map_err(|e| e.to_string())?;
    let loader = ModelLoader::from_config(&config.model).map_err(|e| e.to_string())?;
    let handle = loader.acquire().map_err(|e| e.to_string())?;
    Ok(Grader::new(preprocessor, handle))
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("warn"));
    let options = GradeOptions::parse();

    let grader = match ServiceConfig::load_from(&options.config)
        .map_err(|e| e.to_string())
        .and_then(|c| build_grader(&c))
    {
        Ok(grader) => grader,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut failed = false;
    for path in &options.images {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                failed = true;
                continue;
            }
        };
        let image = ImageBytes::new(data).with_file_name(path.display().to_string());

        match grader.grade(&image) {
            Ok(result) if options.json => match serde_json::to_string(&result.to_response()) {
                Ok(line) => println!("{}", line),
                Err(e) => {
                    eprintln!("{}: {}", path.display(), e);
                    failed = true;
                }
            },
            Ok(result) => println!(
                "{}: {} ({}, confidence {:.4})\n  {}",
                path.display(),
                result.diagnosis,
                result.severity,
                result.confidence,
                result.recommendation
            ),
            Err(e) => {
                let kind = if e.is_client_error() { "rejected" } else { "failed" };
                eprintln!("{}: {}: {}", path.display(), kind, e);
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
