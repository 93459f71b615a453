use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process,
};

use clap::{Parser, Subcommand};
use code_runner::{
    graph::GraphRequest,
    service::{self, RunRequest, ServiceError},
    Config, Sandbox,
};
use serde::Serialize;

/// Run a Python or JavaScript program out of process and print the result
/// as JSON.
#[derive(Parser, Debug)]
#[command(name = "code-runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a source file (`-` reads standard input).
    Run {
        #[arg(short, long)]
        language: String,
        #[arg(default_value = "-")]
        file: PathBuf,
    },
    /// Render a chart from a JSON graph request.
    Graph {
        #[arg(default_value = "-")]
        file: PathBuf,
    },
}

fn read_input(file: &Path) -> io::Result<String> {
    if file.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        fs::read_to_string(file)
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Unable to serialize response: {}", e),
    }
}

fn exit_code(err: &ServiceError) -> i32 {
    if err.is_client_error() {
        2
    } else {
        1
    }
}

enum Job {
    Run(RunRequest),
    Graph(GraphRequest),
}

fn parse_job(command: Command) -> Result<Job, String> {
    match command {
        Command::Run { language, file } => {
            let code = read_input(&file)
                .map_err(|e| format!("Unable to read {}: {}", file.display(), e))?;
            Ok(Job::Run(RunRequest {
                code: Some(code),
                language: Some(language),
            }))
        }
        Command::Graph { file } => {
            let body = read_input(&file)
                .map_err(|e| format!("Unable to read {}: {}", file.display(), e))?;
            serde_json::from_str(&body)
                .map(Job::Graph)
                .map_err(|e| format!("Invalid graph request: {}", e))
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let job = match parse_job(cli.command) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let sandbox = match Config::from_env().and_then(Sandbox::with_config) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let result = match job {
        Job::Run(req) => service::run_code(&sandbox, req).await.map(|resp| print_json(&resp)),
        Job::Graph(req) => service::generate_graph(&sandbox, req)
            .await
            .map(|resp| print_json(&resp)),
    };

    // Dropping the sandbox removes its scratch directory, process::exit would not.
    drop(sandbox);

    if let Err(e) = result {
        print_json(&e);
        process::exit(exit_code(&e));
    }
}
