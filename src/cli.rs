use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cv-pipeline-rs",
    version,
    about = "Continuous verification analysis pipeline"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Keep every store in process memory instead of Postgres.
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,
    /// Apply the bundled schema before starting.
    #[arg(long, default_value_t = false)]
    pub migrate: bool,
}
