use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "clawpanel", version, about = "ClawPanel agent supervisor and event hub")]
pub(crate) struct Args {
    #[arg(long, default_value = "config/clawpanel.toml")]
    pub(crate) config: PathBuf,
    /// Overrides `listen_addr` from the config file and environment.
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
