use std::path::PathBuf;

use clap::Parser;

/// Server configuration, sourced from CLI flags or environment variables
/// (flags win). `HTTP_PROXY` is deliberately not a field here — it's read
/// directly from the environment when building the release cache's HTTP
/// client, since it configures an outbound collaborator rather than this
/// process's own routing.
#[derive(Debug, Parser)]
#[command(name = "gitcache-server", about = "Read-through caching proxy for git mirrors and release downloads")]
pub struct Config {
    /// Root directory under which mirrors and release entries are stored.
    #[arg(long, env = "STORE_PATH", default_value = "data")]
    pub store_path: PathBuf,

    /// Address to bind the HTTP listener on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
}
