//! Daemon configuration: flags and environment variables.

use clap::Parser;
use std::path::PathBuf;

/// The helion daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "helion-node")]
#[command(about = "Self-hosted kernel for LLM-generated sandboxed apps")]
pub struct Args {
    /// HTTP bind host.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// HTTP bind port.
    #[arg(long, env = "PORT", default_value_t = 8420)]
    pub port: u16,
    /// Data root for all persisted state.
    #[arg(long, env = "HELION_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Local inference endpoint.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    pub ollama_url: String,
    /// Default local model.
    #[arg(long, env = "OLLAMA_MODEL", default_value = "qwen2.5-coder:7b")]
    pub ollama_model: String,

    /// Anthropic API key. The claude provider is unavailable without it.
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,
    /// Default Anthropic model.
    #[arg(long, env = "CLAUDE_MODEL", default_value = "claude-sonnet-4-20250514")]
    pub claude_model: String,

    /// OpenAI-compatible API key.
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,
    /// OpenAI-compatible base URL.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,
    /// Default OpenAI-compatible model.
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub openai_model: String,

    /// Enable the container process manager.
    #[arg(long, env = "DOCKER_ENABLED", default_value_t = false)]
    pub docker_enabled: bool,
    /// Engine endpoint: a socket path, or `tcp://host:port`.
    #[arg(long, env = "DOCKER_HOST", default_value = "/var/run/docker.sock")]
    pub docker_host: String,
    /// First host port for container web UIs.
    #[arg(long, env = "DOCKER_PORT_START", default_value_t = 5100)]
    pub docker_port_start: u16,
    /// Last host port (inclusive).
    #[arg(long, env = "DOCKER_PORT_END", default_value_t = 5199)]
    pub docker_port_end: u16,
    /// Ceiling on simultaneously running containers.
    #[arg(long, env = "DOCKER_MAX_CONTAINERS", default_value_t = 5)]
    pub docker_max_containers: usize,

    /// Enable the background scheduler.
    #[arg(long, env = "SCHEDULER_ENABLED", default_value_t = true)]
    pub scheduler_enabled: bool,
    /// Minutes of user inactivity before background work runs.
    #[arg(long, env = "SCHEDULER_DEFER_MINUTES", default_value_t = 5)]
    pub scheduler_defer_minutes: u64,
    /// Pin scheduler LLM work to one provider.
    #[arg(long, env = "SCHEDULER_PROVIDER")]
    pub scheduler_provider: Option<String>,
    /// Daily LLM-call budget per task.
    #[arg(long, env = "SCHEDULER_DAILY_BUDGET", default_value_t = 50)]
    pub scheduler_daily_budget: u64,
    /// Registry size ceiling the curator task enforces.
    #[arg(long, env = "SCHEDULER_MAX_REGISTRY", default_value_t = 500)]
    pub scheduler_max_registry: usize,

    /// Community registry index URL (empty disables sync).
    #[arg(long, env = "HELION_COMMUNITY_INDEX", default_value = "")]
    pub community_index: String,
}

impl Args {
    /// Container-engine transport parsed out of `docker_host`.
    pub fn engine_transport(&self) -> helion_sandbox::container::engine::EngineTransport {
        use helion_sandbox::container::engine::EngineTransport;
        match self.docker_host.strip_prefix("tcp://") {
            Some(addr) => EngineTransport::Tcp(addr.to_string()),
            None => EngineTransport::Unix(PathBuf::from(&self.docker_host)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["helion-node"]);
        assert_eq!(args.port, 8420);
        assert_eq!(args.docker_port_start, 5100);
        assert_eq!(args.docker_port_end, 5199);
        assert!(args.scheduler_enabled);
    }

    #[test]
    fn tcp_docker_host_parses() {
        let args = Args::parse_from(["helion-node", "--docker-host", "tcp://10.0.0.2:2375"]);
        match args.engine_transport() {
            helion_sandbox::container::engine::EngineTransport::Tcp(addr) => {
                assert_eq!(addr, "10.0.0.2:2375");
            }
            other => panic!("expected tcp transport, got {other:?}"),
        }
    }

    #[test]
    fn flags_override() {
        let args = Args::parse_from([
            "helion-node",
            "--port",
            "9000",
            "--scheduler-daily-budget",
            "10",
        ]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.scheduler_daily_budget, 10);
    }
}
