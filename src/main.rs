mod config;
mod credentials;
mod models;
mod ssh;
mod sweep;
mod teardown;
mod topology;
mod tunnel;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Config, ExitPolicy};
use credentials::Credential;
use models::Node;
use ssh::SshExecutor;
use sweep::Sweeper;
use topology::{KubectlDirectory, NodeDirectory, StaticDirectory};

/// Remove the VXLAN tunnels between this master node and every worker
#[derive(Parser, Debug)]
#[command(name = "vxlan-teardown")]
#[command(about = "Remove VXLAN tunnels between Kubernetes nodes for OVS-CNI", long_about = None)]
struct Cli {
    /// OVS bridges whose tunnels are removed [env: OVS_BRIDGES] [default: n2br n3br n4br]
    #[arg(long = "ovs-bridges", num_args = 1.., value_delimiter = ',')]
    ovs_bridges: Option<Vec<String>>,

    /// SSH port on every node [env: SSH_PORT]
    #[arg(long)]
    ssh_port: Option<u16>,

    /// Per-command timeout in seconds [env: SSH_TIMEOUT_SECS]
    #[arg(long)]
    timeout: Option<u64>,

    /// Number of tasks run concurrently [env: TEARDOWN_PARALLELISM]
    #[arg(short, long)]
    parallelism: Option<usize>,

    /// Exit code policy when some endpoints fail [env: TEARDOWN_EXIT_POLICY]
    #[arg(long, value_enum)]
    exit_policy: Option<ExitPolicy>,

    /// Name of this node in the cluster, defaults to the hostname [env: MASTER_NODE_NAME]
    #[arg(long)]
    node_name: Option<String>,

    /// SSH user, defaults to the invoking user [env: SSH_USER]
    #[arg(long)]
    user: Option<String>,

    /// Cluster node as NAME=ADDRESS, repeatable; replaces the kubectl lookup
    #[arg(long = "node", value_name = "NAME=ADDRESS", value_parser = topology::parse_node_spec)]
    nodes: Vec<Node>,

    /// Print the tasks without connecting to any node
    #[arg(long)]
    dry_run: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Flags win over the environment
    fn apply(self, cfg: &mut Config) {
        if let Some(bridges) = self.ovs_bridges {
            cfg.bridges = bridges;
        }
        if let Some(port) = self.ssh_port {
            cfg.ssh_port = port;
        }
        if let Some(timeout) = self.timeout {
            cfg.ssh_timeout_secs = timeout;
        }
        if let Some(parallelism) = self.parallelism {
            cfg.parallelism = parallelism.max(1);
        }
        if let Some(policy) = self.exit_policy {
            cfg.exit_policy = policy;
        }
        if self.node_name.is_some() {
            cfg.master_node_name = self.node_name;
        }
        if self.user.is_some() {
            cfg.ssh_user = self.user;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring .env: {}", e);
        }
    }

    // Logs go to stderr, progress and the summary to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vxlan_teardown=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut cli = Cli::parse();
    let dry_run = cli.dry_run;
    let json = cli.json;
    let nodes = std::mem::take(&mut cli.nodes);
    let mut cfg = Config::load();
    cli.apply(&mut cfg);

    match run(cfg, nodes, dry_run, json).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(sweep::EXIT_ABORTED as u8)
        }
    }
}

async fn run(cfg: Config, nodes: Vec<Node>, dry_run: bool, json: bool) -> anyhow::Result<u8> {
    if cfg.bridges.is_empty() {
        anyhow::bail!("No OVS bridges given");
    }

    let local_name = match cfg.master_node_name.clone() {
        Some(name) => name,
        None => topology::local_node_name()?,
    };

    let directory: Arc<dyn NodeDirectory> = if nodes.is_empty() {
        Arc::new(KubectlDirectory::new(cfg.kubectl.clone()))
    } else {
        Arc::new(StaticDirectory::new(nodes))
    };
    let executor = Arc::new(SshExecutor::new(cfg.ssh_port, cfg.ssh_timeout()));
    let mut sweeper = Sweeper::new(
        directory,
        executor,
        local_name,
        cfg.bridges.clone(),
        cfg.parallelism,
    );

    let plan = sweeper.plan().await?;
    println!("Master node: {}", plan.master);
    println!("Worker nodes:");
    for worker in &plan.workers {
        println!("  {}: {}", worker.name, worker.address);
    }

    if dry_run {
        print!("{}", plan.render());
        return Ok(0);
    }

    let username = match cfg.ssh_user.clone() {
        Some(user) => user,
        None => credentials::current_username()?,
    };
    println!("Username: {}", username);
    let secret = credentials::prompt_secret("Enter sudo password: ")?;
    println!("Note: the same username and sudo password are used on all nodes.");
    let credential = Credential::new(username, secret);

    let summary = sweeper.execute(plan, credential).await;
    tracing::debug!(state = ?sweeper.state(), "Sweep complete");
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }

    let code = summary.exit_code(cfg.exit_policy);
    Ok(u8::try_from(code).unwrap_or(1))
}
