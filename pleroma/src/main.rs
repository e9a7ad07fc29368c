use anyhow::Result;
use clap::Parser;
use log::info;
use pleroma_rt::NodeConfig;

/// Start a pleroma node.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Port to listen on for peer connections; 0 picks an ephemeral one.
    #[arg(long, default_value_t = pleroma_rt::DEFAULT_PORT)]
    port: u16,

    /// This node's own id, used when peers address it.
    #[arg(long, default_value_t = 0)]
    node_id: u64,

    /// Name of a kernel-registered entity to instantiate and run on boot
    /// (e.g. a user module's entrypoint entity, once one is registered).
    #[arg(long)]
    entity: Option<String>,

    /// The entity method to invoke as the program's entrypoint.
    #[arg(long, default_value = "main")]
    entry: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = NodeConfig::builder()
        .bind_port(args.port)
        .node_id(args.node_id)
        .build()?;

    let node = pleroma::bootstrap(config)?;
    info!("node {} up, n_running_programs = {}", node.node_id(), node.n_running_programs());

    if let Some(entity) = &args.entity {
        node.start_program(entity, &args.entry, Vec::new())?;
    }

    // The router and every vat run on their own threads; park the main
    // thread so the process stays alive to service them.
    loop {
        std::thread::park();
    }
}
