use std::collections::HashMap;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vertexmesh::config::Cli;
use vertexmesh::dispatch::{ApplyRole, WorkerEndpoints};
use vertexmesh::ids::{ChunkDescriptor, Direction};
use vertexmesh::rpc::worker_client::run_once;

/// A real ephemeral compute worker, for `Mode::Lambda` deployments where an
/// actual cloud-function trigger execs this binary per chunk instead of
/// `ThreadDispatcher` spawning an in-process thread. Its one input is the
/// assignment file path, following the same single-config-argument CLI
/// surface the other two binaries use; the file carries everything an
/// invocation event would (endpoints, chunk identity, role, layer shape).
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let assignment = Assignment::from_file(&cli.config_path)?;

    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let _span = tracing::info_span!("compute_worker", chunk = assignment.chunk.global_id).entered();

    run_once(&assignment.endpoints, assignment.chunk, assignment.layer_dims, assignment.role)?;
    tracing::info!("chunk completed");
    Ok(())
}

struct Assignment {
    endpoints: WorkerEndpoints,
    chunk: ChunkDescriptor,
    layer_dims: (usize, usize),
    role: ApplyRole,
}

impl Assignment {
    fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut kv = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
                kv.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        let get = |k: &str| -> anyhow::Result<String> {
            kv.get(k).cloned().ok_or_else(|| anyhow::anyhow!("missing assignment key '{k}'"))
        };
        let get_u32 = |k: &str| -> anyhow::Result<u32> { Ok(get(k)?.parse()?) };

        let direction = match get("direction")?.as_str() {
            "forward" => Direction::Forward,
            "backward" => Direction::Backward,
            other => anyhow::bail!("unknown direction '{other}'"),
        };
        let role = match get("role")?.as_str() {
            "forward_hidden" => ApplyRole::ForwardHidden,
            "forward_final" => ApplyRole::ForwardFinal,
            "backward" => ApplyRole::Backward,
            "edge" => ApplyRole::Edge,
            other => anyhow::bail!("unknown role '{other}'"),
        };
        let chunk = ChunkDescriptor::new(
            get_u32("node_id")?,
            get_u32("chunks_per_node")?,
            get_u32("local_id")?,
            get_u32("low_bound")?,
            get_u32("up_bound")?,
            get_u32("layer")?,
            direction,
            get_u32("epoch")?,
        );
        Ok(Self {
            endpoints: WorkerEndpoints { graph_server_addr: get("graph_server_addr")?, weight_server_addr: get("weight_server_addr")? },
            chunk,
            layer_dims: (get("in_dim")?.parse()?, get("out_dim")?.parse()?),
            role,
        })
    }
}
