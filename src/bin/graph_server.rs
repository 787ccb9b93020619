use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vertexmesh::adjacency::GraphShard;
use vertexmesh::config::{read_machines_file, Cli, Config, GnnType, Mode, PeerAddr};
use vertexmesh::dispatch::{ApplyRole, Dispatcher, ThreadDispatcher, WorkerEndpoints};
use vertexmesh::engine::{gather, ghost, scatter, Deadline, RelaunchBackoff, Scheduler};
use vertexmesh::ids::Direction;
use vertexmesh::rpc::graph_server::{handle_request, GraphServerState};
use vertexmesh::tensor::Tensor;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config_path)?;

    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let node_id: u32 = std::env::var("NODE_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let _span = tracing::info_span!("graph_server", node_id).entered();

    let layer_dims = Config::read_layer_dims(Path::new(&config.layer_config_file))?;
    let num_layers = (layer_dims.len() as u32).saturating_sub(1);
    let shard = GraphShard::load(Path::new(&config.dataset_dir).join("graph.bin").as_path())?;

    let all_peers: Vec<PeerAddr> =
        if config.dsh_machines_file.is_empty() { Vec::new() } else { read_machines_file(Path::new(&config.dsh_machines_file))? };
    let peers: Vec<PeerAddr> = all_peers.iter().filter(|p| p.node_id != node_id).cloned().collect();
    let barrier_participants = all_peers.len().max(1);

    let scheduler = Scheduler::new(num_layers, config.c_threads.max(1), shard.local_vtx_cnt, config.staleness, barrier_participants);
    let local_vtx_cnt = shard.local_vtx_cnt;
    let state = Arc::new(GraphServerState::new(shard, num_layers, scheduler));

    preload_inputs(&state, &config, &layer_dims, num_layers)?;

    let endpoints = WorkerEndpoints {
        graph_server_addr: format!("tcp://127.0.0.1:{}", config.dataserver_port),
        weight_server_addr: format!("tcp://127.0.0.1:{}", config.weightserver_port),
    };
    let dispatcher = ThreadDispatcher::new(endpoints);

    spawn_apply_driver(state.clone(), dispatcher, layer_dims.clone(), num_layers, config.mode, config.gnn_type);
    spawn_gather_driver(state.clone(), config.c_threads.max(1));

    spawn_scatter_sender(state.clone(), config.comm_thread_cnt.max(1), peers);
    spawn_ghost_receiver(state.clone(), config.comm_thread_cnt.max(1), config.ghost_port_base);

    spawn_scheduler_driver(state.clone(), config.num_epochs, num_layers);

    tracing::info!(local_vtx_cnt, num_layers, "graph server ready");
    serve(&state, config.dataserver_port)
}

/// Loads the input feature matrix into layer 0's `h` and the label matrix
/// into the final layer's `lab`, mirroring the original engine's startup
/// preprocessing (§4.1.1, §4.2's PULL of `lab` on the final forward layer).
fn preload_inputs(state: &GraphServerState, config: &Config, layer_dims: &[usize], num_layers: u32) -> anyhow::Result<()> {
    let rows = state.shard.local_vtx_cnt as usize;
    let in_dim = *layer_dims.first().unwrap_or(&1);
    let out_dim = *layer_dims.last().unwrap_or(&1);
    let last_layer = num_layers.saturating_sub(1);

    let h = Tensor::load_raw("h", Path::new(&config.features_file), rows, in_dim)?;
    let lab = Tensor::load_raw("lab", Path::new(&config.labels_file), rows, out_dim)?;

    let mut tensors = state.tensors.lock().unwrap();
    tensors.layer_mut(0)?.insert(h);
    tensors.layer_mut(last_layer)?.insert(lab);
    Ok(())
}

/// Runs the apply-vertex driver thread: pops chunks dispatched by the
/// scheduler to the apply stage, inserts them into the timeout table, and
/// hands them to the `Dispatcher`. A relaunch sweep re-dispatches chunks
/// whose deadline has passed, using the same descriptor so the first
/// response still wins (§4.1.5, §4.2).
fn spawn_apply_driver(
    state: Arc<GraphServerState>,
    dispatcher: ThreadDispatcher,
    layer_dims: Vec<usize>,
    num_layers: u32,
    mode: Mode,
    gnn_type: GnnType,
) {
    let deadlines: Arc<Mutex<HashMap<vertexmesh::ids::ChunkDescriptor, Deadline>>> = Arc::new(Mutex::new(HashMap::new()));
    let backoff = Arc::new(Mutex::new(RelaunchBackoff::server_default()));
    let last_layer = num_layers.saturating_sub(1);

    {
        let state = state.clone();
        let deadlines = deadlines.clone();
        let layer_dims = layer_dims.clone();
        std::thread::spawn(move || loop {
            if state.scheduler.halt.load(Ordering::Relaxed) {
                return;
            }
            let Some(chunk) = state.scheduler.apply_queue.pop_timeout(Duration::from_secs(1)) else {
                continue;
            };
            state.scheduler.timeout_table.insert(chunk);
            let role = apply_role(chunk.layer, last_layer, chunk.direction, gnn_type);
            let dims = layer_dims_for(&layer_dims, chunk.layer);
            if matches!(mode, Mode::Lambda | Mode::Cpu | Mode::Gpu) {
                if let Err(e) = dispatcher.dispatch(chunk, dims, role) {
                    tracing::error!(?chunk, error = %e, "dispatch failed");
                    continue;
                }
            }
            deadlines.lock().unwrap().insert(chunk, Deadline::new(backoff.lock().unwrap().current()));
        });
    }

    std::thread::spawn(move || loop {
        if state.scheduler.halt.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
        let mut expired = Vec::new();
        {
            let mut guard = deadlines.lock().unwrap();
            guard.retain(|chunk, deadline| {
                if state.scheduler.timeout_table.contains(chunk) && deadline.expired() {
                    expired.push(*chunk);
                    false
                } else {
                    state.scheduler.timeout_table.contains(chunk)
                }
            });
        }
        for chunk in expired {
            let mut b = backoff.lock().unwrap();
            match b.record_failure() {
                Some(_) => {
                    tracing::warn!(?chunk, failures = b.consecutive_failures(), "relaunching chunk after timeout");
                    state.scheduler.apply_queue.push(chunk);
                }
                None => {
                    tracing::error!(?chunk, "abort limit reached, check system settings (timeouts/backoff) and network health");
                    std::process::exit(1);
                }
            }
        }
    });
}

fn layer_dims_for(layer_dims: &[usize], layer: u32) -> (usize, usize) {
    let i = layer as usize;
    (layer_dims.get(i).copied().unwrap_or(1), layer_dims.get(i + 1).copied().unwrap_or(1))
}

fn apply_role(layer: u32, last_layer: u32, dir: Direction, _gnn_type: GnnType) -> ApplyRole {
    match dir {
        Direction::Forward if layer == last_layer => ApplyRole::ForwardFinal,
        Direction::Forward => ApplyRole::ForwardHidden,
        Direction::Backward => ApplyRole::Backward,
    }
}

/// Runs the gather-stage worker pool: pops chunks routed to the gather
/// queue, reads the appropriate source/ghost tensor for the chunk's
/// (layer, direction), runs the gather kernel, writes `ah`/`aTg` into the
/// tensor map, and advances the chunk to apply (§4.1.1).
fn spawn_gather_driver(state: Arc<GraphServerState>, num_threads: u32) {
    for _ in 0..num_threads.max(1) {
        let state = state.clone();
        std::thread::spawn(move || loop {
            if state.scheduler.halt.load(Ordering::Relaxed) {
                return;
            }
            let Some(chunk) = state.scheduler.gather_queue.pop_timeout(Duration::from_secs(1)) else {
                continue;
            };
            if let Err(e) = run_gather(&state, chunk) {
                tracing::error!(?chunk, error = %e, "gather failed");
                continue;
            }
            state.scheduler.advance(chunk);
        });
    }
}

/// Forward gather at layer `L` reads `h` from `max(L-1, 0)` (layer 0 reads
/// its own preloaded input features; layer `L>0` reads the previous layer's
/// apply output). Backward gather at layer `L` reads `grad` from
/// `min(L+1, lastLayer)` (the last layer reads the grad `ForwardFinal`
/// produced for itself). The gathered result always writes to the chunk's
/// own layer slot, matching `handle_push`/`handle_pull`'s addressing.
fn run_gather(state: &GraphServerState, chunk: vertexmesh::ids::ChunkDescriptor) -> anyhow::Result<()> {
    let last_layer = state.scheduler.num_layers().saturating_sub(1);
    let (source_layer, source_name, ghost_name, dest_name) = match chunk.direction {
        Direction::Forward => (chunk.layer.saturating_sub(1).min(last_layer), "h", "fg", "ah"),
        Direction::Backward => ((chunk.layer + 1).min(last_layer), "grad", "bg", "aTg"),
    };
    let adj = match chunk.direction {
        Direction::Forward => &state.shard.forward_adj,
        Direction::Backward => &state.shard.backward_adj,
    };
    let (lo, hi) = (chunk.low_bound as usize, chunk.up_bound as usize);

    let result = {
        let tensors = state.tensors.lock().unwrap();
        let source_map = tensors.layer(source_layer)?;
        let source = source_map.get(source_name)?;
        let ghost = source_map.get(ghost_name).ok();
        gather::gather_range(adj, &state.shard.norm_factor, state.shard.local_vtx_cnt, source, ghost, lo, hi)
    };

    let total_rows = state.shard.local_vtx_cnt as usize;
    let feat_dim = result.ncols();
    let mut tensors = state.tensors.lock().unwrap();
    let dest_layer = tensors.layer_mut(chunk.feat_layer())?;
    let dest = dest_layer.get_or_alloc(dest_name, total_rows, feat_dim);
    dest.row_slice_mut(lo, hi).assign(&result);
    Ok(())
}

/// Runs the scatter-sender worker pool: pops chunks routed to the scatter
/// queue, batches each destination peer's replicated rows into
/// ghost-update messages sized under `MAX_MSG_SIZE`, sends them over a
/// lazily-connected PUSH socket per peer, then advances the chunk to
/// completion (§4.1.3, §4.4). On a single-node cluster `peers` is empty and
/// every chunk trivially completes with no socket I/O.
fn spawn_scatter_sender(state: Arc<GraphServerState>, num_threads: u32, peers: Vec<PeerAddr>) {
    let peer_addrs: HashMap<u32, String> = peers.into_iter().map(|p| (p.node_id, p.ip)).collect();
    let ctx = zmq::Context::new();
    for _ in 0..num_threads.max(1) {
        let state = state.clone();
        let ctx = ctx.clone();
        let peer_addrs = peer_addrs.clone();
        std::thread::spawn(move || {
            let mut sockets: HashMap<u32, zmq::Socket> = HashMap::new();
            loop {
                if state.scheduler.halt.load(Ordering::Relaxed) {
                    return;
                }
                let Some(chunk) = state.scheduler.scatter_queue.pop_timeout(Duration::from_secs(1)) else {
                    continue;
                };
                if let Err(e) = run_scatter(&state, &ctx, &mut sockets, &peer_addrs, chunk) {
                    tracing::error!(?chunk, error = %e, "scatter failed");
                }
                state.scheduler.advance(chunk);
            }
        });
    }
}

fn run_scatter(
    state: &GraphServerState,
    ctx: &zmq::Context,
    sockets: &mut HashMap<u32, zmq::Socket>,
    peer_addrs: &HashMap<u32, String>,
    chunk: vertexmesh::ids::ChunkDescriptor,
) -> anyhow::Result<()> {
    let (lo, hi) = (chunk.low_bound, chunk.up_bound);
    let shares = state.shard.outgoing_for_range(lo, hi);
    if shares.is_empty() {
        return Ok(());
    }
    let source_name = match chunk.direction {
        Direction::Forward => "h",
        Direction::Backward => "grad",
    };

    let rows = {
        let tensors = state.tensors.lock().unwrap();
        let layer = tensors.layer(chunk.feat_layer())?;
        let source = layer.get(source_name)?;
        scatter::chunk_output_rows(source, lo as usize, hi as usize).to_owned()
    };
    let feat_dim = rows.ncols();
    let cap = scatter::batch_capacity(feat_dim);

    for (peer, entries) in shares {
        for batch in entries.chunks(cap) {
            let payload: Vec<(u32, &[f32])> = batch
                .iter()
                .map(|(local_row, wire_gvid)| {
                    let row_idx = (*local_row - lo) as usize;
                    (*wire_gvid, rows.row(row_idx).to_slice().expect("row slab is standard-layout contiguous"))
                })
                .collect();
            let bytes = ghost::encode_update(feat_dim as u32, chunk.layer, chunk.direction, &payload);

            let socket = match sockets.get(&peer) {
                Some(s) => s,
                None => {
                    let addr = match peer_addrs.get(&peer) {
                        Some(addr) => addr,
                        None => {
                            tracing::error!(peer, "no address for peer in machines roster, dropping ghost update");
                            continue;
                        }
                    };
                    let socket = ctx.socket(zmq::PUSH)?;
                    socket.connect(&format!("tcp://{addr}"))?;
                    sockets.insert(peer, socket);
                    sockets.get(&peer).expect("just inserted")
                }
            };
            socket.send(bytes, 0)?;
        }
    }
    Ok(())
}

/// Runs the ghost-receiver worker pool: each thread binds its own port
/// starting at `port_base` and loops receiving ghost-update messages with a
/// 1 s poll timeout (to stay responsive to halt), decoding them and writing
/// rows into the matching `fg`/`bg` ghost tensor, then bumping the
/// scheduler's per-(layer, direction) receipt counter (§4.4). Skipped
/// entirely when this shard has no destination ghosts to receive.
fn spawn_ghost_receiver(state: Arc<GraphServerState>, num_threads: u32, port_base: u16) {
    if state.shard.dst_ghost_cnt == 0 {
        return;
    }
    for i in 0..num_threads.max(1) {
        let state = state.clone();
        let port = port_base + i as u16;
        std::thread::spawn(move || {
            let ctx = zmq::Context::new();
            let socket = match ctx.socket(zmq::PULL) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "ghost receiver socket creation failed");
                    return;
                }
            };
            if let Err(e) = socket.bind(&format!("tcp://*:{port}")) {
                tracing::error!(error = %e, port, "ghost receiver bind failed");
                return;
            }
            if let Err(e) = socket.set_rcvtimeo(1000) {
                tracing::error!(error = %e, "ghost receiver set_rcvtimeo failed");
            }
            loop {
                if state.scheduler.halt.load(Ordering::Relaxed) {
                    return;
                }
                let bytes = match socket.recv_bytes(0) {
                    Ok(b) => b,
                    Err(zmq::Error::EAGAIN) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "ghost receive failed");
                        continue;
                    }
                };
                if let Err(e) = handle_ghost_update(&state, &bytes) {
                    tracing::error!(error = %e, "ghost update handling failed");
                }
            }
        });
    }
}

fn handle_ghost_update(state: &GraphServerState, bytes: &[u8]) -> anyhow::Result<()> {
    let update = ghost::decode_update(bytes)?;
    let ghost_name = match update.dir {
        Direction::Forward => "fg",
        Direction::Backward => "bg",
    };
    let count = update.entries.len() as u32;
    let ghost_rows = state.shard.dst_ghost_cnt as usize;
    {
        let mut tensors = state.tensors.lock().unwrap();
        let layer = tensors.layer_mut(update.layer)?;
        let ghost_tensor = layer.get_or_alloc(ghost_name, ghost_rows, update.feat_dim as usize);
        // `apply_update`'s own progress counter is scratch here: the
        // authoritative one lives on the scheduler, keyed by (layer, dir),
        // and is bumped explicitly below.
        let scratch = ghost::GhostProgress::default();
        ghost::apply_update(&state.shard, &update, ghost_tensor, &scratch)?;
    }
    state.scheduler.record_ghost_receipt(update.layer, update.dir, count);
    Ok(())
}

/// Runs the long-lived scheduler thread: for each epoch, sweeps forward
/// through layers `0..numLayers` then backward through `numLayers-1..0`,
/// registering and enqueueing each (layer, direction) in turn and blocking
/// on the cross-node barrier between them (§4.1.4). Halts the whole engine
/// once every epoch has completed.
fn spawn_scheduler_driver(state: Arc<GraphServerState>, num_epochs: u32, num_layers: u32) {
    std::thread::spawn(move || {
        for epoch in 0..num_epochs {
            if state.scheduler.halt.load(Ordering::Relaxed) {
                break;
            }
            tracing::info!(epoch, "epoch started");
            if !run_epoch(&state, epoch, num_layers) {
                break;
            }
        }
        state.scheduler.request_halt();
    });
}

fn run_epoch(state: &GraphServerState, epoch: u32, num_layers: u32) -> bool {
    let expected_ghost = state.shard.dst_ghost_cnt;

    for layer in 0..num_layers {
        state.scheduler.register_and_enqueue_layer(layer, Direction::Forward, epoch, expected_ghost);
        if !state.scheduler.wait_for_layer_ready(layer, Direction::Forward) {
            return false;
        }
        if !state.scheduler.cross_node_barrier() {
            return false;
        }
    }

    for layer in (0..num_layers).rev() {
        state.scheduler.register_and_enqueue_layer(layer, Direction::Backward, epoch, expected_ghost);
        if !state.scheduler.wait_for_layer_ready(layer, Direction::Backward) {
            return false;
        }
        if !state.scheduler.cross_node_barrier() {
            return false;
        }
    }

    tracing::info!(epoch, "epoch complete");
    true
}

fn serve(state: &GraphServerState, port: u16) -> anyhow::Result<()> {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::REP)?;
    socket.bind(&format!("tcp://*:{port}"))?;
    socket.set_rcvtimeo(1000)?;

    loop {
        if state.scheduler.halt.load(Ordering::Relaxed) {
            return Ok(());
        }
        let frames = match socket.recv_multipart(0) {
            Ok(f) => f,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        };
        match handle_request(state, &frames) {
            Ok(reply) => socket.send_multipart(reply, 0)?,
            Err(e) => {
                tracing::error!(error = %e, "request handling failed");
                socket.send_multipart([vertexmesh::wire::ACK_DISCARDED.to_le_bytes().to_vec()], 0)?;
            }
        }
    }
}
