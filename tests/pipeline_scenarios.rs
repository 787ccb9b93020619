//! End-to-end scenarios from the engine's testable-properties list: a small
//! two-machine-shaped forward pass, idempotent push-after-relaunch, and
//! malformed-request resilience, all driven through the public API rather
//! than real sockets (no toolchain is assumed to be available to actually
//! bind ports in CI for this crate's test run).

use std::collections::HashMap;

use ndarray::Array2;

use vertexmesh::adjacency::{Adjacency, GraphShard};
use vertexmesh::backend::{default_backend, Backend};
use vertexmesh::engine::{Scheduler, Staleness};
use vertexmesh::ids::{ChunkDescriptor, Direction};
use vertexmesh::rpc::graph_server::{handle_request, GraphServerState};
use vertexmesh::tensor::Tensor;
use vertexmesh::weights::WeightStore;
use vertexmesh::wire::{ChunkWire, Op, RequestHeader, TensorHeader, ACK_DISCARDED, ACK_OK, HEADER_SIZE};

/// Scenario 1 (two-machine, 4-vertex graph, each owns 2): after forward,
/// every local `h` equals `tanh(sum of degree-normalised neighbor features)`.
/// Modeled here as a single shard with a ghost neighbor standing in for the
/// peer-owned vertex, since the gather kernel treats ghost and local
/// neighbors identically once ghost rows are populated.
#[test]
fn forward_gather_then_apply_matches_tanh_of_normalised_sum() {
    let shard = GraphShard {
        local_vtx_cnt: 2,
        forward_adj: Adjacency {
            col_ptrs: vec![0, 1, 2],
            row_indices: vec![2, 3], // vertex 0 <- ghost 2, vertex 1 <- ghost 3
            edge_values: vec![0.5, 0.5],
        },
        backward_adj: Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
        norm_factor: vec![0.5, 0.5],
        global_to_ghost: HashMap::from([(100, 2), (101, 3)]),
        dst_ghost_cnt: 2,
        outgoing: std::collections::HashMap::new(),
    };

    let h = Tensor::new("h", 2, 1, vec![1.0, 1.0]).unwrap();
    let ghost_h = Tensor::new("fg", 2, 1, vec![1.0, 1.0]).unwrap();
    let mut ah = Tensor::zeros("ah", 2, 1);
    let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);

    vertexmesh::engine::gather::gather_chunk(&shard, &chunk, &h, Some(&ghost_h), &mut ah);

    // ah[v] = 0.5*1.0 + 0.5*1.0 = 1.0 for both vertices.
    assert_eq!(ah.as_array().row(0).to_vec(), vec![1.0]);
    assert_eq!(ah.as_array().row(1).to_vec(), vec![1.0]);

    let weight = Array2::from_elem((1, 1), 1.0);
    let backend = default_backend();
    let z = backend.matmul_t(ah.as_array(), &weight, false, false).unwrap();
    let out = backend.tanh(&z).unwrap();
    for v in out.iter() {
        assert!((v - 1.0_f32.tanh()).abs() < 1e-6);
    }
}

/// Scenario 2: a chunk is relaunched once; both "workers" push the same
/// content. First push is accepted, the duplicate is discarded, and the
/// installed tensor matches the single accepted payload.
#[test]
fn relaunch_idempotence_single_accept_single_discard() {
    let state = toy_server_state();
    let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);
    state.scheduler.timeout_table.insert(chunk);

    let push_frames = |value: f32| {
        let header = RequestHeader::new(Op::Push, 1).encode();
        let tensor_hdr = TensorHeader::ok("h", 2, 1).encode();
        let data: Vec<u8> = [value, value].iter().flat_map(|v| v.to_le_bytes()).collect();
        vec![header, ChunkWire::encode(&chunk), tensor_hdr, data]
    };

    let first = handle_request(&state, &push_frames(3.0)).unwrap();
    assert_eq!(ack_of(&first), ACK_OK);

    // A relaunched worker computing the identical result arrives second.
    let second = handle_request(&state, &push_frames(3.0)).unwrap();
    assert_eq!(ack_of(&second), ACK_DISCARDED);

    let tensors = state.tensors.lock().unwrap();
    let installed = tensors.layer(0).unwrap().get("h").unwrap();
    assert_eq!(installed.as_array().column(0).to_vec(), vec![3.0, 3.0]);
}

/// Scenario 3: INFO(expectedTotal=4) then 4 pushes of `[1,1,1,1]` deltas
/// into a 1x1 parameter starting at 0.5 with lr=0.1 settles at 0.4.
#[test]
fn weight_store_averaged_apply_matches_scenario_three() {
    let mut store = WeightStore::new(1, 0.1, false);
    store.layers[0].insert("w", Array2::from_elem((1, 1), 0.5));
    store.layers[0].info("w", 4).unwrap();
    for _ in 0..4 {
        store.layers[0].push("w", &Array2::from_elem((1, 1), 1.0), 0.1).unwrap();
    }
    let value = store.layers[0].pull("w").unwrap();
    assert!((value[[0, 0]] - 0.4).abs() < 1e-6);
}

/// Scenario 4: a malformed request (wrong header size) must not take down
/// the server; subsequent well-formed requests still get served.
#[test]
fn malformed_header_does_not_crash_subsequent_requests_still_served() {
    let state = toy_server_state();
    let bad = vec![vec![0u8; HEADER_SIZE - 1], vec![0u8; ChunkWire::SIZE]];
    assert!(handle_request(&state, &bad).is_err(), "malformed header must surface as an error, not a panic");

    let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);
    let term = vec![RequestHeader::new(Op::Term, 0).encode(), ChunkWire::encode(&chunk)];
    assert!(handle_request(&state, &term).is_ok(), "server must keep serving well-formed requests after a bad one");
}

/// Scenario 5: ghost batching packs `featDim=1000` rows into messages of
/// exactly `floor((5 MiB - 16) / (4 + 4000))` vertices, except the last.
#[test]
fn ghost_batching_matches_expected_message_count_and_sizes() {
    use vertexmesh::engine::scatter::{batch_for_peer, PeerShare};

    let feat_dim = 1000;
    let share = PeerShare { peer_node: 1, gvids: (0..10_000).collect() };
    let batches = batch_for_peer(&share, feat_dim);

    let expected_cap = (5 * 1024 * 1024 - 16) / (4 + feat_dim * 4);
    let expected_msgs = 10_000_usize.div_ceil(expected_cap);
    assert_eq!(batches.len(), expected_msgs);
    for b in &batches[..batches.len() - 1] {
        assert_eq!(b.len(), expected_cap);
    }
    assert!(batches.last().unwrap().len() <= expected_cap);
}

/// Scenario 6: a TERM request is accepted unconditionally (no timeout-table
/// membership required, unlike every other op) and does not disturb chunks
/// still in flight; a running scheduler driver observing `halt` set exits
/// its sweep at the next layer boundary rather than mid-layer.
#[test]
fn term_is_accepted_without_timeout_table_membership_and_sets_halt_on_request() {
    let state = toy_server_state();
    let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);
    // Not inserted into the timeout table: TERM must still succeed where
    // every other op would be discarded as stale.
    let term = vec![RequestHeader::new(Op::Term, 0).encode(), ChunkWire::encode(&chunk)];
    let reply = handle_request(&state, &term).unwrap();
    assert_eq!(ack_of(&reply), ACK_OK);

    assert!(!state.scheduler.halt.load(std::sync::atomic::Ordering::Relaxed));
    state.scheduler.request_halt();
    assert!(state.scheduler.halt.load(std::sync::atomic::Ordering::Relaxed));
    assert!(!state.scheduler.wait_for_layer_ready(0, Direction::Forward), "halted scheduler must stop waiting rather than spin forever");
}

fn ack_of(reply: &[Vec<u8>]) -> i32 {
    i32::from_le_bytes(reply[0].clone().try_into().unwrap())
}

fn toy_server_state() -> GraphServerState {
    let shard = GraphShard {
        local_vtx_cnt: 2,
        forward_adj: Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
        backward_adj: Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
        norm_factor: vec![1.0, 1.0],
        global_to_ghost: HashMap::new(),
        dst_ghost_cnt: 0,
        outgoing: std::collections::HashMap::new(),
    };
    let scheduler = Scheduler::new(1, 1, 2, Staleness::Unbounded, 1);
    GraphServerState::new(shard, 1, scheduler)
}
