use std::path::Path;

use clap::Parser;
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use tracing_subscriber::EnvFilter;

use vertexmesh::config::{Cli, Config};
use vertexmesh::rpc::weight_server::{handle_request, WeightServerState};
use vertexmesh::weights::WeightStore;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config_path)?;

    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let _span = tracing::info_span!("weight_server").entered();

    let layer_dims = Config::read_layer_dims(Path::new(&config.layer_config_file))?;
    let num_layers = layer_dims.len().saturating_sub(1);

    let mut store = WeightStore::new(num_layers, config.learning_rate, config.block);
    for (layer, pair) in layer_dims.windows(2).enumerate() {
        let (in_dim, out_dim) = (pair[0], pair[1]);
        let bound = (6.0 / (in_dim + out_dim) as f32).sqrt();
        let w = Array2::random((in_dim, out_dim), Uniform::new(-bound, bound));
        store.layers[layer].insert("w", w);
    }
    let state = WeightServerState::new(store);

    tracing::info!(num_layers, port = config.weightserver_port, "weight server ready");
    serve(&state, config.weightserver_port)
}

fn serve(state: &WeightServerState, port: u16) -> anyhow::Result<()> {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::REP)?;
    socket.bind(&format!("tcp://*:{port}"))?;
    socket.set_rcvtimeo(1000)?;

    loop {
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
