use std::collections::HashMap;
use std::path::Path;

use clap::Parser;

use crate::engine::Staleness;
use crate::error::{EngineError, EngineResult};

/// Runtime mode for the apply stage's dispatch target (§1, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Lambda,
    Cpu,
    Gpu,
}

/// GNN variant in use. Only `Gcn` ships today; the field exists so
/// additional variants (with edge-NN layers) have somewhere to register
/// (§5's apply-edge driver thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnnType {
    Gcn,
}

/// One field per entry in §6's enumerated configuration list. Everything is
/// a plain value, not a builder, because every field is required up front
/// (the original engine reads the same flat key/value layout once at
/// startup and never mutates it).
#[derive(Debug, Clone)]
pub struct Config {
    pub dsh_machines_file: String,
    pub my_pr_ip_file: String,
    pub my_pub_ip_file: String,
    pub weightserver_ip_file: String,
    pub layer_config_file: String,
    pub features_file: String,
    pub labels_file: String,
    pub dataset_dir: String,
    pub out_file: String,
    pub dataserver_port: u16,
    pub weightserver_port: u16,
    pub coordserver_port: u16,
    pub num_lambdas_forward: u32,
    pub num_lambdas_backward: u32,
    pub num_epochs: u32,
    pub val_freq: u32,
    pub staleness: Staleness,
    pub mode: Mode,
    pub gnn_type: GnnType,
    pub d_threads: u32,
    pub c_threads: u32,
    /// Number of scatter-sender and ghost-receiver threads per graph server
    /// (§5's `commThdCnt`). Each ghost-receiver thread binds its own port
    /// starting at `ghost_port_base`.
    pub comm_thread_cnt: u32,
    pub ghost_port_base: u16,
    pub undirected: bool,
    pub force_preprocess: bool,
    pub block: bool,
    pub learning_rate: f32,
}

/// One peer in the `dshMachinesFile` roster: a node id and the address its
/// graph server listens on.
#[derive(Debug, Clone)]
pub struct PeerAddr {
    pub node_id: u32,
    pub ip: String,
}

/// Reads the `dshMachinesFile` peer roster, one `node_id ip` pair per line
/// (`#` starting a comment), mirroring `Config::from_file`'s own parsing
/// idiom.
pub fn read_machines_file(path: &Path) -> EngineResult<Vec<PeerAddr>> {
    let text = std::fs::read_to_string(path)?;
    let mut peers = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let node_id = parts
            .next()
            .ok_or_else(|| EngineError::ConfigError(format!("malformed machines file line '{line}'")))?
            .parse::<u32>()
            .map_err(|_| EngineError::ConfigError(format!("bad node id in '{line}'")))?;
        let ip = parts
            .next()
            .ok_or_else(|| EngineError::ConfigError(format!("malformed machines file line '{line}'")))?
            .to_string();
        peers.push(PeerAddr { node_id, ip });
    }
    Ok(peers)
}

impl Config {
    /// Reads `key value` pairs, one per line, `#` starting a comment,
    /// mirroring the original engine's own trivial config reader — this is
    /// deliberately not a generic config framework (toml/yaml/etc. parsing
    /// crates are a non-goal here), just enough to populate every field.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut kv = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default().trim();
            let value = parts.next().unwrap_or_default().trim();
            if !key.is_empty() {
                kv.insert(key.to_string(), value.to_string());
            }
        }
        Self::from_map(&kv)
    }

    fn from_map(kv: &HashMap<String, String>) -> EngineResult<Self> {
        let get = |k: &str| -> EngineResult<String> {
            kv.get(k).cloned().ok_or_else(|| EngineError::ConfigError(format!("missing required key '{k}'")))
        };
        let get_u32 = |k: &str| -> EngineResult<u32> {
            get(k)?.parse().map_err(|_| EngineError::ConfigError(format!("'{k}' is not a u32")))
        };
        let get_u16 = |k: &str| -> EngineResult<u16> {
            get(k)?.parse().map_err(|_| EngineError::ConfigError(format!("'{k}' is not a u16")))
        };
        let get_bool = |k: &str| -> EngineResult<bool> {
            match get(k)?.as_str() {
                "1" | "true" => Ok(true),
                "0" | "false" => Ok(false),
                other => Err(EngineError::ConfigError(format!("'{k}' must be 0/1/true/false, got '{other}'"))),
            }
        };

        let staleness = match get("staleness")?.as_str() {
            "inf" | "unbounded" => Staleness::Unbounded,
            s => Staleness::Bounded(s.parse().map_err(|_| EngineError::ConfigError("bad 'staleness'".into()))?),
        };
        let mode = match get("mode")?.to_uppercase().as_str() {
            "LAMBDA" => Mode::Lambda,
            "CPU" => Mode::Cpu,
            "GPU" => Mode::Gpu,
            other => return Err(EngineError::ConfigError(format!("unknown mode '{other}'"))),
        };
        let gnn_type = match get("gnn_type")?.to_uppercase().as_str() {
            "GCN" => GnnType::Gcn,
            other => return Err(EngineError::ConfigError(format!("unknown gnn_type '{other}'"))),
        };
        let val_freq = get_u32("valFreq")?;
        if val_freq < 1 {
            return Err(EngineError::ConfigError("'valFreq' must be >= 1".into()));
        }

        Ok(Self {
            dsh_machines_file: get("dshMachinesFile")?,
            my_pr_ip_file: get("myPrIpFile")?,
            my_pub_ip_file: get("myPubIpFile")?,
            weightserver_ip_file: get("weightserverIPFile")?,
            layer_config_file: get("layerConfigFile")?,
            features_file: get("featuresFile")?,
            labels_file: get("labelsFile")?,
            dataset_dir: get("datasetDir")?,
            out_file: get("outFile")?,
            dataserver_port: get_u16("dataserverPort")?,
            weightserver_port: get_u16("weightserverPort")?,
            coordserver_port: get_u16("coordserverPort")?,
            num_lambdas_forward: get_u32("numLambdasForward")?,
            num_lambdas_backward: get_u32("numLambdasBackward")?,
            num_epochs: get_u32("numEpochs")?,
            val_freq,
            staleness,
            mode,
            gnn_type,
            d_threads: get_u32("dThreads")?,
            c_threads: get_u32("cThreads")?,
            comm_thread_cnt: get_u32("commThdCnt")?,
            ghost_port_base: get_u16("ghostPortBase")?,
            undirected: get_bool("undirected")?,
            force_preprocess: get_bool("forcePreprocess")?,
            block: get_bool("BLOCK")?,
            learning_rate: get("learningRate")?.parse().map_err(|_| EngineError::ConfigError("bad 'learningRate'".into()))?,
        })
    }

    /// Parses the one-integer-per-line layer dimension file into
    /// `(input_dim, ...hidden_dims..., output_dim)`.
    pub fn read_layer_dims(path: &Path) -> EngineResult<Vec<usize>> {
        let text = std::fs::read_to_string(path)?;
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.parse::<usize>().map_err(|_| EngineError::ConfigError(format!("bad layer dim '{l}'"))))
            .collect()
    }
}

/// Single command-line surface shared by all three binaries: a path to the
/// config file. No subcommands, no flag sprawl, matching the non-goal of
/// introducing any operator-facing complexity beyond what §6 already asks
/// for.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Path to the role's config file (one `key value` pair per line).
    pub config_path: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kv() -> HashMap<String, String> {
        [
            ("dshMachinesFile", "machines.txt"),
            ("myPrIpFile", "pr.ip"),
            ("myPubIpFile", "pub.ip"),
            ("weightserverIPFile", "ws.ip"),
            ("layerConfigFile", "layers.txt"),
            ("featuresFile", "features.bin"),
            ("labelsFile", "labels.bin"),
            ("datasetDir", "/data"),
            ("outFile", "/out/output"),
            ("dataserverPort", "8000"),
            ("weightserverPort", "9000"),
            ("coordserverPort", "7000"),
            ("numLambdasForward", "4"),
            ("numLambdasBackward", "4"),
            ("numEpochs", "10"),
            ("valFreq", "1"),
            ("staleness", "0"),
            ("mode", "CPU"),
            ("gnn_type", "GCN"),
            ("dThreads", "4"),
            ("cThreads", "4"),
            ("commThdCnt", "2"),
            ("ghostPortBase", "9100"),
            ("undirected", "true"),
            ("forcePreprocess", "false"),
            ("BLOCK", "true"),
            ("learningRate", "0.01"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn parses_a_complete_config() {
        let cfg = Config::from_map(&sample_kv()).unwrap();
        assert_eq!(cfg.num_epochs, 10);
        assert_eq!(cfg.mode, Mode::Cpu);
        assert_eq!(cfg.staleness, Staleness::Bounded(0));
    }

    #[test]
    fn rejects_val_freq_below_one() {
        let mut kv = sample_kv();
        kv.insert("valFreq".into(), "0".into());
        assert!(matches!(Config::from_map(&kv), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut kv = sample_kv();
        kv.remove("outFile");
        assert!(matches!(Config::from_map(&kv), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn staleness_unbounded_keyword() {
        let mut kv = sample_kv();
        kv.insert("staleness".into(), "unbounded".into());
        let cfg = Config::from_map(&kv).unwrap();
        assert_eq!(cfg.staleness, Staleness::Unbounded);
    }

    #[test]
    fn parses_comm_thread_cnt_and_ghost_port_base() {
        let cfg = Config::from_map(&sample_kv()).unwrap();
        assert_eq!(cfg.comm_thread_cnt, 2);
        assert_eq!(cfg.ghost_port_base, 9100);
    }

    #[test]
    fn reads_machines_file_skipping_comments_and_blanks() {
        let path = std::env::temp_dir().join(format!("vertexmesh-machines-test-{}.txt", std::process::id()));
        std::fs::write(&path, "# comment\n0 10.0.0.1\n\n1 10.0.0.2\n").unwrap();
        let peers = read_machines_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, 0);
        assert_eq!(peers[0].ip, "10.0.0.1");
        assert_eq!(peers[1].node_id, 1);
        assert_eq!(peers[1].ip, "10.0.0.2");
    }
}
