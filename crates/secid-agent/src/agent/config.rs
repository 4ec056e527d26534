use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use secid::{
    AllocatorConfig, IDENTITIES_PATH, Labels, MAX_ALLOCATION_IDENTITY, MAX_CLUSTER_ID,
    MIN_ALLOCATION_IDENTITY,
};

/// Runtime configuration for the `secid-agent` binary.
///
/// Every flag can also be set through the environment variable named next to
/// it, including from a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "secid-agent",
    version,
    about = "Allocates security identities for the configured label sets"
)]
pub struct CliArgs {
    /// Name of this node. Used as the suffix of every hold the node places on
    /// a shared identity.
    ///
    /// Environment variable: `NODE_NAME`
    #[arg(long, env = "NODE_NAME", default_value_t = String::from("node-1"))]
    pub node_name: String,

    /// Name of the cluster this node belongs to. Part of the well-known
    /// identities' labels.
    ///
    /// Environment variable: `CLUSTER_NAME`
    #[arg(long, env = "CLUSTER_NAME", default_value_t = String::from("default"))]
    pub cluster_name: String,

    /// Numeric cluster ID, encoded into the upper bits of every global
    /// identity.
    ///
    /// Environment variable: `CLUSTER_ID`
    #[arg(long, env = "CLUSTER_ID", default_value_t = 0)]
    pub cluster_id: u32,

    /// Smallest global identity handed out in this cluster.
    ///
    /// Environment variable: `MIN_IDENTITY`
    #[arg(long, env = "MIN_IDENTITY", default_value_t = MIN_ALLOCATION_IDENTITY)]
    pub min_identity: u32,

    /// Largest global identity handed out in this cluster.
    ///
    /// Environment variable: `MAX_IDENTITY`
    #[arg(long, env = "MAX_IDENTITY", default_value_t = MAX_ALLOCATION_IDENTITY)]
    pub max_identity: u32,

    /// Seconds between two keep-alive re-assertions of a held identity.
    ///
    /// Environment variable: `KEEP_ALIVE_SECS`
    #[arg(long, env = "KEEP_ALIVE_SECS", default_value_t = 300)]
    pub keep_alive_secs: u64,

    /// Seconds between garbage collection runs over unused identities. `0`
    /// disables collection.
    ///
    /// Environment variable: `GC_INTERVAL_SECS`
    #[arg(long, env = "GC_INTERVAL_SECS", default_value_t = 60)]
    pub gc_interval_secs: u64,

    /// Capacity of the identity event channel.
    ///
    /// Environment variable: `EVENT_BUFFER`
    #[arg(long, env = "EVENT_BUFFER", default_value_t = 1024)]
    pub event_buffer: usize,

    /// Label sets to allocate identities for, e.g.
    /// `k8s:app=frontend,k8s:env=prod`. Separate multiple sets with spaces
    /// or repeat the flag.
    ///
    /// Environment variable: `IDENTITY_LABELS`
    #[arg(long = "labels", env = "IDENTITY_LABELS", value_delimiter = ' ', num_args = 0..)]
    pub label_sets: Vec<String>,

    /// Do not recreate master keys that disappeared while still held.
    #[arg(long, default_value_t = false)]
    pub no_master_key_protection: bool,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub allocator: AllocatorConfig,
    pub label_sets: Vec<Labels>,
    pub gc_interval: Option<Duration>,
}

impl TryFrom<CliArgs> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.node_name.trim().is_empty() {
            bail!("NODE_NAME must not be empty");
        }
        if args.cluster_id > MAX_CLUSTER_ID {
            bail!(
                "CLUSTER_ID ({}) exceeds the maximum cluster ID ({})",
                args.cluster_id,
                MAX_CLUSTER_ID
            );
        }
        if args.keep_alive_secs == 0 {
            bail!("KEEP_ALIVE_SECS must be greater than 0");
        }

        let allocator = AllocatorConfig {
            min_id: args.min_identity,
            max_id: args.max_identity,
            cluster_id: args.cluster_id,
            cluster_name: args.cluster_name,
            keep_alive_interval: Duration::from_secs(args.keep_alive_secs),
            event_buffer: args.event_buffer,
            master_key_protection: !args.no_master_key_protection,
            base_path: IDENTITIES_PATH.to_string(),
            ..AllocatorConfig::default()
        };
        allocator.validate()?;

        let label_sets = args
            .label_sets
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| {
                raw.parse::<Labels>()
                    .with_context(|| format!("invalid label set `{raw}`"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let gc_interval = match args.gc_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            node_name: args.node_name,
            allocator,
            label_sets,
            gc_interval,
        })
    }
}
