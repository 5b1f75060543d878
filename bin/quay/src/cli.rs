use alloy_core::primitives::B256;
use clap::{Args, Parser, Subcommand};
use quay_deploy::{DeploymentOptions, QUAY_CONFIG_FILENAME};
use tracing::level_filters::LevelFilter;

/// The contract deployed when none is given.
pub const DEFAULT_CONTRACT: &str = "HermesProxyFactory";
/// The network targeted when none is given.
pub const DEFAULT_NETWORK: &str = "opSepolia";
/// Gas limit applied when none is given.
pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;

/// Owner set on every role of the default factory deployment.
const DEFAULT_OWNER: &str = "0xd44390C5f4e3558Be11BbDEb9c3193b6f4DFf8c4";
const DEFAULT_FACTORY_VALUE: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000001";

#[derive(Parser)]
#[command(name = "quay")]
#[command(author, version, about = "Deploy and verify EVM contracts, exactly once")]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "QUAY_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or a directory containing a Quay.toml.
    #[arg(long, alias = "conf", global = true, env = "QUAY_CONFIG", default_value = QUAY_CONFIG_FILENAME)]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy a contract (once) and verify its source on the network's explorer.
    Deploy(DeployArgs),

    /// Verify an already deployed contract.
    Verify(TargetArgs),

    /// List the deployments recorded for a network.
    Ledger {
        /// The network whose records to list.
        #[arg(short, long, env = "QUAY_NETWORK", default_value = DEFAULT_NETWORK)]
        network: String,
    },
}

/// Identifies a deployment intent.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Name of the compiled contract.
    #[arg(default_value = DEFAULT_CONTRACT)]
    pub contract: String,

    /// The network to deploy to, as named in the configuration.
    #[arg(short, long, env = "QUAY_NETWORK", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// A constructor argument. Repeat in declaration order.
    ///
    /// If none is given for the default contract, the owner address is used for all three roles
    /// followed by a value of one.
    #[arg(long = "arg", value_name = "VALUE")]
    pub args: Vec<String>,

    /// Deploy through the CREATE2 proxy with this 32-byte salt.
    #[arg(long)]
    pub salt: Option<String>,
}

impl TargetArgs {
    /// Constructor arguments, falling back to the default factory arguments.
    pub fn constructor_args(&self) -> Vec<String> {
        if self.args.is_empty() && self.contract == DEFAULT_CONTRACT {
            vec![
                DEFAULT_OWNER.to_string(),
                DEFAULT_OWNER.to_string(),
                DEFAULT_OWNER.to_string(),
                DEFAULT_FACTORY_VALUE.to_string(),
            ]
        } else {
            self.args.clone()
        }
    }

    pub fn salt(&self) -> anyhow::Result<Option<B256>> {
        self.salt
            .as_deref()
            .map(|salt| {
                salt.parse()
                    .map_err(|e| anyhow::anyhow!("Invalid salt '{salt}': {e}"))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Gas limit of the deployment transaction.
    #[arg(long, env = "QUAY_GAS_LIMIT", default_value_t = DEFAULT_GAS_LIMIT)]
    pub gas_limit: u64,

    /// Estimate the gas limit instead of using --gas-limit.
    #[arg(long, conflicts_with = "gas_limit")]
    pub estimate_gas: bool,

    /// Do not submit the source for verification.
    #[arg(long, env = "QUAY_SKIP_VERIFY")]
    pub skip_verify: bool,
}

impl DeployArgs {
    pub fn options(&self) -> anyhow::Result<DeploymentOptions> {
        Ok(DeploymentOptions {
            gas_limit: (!self.estimate_gas).then_some(self.gas_limit),
            salt: self.target.salt()?,
            skip_verify: self.skip_verify,
        })
    }
}
