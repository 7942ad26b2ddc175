//! CLI command definitions and handlers.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use skiff_network::portmap::DEFAULT_POLL_INTERVAL;
use skiff_network::{MessageQueue, NetworkContext, PortProxy, Subnet};

use crate::cgroup::ResourceConfig;
use crate::exec::run_init;
use crate::runtime::{NetworkMode, RunOptions, Runtime, RuntimeConfig};

/// Skiff - minimal Linux container runtime
#[derive(Debug, Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for skiff data
    #[arg(
        long,
        global = true,
        env = "SKIFF_ROOT",
        default_value = "/var/run/skiff"
    )]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create and start a container
    Run(RunArgs),

    /// Container init (internal)
    #[command(hide = true)]
    Init,

    /// List containers
    Ps,

    /// Print a container's log
    Logs {
        /// Container name or ID prefix
        container: String,

        /// Keep printing new output while the container runs
        #[arg(short, long)]
        follow: bool,
    },

    /// Run a command inside a running container
    Exec {
        /// Container name or ID prefix
        container: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a running container
    Stop {
        /// Container name or ID prefix
        container: String,
    },

    /// Remove a stopped container
    Rm {
        /// Container name or ID prefix
        container: String,
    },

    /// List images
    Images,

    /// Manage images
    #[command(subcommand)]
    Image(ImageCommands),

    /// Manage networks
    #[command(subcommand)]
    Network(NetworkCommands),

    /// Run the port forwarding daemon
    Proxy,
}

/// Options of `skiff run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Attach the terminal and wait for the container
    #[arg(short = 't', long = "tty", conflicts_with = "detach")]
    pub tty: bool,

    /// Run in the background
    #[arg(short, long)]
    pub detach: bool,

    /// Memory limit, e.g. 100m
    #[arg(short = 'm', long = "memory")]
    pub memory: Option<String>,

    /// CPU shares
    #[arg(long = "cpu-share")]
    pub cpu_share: Option<String>,

    /// CPUs to run on, e.g. 0-1
    #[arg(long)]
    pub cpuset: Option<String>,

    /// Bind mount host:container
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Container name
    #[arg(long)]
    pub name: Option<String>,

    /// Environment variable KEY=VALUE
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Image name[:version] or ID prefix
    #[arg(long)]
    pub image: String,

    /// Network: a network name, `host`, or `container:<name>`
    #[arg(long = "net")]
    pub network: Option<String>,

    /// Publish hostPort:containerPort
    #[arg(short, long = "publish")]
    pub ports: Vec<String>,

    /// Command and arguments
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    fn into_options(self) -> Result<RunOptions> {
        let network = self
            .network
            .as_deref()
            .map(str::parse::<NetworkMode>)
            .transpose()?;

        Ok(RunOptions {
            tty: self.tty,
            resources: ResourceConfig {
                memory_limit: self.memory,
                cpu_share: self.cpu_share,
                cpuset: self.cpuset,
            },
            volumes: self.volumes,
            name: self.name,
            env: self.env,
            image: self.image,
            network,
            ports: self.ports,
            command: self.command,
        })
    }
}

/// `skiff image …`.
#[derive(Debug, Subcommand)]
pub enum ImageCommands {
    /// Install the base image from a root filesystem tarball
    Import {
        /// Path to a .tar or .tar.gz
        tarball: PathBuf,
    },
}

/// `skiff network …`.
#[derive(Debug, Subcommand)]
pub enum NetworkCommands {
    /// Create a network
    Create {
        /// Network driver
        #[arg(long, default_value = "bridge")]
        driver: String,

        /// Address block, e.g. 192.168.10.0/24
        #[arg(long)]
        subnet: String,

        /// Network name
        name: String,
    },

    /// List networks
    Ls,

    /// Remove a network
    Rm {
        /// Network name
        name: String,
    },
}

impl Cli {
    /// Runtime configuration for this invocation.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig::default().with_root(self.root.clone())
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed operation.
    pub fn execute(self) -> Result<ExitCode> {
        let config = self.config();

        match self.command {
            Commands::Init => {
                let err = run_init(&config.paths).map_or_else(|e| e, |never| match never {});
                Err(err).wrap_err("container init failed")
            }

            Commands::Run(args) => {
                config.paths.create_dirs()?;
                let outcome = Runtime::new(config).run(args.into_options()?)?;
                match outcome.exit_code {
                    Some(code) => Ok(exit_code(code)),
                    None => {
                        println!("{}", outcome.id);
                        Ok(ExitCode::SUCCESS)
                    }
                }
            }

            Commands::Ps => {
                let containers = Runtime::new(config).ps()?;
                let mut out = std::io::stdout().lock();
                writeln!(out, "ID\tNAME\tPID\tSTATUS\tCOMMAND\tCREATED")?;
                for info in containers {
                    let pid = info.pid.map(|p| p.to_string()).unwrap_or_default();
                    writeln!(
                        out,
                        "{}\t{}\t{}\t{}\t{}\t{}",
                        info.id, info.name, pid, info.status, info.command, info.create_time
                    )?;
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Logs { container, follow } => {
                let mut out = std::io::stdout().lock();
                Runtime::new(config).logs(&container, follow, &mut out)?;
                Ok(ExitCode::SUCCESS)
            }

            Commands::Exec { container, command } => {
                let code = Runtime::new(config).exec(&container, &command)?;
                Ok(exit_code(code))
            }

            Commands::Stop { container } => {
                let info = Runtime::new(config).stop(&container)?;
                println!("{}", info.id);
                Ok(ExitCode::SUCCESS)
            }

            Commands::Rm { container } => {
                Runtime::new(config).remove(&container)?;
                println!("{container}");
                Ok(ExitCode::SUCCESS)
            }

            Commands::Images => {
                let images = Runtime::new(config).images().list()?;
                let mut out = std::io::stdout().lock();
                writeln!(out, "ID\tNAME\tVERSION\tCREATED")?;
                for image in images {
                    writeln!(
                        out,
                        "{}\t{}\t{}\t{}",
                        image.id, image.name, image.version, image.create_time
                    )?;
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Image(ImageCommands::Import { tarball }) => {
                config.paths.create_dirs()?;
                let image = Runtime::new(config).images().import_base(&tarball)?;
                println!("{}", image.id);
                Ok(ExitCode::SUCCESS)
            }

            Commands::Network(command) => {
                let mut context = NetworkContext::load(&config.paths)?;
                match command {
                    NetworkCommands::Create {
                        driver,
                        subnet,
                        name,
                    } => {
                        let subnet: Subnet = subnet.parse()?;
                        let network = context.create_network(&driver, subnet, &name)?;
                        println!("{}", network.name);
                    }
                    NetworkCommands::Ls => {
                        let mut out = std::io::stdout().lock();
                        writeln!(out, "NAME\tIP RANGE\tGATEWAY\tDRIVER")?;
                        for network in context.networks() {
                            writeln!(
                                out,
                                "{}\t{}\t{}\t{}",
                                network.name, network.ip_range, network.gateway, network.driver
                            )?;
                        }
                    }
                    NetworkCommands::Rm { name } => {
                        context.delete_network(&name)?;
                        println!("{name}");
                    }
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Proxy => {
                run_proxy(&config)?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// Serve port mappings from the message queue until interrupted.
fn run_proxy(config: &RuntimeConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to start async runtime")?;

    runtime.block_on(async {
        let queue = MessageQueue::open()?;
        let proxy = PortProxy::with_bind_host(config.proxy_bind_host.clone());
        tracing::info!(bind_host = %config.proxy_bind_host, "Port proxy running");

        tokio::select! {
            served = proxy.serve(&queue, DEFAULT_POLL_INTERVAL) => served?,
            _ = tokio::signal::ctrl_c() => tracing::info!("Port proxy shutting down"),
        }
        Ok(())
    })
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
