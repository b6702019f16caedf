//! rootdeploy command line interface

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rootdeploy::device::{add_update_source, deploy_update, pull_update};
use rootdeploy::ops::{commit, CommitOptions};
use rootdeploy::remotes::list_remotes;
use rootdeploy::sysroot::repo_path;
use rootdeploy::resolve::read_commit_metadata;
use rootdeploy::types::VERSION_KEY;
use rootdeploy::{
    deploy_image, list_refs, resolve_rev, Config, DeployOutcome, DeployRequest, Repo, Sysroot,
};

#[derive(Parser)]
#[command(name = "rootdeploy")]
#[command(about = "deploy rootfs commits as installer images or onto live devices")]
#[command(version)]
struct Cli {
    /// configuration file (toml)
    #[arg(short, long, global = true, env = "ROOTDEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// deploy a commit to an installer image or a device
    Deploy {
        /// ref or checksum to deploy (default from config, `base`)
        reference: Option<String>,

        /// directory holding tezi/, sysroot/ and ostree-archive/
        #[arg(long, default_value = "/storage")]
        storage_directory: PathBuf,

        /// write an installer image here (must not exist)
        #[arg(long, conflicts_with = "remote_host")]
        output_directory: Option<PathBuf>,

        /// push to this device instead
        #[arg(long)]
        remote_host: Option<String>,

        #[arg(long)]
        remote_username: Option<String>,

        #[arg(long, env = "ROOTDEPLOY_REMOTE_PASSWORD", hide_env_values = true)]
        remote_password: Option<String>,

        /// local address to reach the device from
        #[arg(long)]
        mdns_source: Option<String>,

        /// reboot the device once the deployment is staged
        #[arg(long)]
        reboot: bool,

        /// scratch sysroot for image builds (must exist)
        #[arg(long, default_value = "/deploy")]
        deploy_sysroot_directory: PathBuf,
    },

    /// initialize a new store
    Init {
        path: PathBuf,
    },

    /// commit a directory to a ref
    Commit {
        /// store to commit into
        #[arg(long)]
        store: PathBuf,

        /// source directory to commit
        source: PathBuf,

        /// ref name to commit to
        #[arg(short = 'r', long)]
        ref_name: String,

        /// commit message
        #[arg(short, long)]
        message: Option<String>,

        /// version recorded in the commit metadata
        #[arg(long)]
        version: Option<String>,
    },

    /// list refs
    Refs {
        #[arg(long)]
        store: PathBuf,
    },

    /// print the checksum a rev names
    RevParse {
        #[arg(long)]
        store: PathBuf,

        rev: String,
    },

    /// manage update sources of a sysroot (device side)
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },

    /// fetch a commit from an update source into the sysroot store (device side)
    Pull {
        #[arg(long, default_value = "/")]
        sysroot: PathBuf,

        remote: String,

        /// ref or checksum on the update source
        rev: String,
    },

    /// sysroot administration (device side)
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// show the deployments of a sysroot
    Status {
        #[arg(long)]
        sysroot: PathBuf,

        /// os name (default from config)
        #[arg(long)]
        os: Option<String>,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// register an update source
    Add {
        #[arg(long, default_value = "/")]
        sysroot: PathBuf,

        /// replace an existing source of the same name
        #[arg(long)]
        force: bool,

        name: String,

        url: String,
    },

    /// list update sources
    List {
        #[arg(long, default_value = "/")]
        sysroot: PathBuf,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// deploy a pulled commit as the default for the next boot
    Deploy {
        #[arg(long, default_value = "/")]
        sysroot: PathBuf,

        /// os name (default from config)
        #[arg(long)]
        os: Option<String>,

        /// refspec recorded in the deployment origin
        #[arg(long)]
        origin: Option<String>,

        rev: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> rootdeploy::Result<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Deploy {
            reference,
            storage_directory,
            output_directory,
            remote_host,
            remote_username,
            remote_password,
            mdns_source,
            reboot,
            deploy_sysroot_directory,
        } => {
            let request = DeployRequest {
                reference,
                storage_dir: storage_directory,
                output_dir: output_directory,
                remote_host,
                remote_username,
                remote_password,
                mdns_source,
                reboot,
                deploy_sysroot_dir: deploy_sysroot_directory,
            };
            match deploy_image(&request, &config)? {
                DeployOutcome::Image { checksum, archive } => {
                    println!("{} {}", checksum, archive.display());
                }
                DeployOutcome::Remote { checksum, state } => {
                    println!("{} {}", checksum, state);
                }
            }
        }

        Commands::Init { path } => {
            Repo::init(&path)?;
            println!("initialized store at {}", path.display());
        }

        Commands::Commit {
            store,
            source,
            ref_name,
            message,
            version,
        } => {
            let repo = Repo::open(&store)?;
            let mut opts = CommitOptions {
                message: message.unwrap_or_default(),
                ..Default::default()
            };
            if let Some(version) = version {
                opts.metadata.insert(VERSION_KEY.to_string(), version);
            }
            let hash = commit(&repo, &source, &ref_name, &opts)?;
            println!("{}", hash);
        }

        Commands::Refs { store } => {
            let repo = Repo::open(&store)?;
            for (name, hash) in list_refs(&repo)? {
                println!("{} {}", hash, name);
            }
        }

        Commands::RevParse { store, rev } => {
            let repo = Repo::open(&store)?;
            println!("{}", resolve_rev(&repo, &rev)?);
        }

        Commands::Remote { command } => match command {
            RemoteCommands::Add {
                sysroot,
                force,
                name,
                url,
            } => add_update_source(&sysroot, &name, &url, force)?,
            RemoteCommands::List { sysroot } => {
                let repo = Repo::open(&repo_path(&sysroot))?;
                for (name, url) in list_remotes(&repo)? {
                    println!("{} {}", name, url);
                }
            }
        },

        Commands::Pull {
            sysroot,
            remote,
            rev,
        } => {
            let checksum = pull_update(&sysroot, &remote, &rev)?;
            println!("{}", checksum);
        }

        Commands::Admin { command } => match command {
            AdminCommands::Deploy {
                sysroot,
                os,
                origin,
                rev,
            } => {
                let osname = os.unwrap_or_else(|| config.osname.clone());
                let deployment = deploy_update(&sysroot, &osname, &rev, origin.as_deref())?;
                println!("{}", deployment.boot_path());
            }
        },

        Commands::Status { sysroot, os } => {
            let osname = os.unwrap_or_else(|| config.osname.clone());
            let sysroot = Sysroot::load(&sysroot, &osname)?;
            if sysroot.deployments().is_empty() {
                println!("no deployments");
            }
            for (index, deployment) in sysroot.deployments().iter().enumerate() {
                let marker = if index == 0 { '*' } else { ' ' };
                println!("{} {} {}", marker, osname, deployment.dir_name());
                if let Ok(meta) = read_commit_metadata(sysroot.repo(), &deployment.checksum) {
                    if let Some(version) = meta.version {
                        println!("    Version: {}", version);
                    }
                }
                if let Some(refspec) = &deployment.origin_refspec {
                    println!("    origin refspec: {}", refspec);
                }
                println!("    options: {}", deployment.boot_arguments);
            }
        }
    }

    Ok(())
}
