//! ibex agent daemon: reports local task state to the job servers and runs what they assign.
use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use ibex_core::{Executor, Heartbeat, LocalTasks, MetaDir};
use ibex_exec::LoginUser;
use ibex_observe::init_logger;
use ibex_rpc::{JobServer, RpcClient};
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info};

mod config;
mod http;
mod shutdown;

use config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "ibex-agentd")]
#[command(version)]
#[command(about = "Runs scripts assigned by the ibex job servers")]
struct Args {
    /// Configuration file (.toml, .conf, .yaml, .yml or .json)
    #[arg(value_name = "CONFIG", default_value = "etc/ibex/agentd.toml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (cfg, runtime) = match startup(&args) {
        Ok(ready) => ready,
        Err(e) => {
            eprintln!("ibex-agentd: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "ibex.agentd", error = %format!("{e:#}"), "agent failed");
            ExitCode::FAILURE
        }
    }
}

/// Load the configuration and install the logger, then build the runtime and validate.
fn startup(args: &Args) -> anyhow::Result<(AgentConfig, Runtime)> {
    let mut cfg = AgentConfig::load(&args.config)?;
    // Installed while the process is still single-threaded so the local UTC offset is readable.
    init_logger(&cfg.logger_config()?).context("init logger")?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(cfg.validate())?;

    info!(
        target: "ibex.agentd",
        config = %args.config.display(),
        run_mode = %cfg.run_mode,
        meta_dir = %cfg.meta_dir.display(),
        servers = ?cfg.heartbeat.servers,
        "configuration loaded"
    );
    Ok((cfg, runtime))
}

async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    let cancel = shutdown::install_shutdown_handler().context("install signal handlers")?;

    let rpc = Arc::new(RpcClient::new(cfg.heartbeat.servers.clone(), cfg.client_options()));
    let client: Arc<dyn JobServer> = rpc.clone();
    let login = LoginUser::current().context("resolve login user")?;
    info!(target: "ibex.agentd", user = %login.name, root = login.is_root(), "running as");

    let executor = Executor::new(MetaDir::new(&cfg.meta_dir), Arc::clone(&client), login);
    let tasks = Arc::new(LocalTasks::new(Arc::new(executor)));
    tasks.rehydrate().await.context("scan meta dir")?;

    let heartbeat = Heartbeat::new(cfg.interval(), cfg.host_ident(), client, Arc::clone(&tasks));
    let beat = {
        let cancel = cancel.clone();
        tokio::spawn(async move { heartbeat.run(cancel).await })
    };

    if cfg.http.enable {
        let addr = cfg.http_listen()?;
        if let Err(e) = http::serve(addr, Arc::clone(&tasks), cancel.clone()).await {
            // The agent keeps working without its admin endpoints.
            error!(target: "ibex.agentd", %addr, error = %e, "http server failed");
        }
    }

    cancel.cancelled().await;
    beat.await.context("heartbeat task")?;
    rpc.close().await;
    info!(target: "ibex.agentd", tasks = tasks.len(), "agent stopped");
    Ok(())
}
