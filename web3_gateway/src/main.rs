#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{self, AtomicUsize};
#[cfg(feature = "deadlock_detection")]
use std::{thread, time::Duration};

use tokio::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

use web3_gateway::app::Web3Gateway;
use web3_gateway::config::{CliConfig, TopConfig};
use web3_gateway::frontend;

fn main() -> anyhow::Result<()> {
    // if RUST_LOG isn't set, configure a default
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,web3_gateway=debug");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();

    let cli_config: CliConfig = argh::from_env();

    info!("Loading config @ {}", cli_config.config);
    let top_config: String = fs::read_to_string(cli_config.config.clone())?;
    let top_config: TopConfig = toml::from_str(&top_config)?;

    let mut rt_builder = runtime::Builder::new_multi_thread();

    rt_builder.enable_all().thread_name_fn(move || {
        static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
        let worker_id = ATOMIC_ID.fetch_add(1, atomic::Ordering::SeqCst);
        format!("gateway-{}", worker_id)
    });

    if cli_config.workers > 0 {
        rt_builder.worker_threads(cli_config.workers);
    }

    let rt = rt_builder.build()?;

    // spawn a thread for deadlock detection
    #[cfg(feature = "deadlock_detection")]
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(10));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        eprintln!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            eprintln!("Deadlock #{}", i);
            for t in threads {
                eprintln!("Thread Id {:#?}", t.thread_id());
                eprintln!("{:#?}", t.backtrace());
            }
        }
    });

    rt.block_on(async move {
        let gateway = Web3Gateway::spawn(top_config).await?;

        let app = frontend::router(gateway);

        let addr = SocketAddr::from(([0, 0, 0, 0], cli_config.port));
        info!("listening on {}", addr);

        axum::Server::bind(&addr)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        Ok(())
    })
}
