// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use clap::Parser;
use railflow::{CycleOutcome, EngineArgs, EngineConfig, OptimizationEngine};
use tracing::{info, warn};

mod server;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Poll and optimize continuously, exposing state over HTTP
    Serve {
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,
        #[arg(short, long, default_value_t = 8090)]
        port: u16,
    },
    /// Run a single optimization cycle and print the schedule
    Once,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = EngineConfig::from(args.engine);
    info!("Using train data API at {}", config.base_url);

    match args.cmd {
        Command::Serve { address, port } => {
            let engine = web::Data::new(OptimizationEngine::from_config(config)?);

            if engine.auto_start() {
                info!("Auto-start enabled, polling started");
            }

            info!("Starting juniper on {}:{}", address, port);

            let app_engine = engine.clone();
            HttpServer::new(move || {
                let cors = Cors::permissive();
                App::new()
                    .wrap(cors)
                    .app_data(app_engine.clone())
                    .route("/", web::get().to(index))
                    .configure(server::config)
            })
            .bind((address, port))?
            .run()
            .await?;

            engine.stop();
            Ok(())
        }
        Command::Once => {
            let engine = OptimizationEngine::from_config(config)?;

            match engine.refresh().await {
                CycleOutcome::Completed(schedule) => {
                    println!("{}", serde_json::to_string_pretty(&schedule)?);
                    Ok(())
                }
                other => {
                    warn!("Cycle did not complete: {:?}", other);
                    Err(anyhow::anyhow!("optimization cycle did not complete: {:?}", other))
                }
            }
        }
    }
}

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Juniper Train Optimization Engine")
}
