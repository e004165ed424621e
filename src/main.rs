use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::info;
use rand::rngs::OsRng;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::path::PathBuf;

use storage_chain::api;
use storage_chain::blockchain::{self, Blockchain, SledStore};
use storage_chain::config::NodeConfig;
use storage_chain::node::Node;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::add_block,
        api::handlers::submit_transaction,
        api::handlers::get_block,
        api::handlers::get_last_hash,
        api::handlers::get_balance,
        api::handlers::get_size,
        api::handlers::abort_mining
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::Address,
            blockchain::DigitalSignature,
            api::handlers::ErrorResponse,
            api::handlers::TransactionResponse,
            api::handlers::BlockResponse,
            api::handlers::LastHashResponse,
            api::handlers::BalanceResponse,
            api::handlers::SizeResponse,
            api::handlers::AbortResponse
        )
    ),
    tags(
        (name = "storage-chain", description = "Ledger node endpoints")
    ),
    info(
        title = "Storage Chain API",
        version = "0.1.0",
        description = "A single-chain proof-of-work ledger node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

// Opens the block store, creating the genesis block for the miner on first start
fn initialize_node(config: &NodeConfig) -> anyhow::Result<Node<SledStore>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

    let miner = config.load_or_create_miner(&mut OsRng)?;
    let store = SledStore::open(&config.data_dir)
        .with_context(|| format!("Failed to open block store at {}", config.data_dir.display()))?;
    let chain = Blockchain::open(store, config.protocol.clone(), miner.address())?;
    info!(
        "Blockchain at {} holds {} blocks",
        config.data_dir.display(),
        chain.size()?
    );

    Ok(Node::new(chain, miner)?)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = NodeConfig::load(config_path.as_deref())?;

    let node = web::Data::new(initialize_node(&config)?);

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(node.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
