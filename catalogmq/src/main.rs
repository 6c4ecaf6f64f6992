mod config;
mod model;
mod processing;
mod restapi;
mod supervisor;

use anyhow::Result;
use catalogmq_client::{provider_from_config, setup_logger, Consumer, Producer};
use catalogmq_codec::{Codec, JsonCodec};
use clap::Parser;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{error, info};
use model::{Category, Product};
use restapi::{Context, Endpoint};
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::net::TcpListener;
use tokio::signal;

async fn start_http(context: Context, url: &str) -> Result<()> {
    let listener = TcpListener::bind(url).await?;

    info!("Start HTTP API on {}", url);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting HTTP connection {:?}", e);

                    continue;
                }
            };

            let context = context.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| restapi::route(req, context.clone()));

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!("Error serving HTTP client {}: {:?}", peer, e);
                }
            });
        }
    });

    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_logger();

    let cli = config::Cli::parse();
    let config = config::parse_config(&cli.config_file_path)?;

    let provider = provider_from_config(&config.broker)?;

    let product_codec: Arc<dyn Codec<Product>> = Arc::new(JsonCodec::pretty());
    let category_codec: Arc<dyn Codec<Category>> = Arc::new(JsonCodec::pretty());

    let mut supervisor = Supervisor::default();

    supervisor.add(
        Arc::new(Consumer::new(
            Arc::clone(&provider),
            Arc::clone(&product_codec),
            processing::product_processor(),
            config.queues.product.clone(),
        )),
        config.queues.product.restart,
    );
    supervisor.add(
        Arc::new(Consumer::new(
            Arc::clone(&provider),
            Arc::clone(&category_codec),
            processing::category_processor(),
            config.queues.category.clone(),
        )),
        config.queues.category.restart,
    );

    let supervisor = Arc::new(supervisor);

    let context = Context {
        products: Endpoint {
            producer: Arc::new(Producer::new(
                Arc::clone(&provider),
                Arc::clone(&product_codec),
                &config.queues.product.name,
            )),
            codec: product_codec,
        },
        categories: Endpoint {
            producer: Arc::new(Producer::new(
                Arc::clone(&provider),
                Arc::clone(&category_codec),
                &config.queues.category.name,
            )),
            codec: category_codec,
        },
        supervisor: Arc::clone(&supervisor),
    };

    supervisor.start_all();

    start_http(context, &config.network.http_listen).await?;

    tokio::select! {
        _ = supervisor.run(config.supervisor.interval()) => (),
        result = signal::ctrl_c() => result?,
    }

    info!("Shutting down");

    supervisor.close_all().await;

    Ok(())
}
