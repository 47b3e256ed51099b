pub use controller::*;
use common::OperatorConfig;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware,
    web::Data,
};

#[get("/metrics")]
async fn metrics(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::from_env()?;

    // Setup tracing layers
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (json, plain) = if config.json_logs {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };
    let collector = Registry::default().with(env_filter).with(json).with(plain);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector).map_err(|e| Error::Config(e.to_string()))?;

    // Start kubernetes controller
    let bind = config.bind_address.clone();
    let (manager, controller) = Manager::new(config).await?;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&bind)
    .map_err(|e| Error::Config(format!("Can not bind to {bind}: {e}")))?
    .shutdown_timeout(5);

    tokio::select! {
        _ = controller => tracing::warn!("NodeFeatureDiscovery controller exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
    Ok(())
}
