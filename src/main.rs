use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use blipserve::config::{self, Config};
use blipserve::server::{routes, ApiError};
use blipserve::vision::ModelState;
use std::process;
use tracing::{error, info};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    info!(
        "starting {} (model {}, port {})",
        config::SERVICE_NAME,
        cfg.model,
        cfg.port
    );

    // The model must be ready before the port is bound; on load failure the
    // process exits without ever serving.
    let state = web::Data::new(ModelState::new());
    if let Err(err) = state.load(&cfg.model) {
        error!("refusing to start: {err}");
        process::exit(1);
    }

    info!("serving at http://0.0.0.0:{}", cfg.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().error_handler(|err, _| {
                ApiError::Payload(err.to_string()).into()
            }))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .service(routes::health)
            .service(routes::models)
            .service(routes::caption)
            .service(routes::analyze)
    })
    .bind(("0.0.0.0", cfg.port))?
    .run()
    .await?;

    Ok(())
}
