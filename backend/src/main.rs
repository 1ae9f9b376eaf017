use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dr_backend::config::ServiceConfig;
use dr_backend::model::ModelLoader;
use dr_backend::pipeline::Grader;
use dr_backend::routes::{configure_routes, AppState};
use dr_backend::vision::Preprocessor;
use std::env;
use std::io;

fn startup_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    log::error!("{}: {}", context, err);
    io::Error::other(format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = ServiceConfig::load().map_err(|e| startup_error("Invalid configuration", e))?;
    let preprocessor = Preprocessor::from_config(&config.preprocessing)
        .map_err(|e| startup_error("Invalid preprocessing configuration", e))?;

    let loader = ModelLoader::from_config(&config.model)
        .map_err(|e| startup_error("Invalid model configuration", e))?;
    let grader = match loader.acquire() {
        Ok(handle) => Some(Grader::new(preprocessor.clone(), handle)),
        Err(e) if config.server.allow_degraded_start => {
            log::warn!("Starting without a model, predictions will return 503: {}", e);
            None
        }
        Err(e) => return Err(startup_error("Model loading failed", e)),
    };

    let state = web::Data::new(AppState::new(preprocessor, grader));
    let origins = config.server.allowed_origins.clone();
    let bind_address = (config.server.host.clone(), config.server.port);

    log::info!(
        "Starting server on {}:{} with {} workers",
        bind_address.0,
        bind_address.1,
        config.server.workers
    );

    HttpServer::new(move || {
        let cors = origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![
                actix_web::http::header::ACCEPT,
                actix_web::http::header::CONTENT_TYPE,
            ])
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .workers(config.server.workers)
    .bind(bind_address)?
    .run()
    .await
}
