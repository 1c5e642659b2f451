use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::from_fn, middleware::Logger, web, App, HttpServer};

use luxbyte_registration::clients::push::{DisabledPush, FcmClient, PushGateway};
use luxbyte_registration::clients::storage::StorageClient;
use luxbyte_registration::config::AppConfig;
use luxbyte_registration::database::Database;
use luxbyte_registration::error::set_verbose_errors;
use luxbyte_registration::handlers::{self, AppState};
use luxbyte_registration::rate_limit::{rate_limit, ClientRateLimiter};

fn startup_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    log::error!("{context}: {err}");
    std::io::Error::new(std::io::ErrorKind::Other, format!("{context}: {err}"))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
    })?;
    set_verbose_errors(!config.is_production());

    let db = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|err| startup_error("Failed to initialize database", err))?;
    log::info!("Database connected and migrations applied");

    let timeout = config.limits.external_call_timeout;
    let storage = StorageClient::new(
        &config.storage.url,
        config.storage.service_key.clone(),
        timeout,
    )
    .map_err(|err| startup_error("Failed to build storage client", err))?;

    let push: Arc<dyn PushGateway> = match config.fcm.clone() {
        Some(fcm) => match FcmClient::new(fcm, timeout) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                log::warn!("FCM disabled: {err}");
                Arc::new(DisabledPush)
            }
        },
        None => {
            log::warn!("FCM_PROJECT_ID / FCM_CREDENTIALS not set, push delivery disabled");
            Arc::new(DisabledPush)
        }
    };

    let state = web::Data::new(AppState::new(
        Arc::new(db),
        Arc::new(storage),
        push,
        config.security.clone(),
        &config.limits,
    ));
    let json_limit = handlers::json_limit(&state);

    let limiter = web::Data::new(ClientRateLimiter::new(config.security.rate_limit_per_minute));
    {
        let limiter = limiter.clone();
        actix_rt::spawn(async move {
            let mut interval = actix_rt::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.prune();
            }
        });
    }

    let allowed_origins = config.security.allowed_origins.clone();
    let bind_address = config.bind_address();
    log::info!("🚀 Starting LUXBYTE Registration Service on {}", bind_address);

    HttpServer::new(move || {
        let cors = if allowed_origins.is_empty() {
            Cors::default().allow_any_origin()
        } else {
            allowed_origins
                .iter()
                .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        }
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);

        App::new()
            .app_data(state.clone())
            .app_data(limiter.clone())
            .wrap(from_fn(rate_limit))
            .wrap(cors)
            .wrap(Logger::default())
            .configure(|cfg| handlers::configure(cfg, json_limit))
            .default_service(web::to(handlers::route_not_found))
    })
    .bind(&bind_address)?
    .run()
    .await
}
