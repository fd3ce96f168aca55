#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

use std::{env, time::Duration};

use actix_cors::Cors;
use actix_web::{App, http, middleware, web};
use tokio::try_join;
use webtouch_hub::ws::server::{HubOptions, RelayServer};
use webtouch_hub::{CANCELLATION_TOKEN, api, ws};

fn default_env(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn default_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn option_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn main() -> Result<(), std::io::Error> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let service_port = {
        let args: Vec<String> = env::args().collect();

        if args.len() > 1 {
            args[1].parse::<u16>().expect("Invalid port argument")
        } else {
            u16::try_from(default_env_usize("PORT", 8000))
                .expect("Invalid PORT environment variable")
        }
    };

    let options = HubOptions {
        code_length: default_env_usize("ROOM_CODE_LENGTH", 4),
        alphabet: default_env("ROOM_CODE_ALPHABET", "ABCDEFGHIJKLMNOPQRSTUVWXYZ"),
        idle_room_ttl: option_env_u64("ROOM_IDLE_TTL_SECS").map(Duration::from_secs),
    };

    actix_web::rt::System::with_tokio_rt(|| {
        let threads = default_env_usize("MAX_THREADS", 64);
        log::debug!("Running with {threads} max blocking threads");
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .max_blocking_threads(threads)
            .build()
            .unwrap()
    })
    .block_on(async move {
        let (relay_server, hub) = RelayServer::new(options.clone());
        let relay_server = tokio::spawn(relay_server.run());

        // idle-room eviction stays out of the relay hot path: a timer just
        // nudges the hub through the normal command channel
        if let Some(ttl) = options.idle_room_ttl {
            let sweeper = hub.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
                loop {
                    tokio::select! {
                        _ = interval.tick() => sweeper.sweep_rooms(),
                        () = CANCELLATION_TOKEN.cancelled() => break,
                    }
                }
            });
        }

        let app_hub = hub.clone();
        let app = move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                .allowed_headers(vec![
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                    http::header::CONTENT_TYPE,
                ])
                .supports_credentials()
                .max_age(3600);

            App::new()
                .app_data(web::Data::new(app_hub.clone()))
                .wrap(cors)
                .wrap(middleware::Compress::default())
                .service(api::health_endpoint)
                .service(ws::api::websocket)
        };

        let mut http_server = actix_web::HttpServer::new(app);

        if let Some(workers) = option_env_u64("ACTIX_WORKERS") {
            log::debug!("Running with {workers} Actix workers");
            http_server = http_server.workers(usize::try_from(workers).unwrap_or(1));
        }

        let http_server = http_server
            .bind((default_env("BIND_ADDR", "0.0.0.0"), service_port))?
            .run();

        drop(hub);

        if let Err(err) = try_join!(
            async move {
                let resp = http_server.await;

                log::debug!("Shutting down relay server...");
                CANCELLATION_TOKEN.cancel();

                resp
            },
            async move {
                let resp = relay_server.await.expect("Relay server panicked");
                log::debug!("Relay server shut down");
                resp
            },
        ) {
            log::error!("Error on shutdown: {err:?}");
            return Err(err);
        }

        log::debug!("Server shut down");

        Ok(())
    })
}
