mod api;
mod app;
mod auth;
mod config;
mod db;
mod encode;
mod error;
mod geometry;
mod lifecycle;
mod model;
mod plottable;
mod schema;
mod store;
mod string;
#[cfg(test)]
mod test;
mod time;
mod validate;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let config = match config::Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration is invalid. Details:\n{err}");
            return;
        }
    };
    app::enable_tracing(&config);

    let state = app::AppState::new(db::create_connection_pool(), config);
    if let Err(err) = app::initialize(&state) {
        tracing::error!("Failed to initialize server. Details:\n{err}");
        return;
    }
    if let Err(err) = app::run(state).await {
        tracing::error!("Server stopped with an error. Details:\n{err}");
    }
}
