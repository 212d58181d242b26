use speakspace::{
    config::{self, Config},
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init(&config::log_filter());

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid configuration: {err:#}");
            std::process::exit(2);
        }
    };

    if let Err(err) = speakspace::run(config).await {
        tracing::error!("speakspace stopped with an error: {err:#}");
        std::process::exit(1);
    }
}
