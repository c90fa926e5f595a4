use icmon::Config;
use icmon::app;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cfg = Config::from_env()?;
    app::run(cfg).await
}
