use log::{error, info};
use shellgate::configuration::config::{CliArgs, Config};
use shellgate::controller::controller_handler::Controller;

#[tokio::main]
async fn main() {
    // https://docs.rs/env_logger/latest/env_logger/
    logger_builder().init();

    println!(
        "
==============================================================================
          shellgate v{} - remote session and transfer proxy
==============================================================================
",
        env!("CARGO_PKG_VERSION")
    );

    info!("Importing configuration");

    let args = CliArgs::from_args();

    let config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Unable to import configuration from {}: {}",
                args.config_file.display(),
                e
            );
            std::process::exit(1);
        }
    };

    info!("Configuration imported successfully");

    let controller = match Controller::new(config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run().await {
        error!("Controller stopped with an error: {}", e);
        std::process::exit(1);
    }
    info!("Bye");
}

/// `info` unless `RUST_LOG` says otherwise.
fn logger_builder() -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_target(false);
    builder
}
