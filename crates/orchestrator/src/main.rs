use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};

use sr_domain::config::ObservabilityConfig;
use sr_orchestrator::cli::replay::ReplayArgs;
use sr_orchestrator::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Replay {
            script,
            result_id,
            invocation_version,
            uid,
            query,
            model,
            auto_name,
            json,
        }) => {
            let (config, _) = sr_orchestrator::cli::load_config()?;
            let tracer_provider = init_tracing(&config.observability);
            let args = ReplayArgs {
                script,
                result_id,
                version: invocation_version,
                uid,
                query,
                model,
                auto_name,
                json,
            };
            let outcome = sr_orchestrator::cli::replay::run(Arc::new(config), args).await;

            if let Some(provider) = tracer_provider {
                if let Err(e) = provider.shutdown() {
                    eprintln!("OpenTelemetry shutdown error: {e}");
                }
            }

            let exit_code = outcome?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Some(Command::Abort {
            result_id,
            version,
            message,
        }) => {
            init_cli_tracing();
            let (config, _) = sr_orchestrator::cli::load_config()?;
            sr_orchestrator::cli::abort::run(&config, result_id, version, message).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = sr_orchestrator::cli::load_config()?;
            let valid = sr_orchestrator::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = sr_orchestrator::cli::load_config()?;
            sr_orchestrator::cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("skillrun {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            eprintln!("no command given; see `skillrun --help`");
            std::process::exit(2);
        }
    }
}

/// Initialize JSON tracing on stderr, optionally exporting spans over OTLP.
///
/// Returns the tracer provider (if OTLP is configured) so the caller can
/// flush it before exit. Stdout stays reserved for invocation output.
fn init_tracing(obs: &ObservabilityConfig) -> Option<SdkTracerProvider> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sr_orchestrator=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr);

    let provider = obs
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| otlp_provider(obs, endpoint));
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("skillrun")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    provider
}

/// Batch-exporting provider for `endpoint`, or `None` (with a warning on
/// stderr) when the exporter cannot be built.
fn otlp_provider(obs: &ObservabilityConfig, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!("WARNING: OTLP exporter for {endpoint} unavailable ({e}); spans stay local");
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name.clone())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::TraceIdRatioBased(obs.sample_rate))
            .with_resource(resource)
            .build(),
    )
}

/// Compact stderr-only tracing for one-shot commands. Defaults to `warn`.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
