//! Runs the paraboloid through the driver, with or without an invalid region.
//!
//! Usage: `detour-demo [config.json]`. Without a config file the constrained
//! paraboloid is solved with SQP, starting from a diagonal Hessian whose first
//! step lands in the invalid region. Set `DETOUR_INVALID_REGION=0` to disable
//! the invalid region.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dt_driver::{DiagnosticsReport, Driver, Paraboloid, Region};
use dt_types::{BackendSelection, DriverConfig, SqpSettings};

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .ok();

    let config = match std::env::args().nth(1) {
        Some(path) => DriverConfig::from_path(&path)
            .with_context(|| format!("failed to load driver config from {path}"))?,
        None => Paraboloid::config("paraboloid").with_backend(BackendSelection::Sqp(
            SqpSettings::default().with_initial_hessian([3.5, 1.65]),
        )),
    };

    let mut model = Paraboloid::new();
    if std::env::var("DETOUR_INVALID_REGION").as_deref() != Ok("0") {
        let region = Region::new((7.2, 10.2), (-50.0, -40.0));
        info!(?region, "paraboloid has an invalid region");
        model = model.with_invalid_region(region);
    }

    let driver = Driver::new(config).context("invalid driver config")?;
    let result = driver.run(&mut model);

    println!("{}", serde_json::to_string_pretty(&result)?);
    print!("{}", DiagnosticsReport::from_records(&result.history));

    if let Some(error) = result.status.error() {
        anyhow::bail!("run {} failed: {error}", result.run_id);
    }
    Ok(())
}
