//! Painter - headless host for the layered mesh-paint engine
//!
//! Loads the plugin module, runs the tick loop against the software device
//! and writes export protocol events to stdout as JSON lines.

use std::process::ExitCode;

use painting::{CpuDevice, DylibPluginSource, MeshGeometry, PaintEngine, PaintResult};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("painter=info,painting=info")),
        )
        .init();

    let config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting painter: tier {:?}, {}x{}, {:?}",
        config.tier, config.width, config.height, config.output_mode
    );

    let device = CpuDevice::new(config.memory_budget());
    let mut engine = match PaintEngine::new(config, device) {
        Ok(engine) => engine,
        Err(err) => {
            error!("Engine startup failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = run(&mut engine);
    let shutdown = engine.shutdown();
    flush_events(&mut engine);

    match outcome(result, shutdown) {
        Ok(frames) => {
            info!("Exited cleanly after {} frames", frames);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(engine: &mut PaintEngine<CpuDevice>) -> PaintResult<u64> {
    engine.set_mesh(MeshGeometry::plane(1.0))?;
    let source = DylibPluginSource::from_config(engine.config());
    engine.load_plugin(&source)?;
    engine.init()?;

    if let Some(descriptor) = engine.export_descriptor() {
        match serde_json::to_string_pretty(descriptor) {
            Ok(json) => info!("Export descriptor:\n{}", json),
            Err(err) => error!("Could not encode export descriptor: {}", err),
        }
    }
    flush_events(engine);

    engine.run_with(|engine, report| {
        debug!("Frame {} done", report.frame);
        flush_events(engine);
    })
}

/// Frames rendered, or the first error of the run and the shutdown
fn outcome(run: PaintResult<u64>, shutdown: PaintResult<()>) -> PaintResult<u64> {
    run.and_then(|frames| shutdown.map(|()| frames))
}

/// Write pending export events to stdout, one JSON object per line
fn flush_events(engine: &mut PaintEngine<CpuDevice>) {
    for event in engine.take_export_events() {
        match event.to_line() {
            Ok(line) => println!("{line}"),
            Err(err) => error!("Could not encode export event: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use painting::PaintError;

    #[test]
    fn test_outcome_keeps_frame_count() {
        assert_eq!(outcome(Ok(12), Ok(())).unwrap(), 12);
    }

    #[test]
    fn test_outcome_reports_run_error_first() {
        let result = outcome(
            Err(PaintError::DeviceLost("fence".to_string())),
            Err(PaintError::SubmissionFailed("cleanup".to_string())),
        );
        assert!(matches!(result, Err(PaintError::DeviceLost(_))));

        let result = outcome(Ok(3), Err(PaintError::SubmissionFailed("cleanup".to_string())));
        assert!(matches!(result, Err(PaintError::SubmissionFailed(_))));
    }
}
